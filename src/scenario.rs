//! Scenario definitions: an ordered, immutable list of steps.
//!
//! Scenarios are usually written as TOML:
//!
//! ```toml
//! name = "music lab tutorial"
//! base_url = "http://localhost:3000"
//!
//! [config.timing]
//! settle_ms = 100
//!
//! [[steps]]
//! action = "navigate"
//! url = "/music-lab"
//!
//! [[steps]]
//! action = "reset_state"
//!
//! [[steps]]
//! action = "click"
//! tolerance = "optional"
//! locator = { role = "button", name = "Let's Make a Beat" }
//!
//! [[steps]]
//! action = "wait_for_text"
//! text = "Step 2: The Snap"
//! timeout_ms = 5000
//! ```

use crate::core::Config;
use crate::errors::{FailureReason, HarnessError, Result};
use crate::locator::{check_css, LocatorSpec};
use crate::waiter::TextMatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Navigate {
        url: String,
    },
    ResetState,
    Click {
        locator: LocatorSpec,
    },
    /// Script body or function source run in the page. Its JSON value is
    /// returned to the caller.
    Evaluate {
        script: String,
    },
    WaitForText {
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default, rename = "match")]
        mode: TextMatch,
    },
    WaitForSelector {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Screenshot {
        path: PathBuf,
        /// Capture only this element's rendered region
        #[serde(default)]
        element: Option<LocatorSpec>,
        /// Capture the whole scrollable page instead of the viewport
        #[serde(default)]
        full_page: bool,
    },
    KeyPress {
        key: String,
        #[serde(default = "default_repeat")]
        repeat: u32,
    },
    Pause {
        duration_ms: u64,
    },
}

fn default_repeat() -> u32 {
    1
}

impl Step {
    pub fn navigate(url: impl Into<String>) -> Self {
        Step::Navigate { url: url.into() }
    }

    pub fn click(locator: LocatorSpec) -> Self {
        Step::Click { locator }
    }

    pub fn evaluate(script: impl Into<String>) -> Self {
        Step::Evaluate {
            script: script.into(),
        }
    }

    pub fn wait_for_text(text: impl Into<String>, timeout_ms: u64) -> Self {
        Step::WaitForText {
            text: text.into(),
            timeout_ms: Some(timeout_ms),
            mode: TextMatch::Contains,
        }
    }

    pub fn wait_for_selector(selector: impl Into<String>, timeout_ms: u64) -> Self {
        Step::WaitForSelector {
            selector: selector.into(),
            timeout_ms: Some(timeout_ms),
        }
    }

    pub fn screenshot(path: impl Into<PathBuf>) -> Self {
        Step::Screenshot {
            path: path.into(),
            element: None,
            full_page: false,
        }
    }

    pub fn full_page_screenshot(path: impl Into<PathBuf>) -> Self {
        Step::Screenshot {
            path: path.into(),
            element: None,
            full_page: true,
        }
    }

    pub fn key_press(key: impl Into<String>, repeat: u32) -> Self {
        Step::KeyPress {
            key: key.into(),
            repeat,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Navigate { .. } => "navigate",
            Step::ResetState => "reset_state",
            Step::Click { .. } => "click",
            Step::Evaluate { .. } => "evaluate",
            Step::WaitForText { .. } => "wait_for_text",
            Step::WaitForSelector { .. } => "wait_for_selector",
            Step::Screenshot { .. } => "screenshot",
            Step::KeyPress { .. } => "key_press",
            Step::Pause { .. } => "pause",
        }
    }

    /// Waits carry their own timeout; everything else runs under the
    /// per-step timeout.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Step::WaitForText { .. } | Step::WaitForSelector { .. })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(HarnessError::ConfigurationError(message));
        match self {
            Step::Navigate { url } if url.trim().is_empty() => invalid("navigate needs a url".into()),
            Step::Click { locator } => locator.validate(),
            Step::Screenshot { path, .. } if path.as_os_str().is_empty() => {
                invalid("screenshot needs a path".into())
            }
            Step::Screenshot {
                element: Some(_),
                full_page: true,
                ..
            } => invalid("screenshot takes either an element or full_page, not both".into()),
            Step::Screenshot {
                element: Some(locator),
                ..
            } => locator.validate(),
            Step::Evaluate { script } if script.trim().is_empty() => {
                invalid("evaluate needs a script".into())
            }
            Step::WaitForText { text, .. } if text.trim().is_empty() => {
                invalid("wait_for_text needs text".into())
            }
            Step::WaitForText {
                text,
                mode: TextMatch::Regex,
                ..
            } => regex::Regex::new(text)
                .map(|_| ())
                .map_err(|e| HarnessError::ConfigurationError(format!("invalid text pattern: {}", e))),
            Step::WaitForSelector { selector, .. } if selector.trim().is_empty() => {
                invalid("wait_for_selector needs a selector".into())
            }
            Step::WaitForSelector { selector, .. } => check_css(selector),
            Step::KeyPress { key, repeat } if key.is_empty() || *repeat == 0 => {
                invalid("key_press needs a key and a repeat count of at least 1".into())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Navigate { url } => write!(f, "navigate to {}", url),
            Step::ResetState => write!(f, "reset persisted state"),
            Step::Click { locator } => write!(f, "click {}", locator),
            Step::Evaluate { script } => {
                let first_line = script.trim().lines().next().unwrap_or_default();
                write!(f, "evaluate `{}`", first_line)
            }
            Step::WaitForText { text, .. } => write!(f, "wait for text '{}'", text),
            Step::WaitForSelector { selector, .. } => write!(f, "wait for selector '{}'", selector),
            Step::Screenshot {
                path,
                element: Some(locator),
                ..
            } => write!(f, "screenshot {} of {}", path.display(), locator),
            Step::Screenshot {
                path,
                full_page: true,
                ..
            } => write!(f, "full-page screenshot {}", path.display()),
            Step::Screenshot { path, .. } => write!(f, "screenshot {}", path.display()),
            Step::KeyPress { key, repeat } if *repeat > 1 => write!(f, "press {} x{}", key, repeat),
            Step::KeyPress { key, .. } => write!(f, "press {}", key),
            Step::Pause { duration_ms } => write!(f, "pause {}ms", duration_ms),
        }
    }
}

/// Which failures a step may absorb without failing the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    #[default]
    Required,
    /// A missing element is fine, e.g. an intro dialog that may not show.
    Optional,
    /// Missing elements and timeouts are both fine.
    BestEffort,
}

impl Tolerance {
    pub fn tolerates(&self, reason: FailureReason) -> bool {
        match self {
            Tolerance::Required => false,
            Tolerance::Optional => reason == FailureReason::NotFound,
            Tolerance::BestEffort => matches!(
                reason,
                FailureReason::NotFound | FailureReason::TimeoutExceeded
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(flatten)]
    pub step: Step,
    #[serde(default)]
    pub tolerance: Tolerance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ScenarioStep {
    pub fn describe(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self.step.to_string(),
        }
    }
}

impl From<Step> for ScenarioStep {
    fn from(step: Step) -> Self {
        Self {
            step,
            tolerance: Tolerance::Required,
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: None,
            steps: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn optional(mut self, step: Step) -> Self {
        self.steps.push(ScenarioStep {
            step,
            tolerance: Tolerance::Optional,
            label: None,
        });
        self
    }

    pub fn best_effort(mut self, step: Step) -> Self {
        self.steps.push(ScenarioStep {
            step,
            tolerance: Tolerance::BestEffort,
            label: None,
        });
        self
    }

    /// Attach a label to the most recently added step.
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        if let Some(last) = self.steps.last_mut() {
            last.label = Some(label.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn base_url(&self) -> Result<Option<Url>> {
        self.base_url
            .as_deref()
            .map(|url| Url::parse(url).map_err(HarnessError::from))
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::ConfigurationError(
                "scenario needs a name".to_string(),
            ));
        }
        self.base_url()?;
        for (index, step) in self.steps.iter().enumerate() {
            step.step.validate().map_err(|e| {
                HarnessError::ConfigurationError(format!("step {} ({}): {}", index, step.step.kind(), e))
            })?;
        }
        Ok(())
    }
}

/// On-disk form: a scenario plus an optional `[config]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioFile {
    #[serde(default)]
    pub config: Config,
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

impl ScenarioFile {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ScenarioFile = toml::from_str(content)?;
        Ok(file)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            HarnessError::ConfigurationError(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn into_parts(self) -> (Scenario, Config) {
        let scenario = Scenario {
            name: self.name,
            base_url: self.base_url,
            steps: self.steps,
        };
        (scenario, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MUSIC_LAB: &str = r#"
        name = "music lab tutorial"
        base_url = "http://localhost:3000"

        [config.timing]
        settle_ms = 100

        [config.artifacts]
        failure_probe = "localStorage.getItem('musicLabState')"

        [[steps]]
        action = "navigate"
        url = "/music-lab"

        [[steps]]
        action = "reset_state"

        [[steps]]
        action = "click"
        tolerance = "optional"
        label = "dismiss intro"
        locator = { role = "button", name = "Let's Make a Beat" }

        [[steps]]
        action = "click"
        locator = { attribute = "aria-label", value = "Toggle kick step 1" }

        [[steps]]
        action = "wait_for_text"
        text = "Step 2: The Snap"
        timeout_ms = 5000

        [[steps]]
        action = "key_press"
        key = "ArrowRight"
        repeat = 40

        [[steps]]
        action = "screenshot"
        path = "sequencer.png"
        element = { css = ".w-full.h-\\[600px\\]" }
    "#;

    #[test]
    fn test_parses_scenario_file() {
        let (scenario, config) = ScenarioFile::from_toml_str(MUSIC_LAB).unwrap().into_parts();

        assert_eq!(scenario.name, "music lab tutorial");
        assert_eq!(scenario.len(), 7);
        assert_eq!(scenario.steps[1].step, Step::ResetState);
        assert_eq!(scenario.steps[2].tolerance, Tolerance::Optional);
        assert_eq!(scenario.steps[2].describe(), "dismiss intro");
        assert_eq!(
            scenario.steps[3].step,
            Step::click(LocatorSpec::attribute("aria-label", "Toggle kick step 1"))
        );
        assert_eq!(scenario.steps[4].step, Step::wait_for_text("Step 2: The Snap", 5000));
        assert_eq!(scenario.steps[5].step, Step::key_press("ArrowRight", 40));
        assert!(matches!(
            &scenario.steps[6].step,
            Step::Screenshot { element: Some(LocatorSpec::Css { css, .. }), .. } if css == r".w-full.h-\[600px\]"
        ));
        assert_eq!(
            config.artifacts.failure_probe.as_deref(),
            Some("localStorage.getItem('musicLabState')")
        );
        scenario.validate().unwrap();
    }

    #[test]
    fn test_bundled_scenarios_are_valid() {
        for content in [
            include_str!("../scenarios/music-lab.toml"),
            include_str!("../scenarios/pit-crew.toml"),
        ] {
            let (scenario, _) = ScenarioFile::from_toml_str(content).unwrap().into_parts();
            scenario.validate().unwrap();
        }
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("music-lab.toml");
        std::fs::write(&path, MUSIC_LAB).unwrap();

        let file = tokio_test::block_on(ScenarioFile::load(&path)).unwrap();
        assert_eq!(file.steps.len(), 7);

        let missing = tokio_test::block_on(ScenarioFile::load(&dir.path().join("nope.toml")));
        assert!(matches!(missing, Err(HarnessError::ConfigurationError(_))));
    }

    #[test]
    fn test_validation_reports_step_index() {
        let scenario = Scenario::new("broken")
            .step(Step::navigate("http://app.test/"))
            .step(Step::key_press("ArrowRight", 0));

        let err = scenario.validate().unwrap_err();
        assert!(err.to_string().contains("step 1 (key_press)"));
    }

    #[test]
    fn test_screenshot_validation() {
        let unnamed_region = Step::Screenshot {
            path: PathBuf::new(),
            element: Some(LocatorSpec::css(".sequencer")),
            full_page: false,
        };
        assert!(unnamed_region.validate().unwrap_err().to_string().contains("needs a path"));

        let both = Step::Screenshot {
            path: "grid.png".into(),
            element: Some(LocatorSpec::css(".sequencer")),
            full_page: true,
        };
        assert!(both.validate().is_err());

        assert!(Step::full_page_screenshot("final.png").validate().is_ok());
        assert_eq!(Step::full_page_screenshot("final.png").to_string(), "full-page screenshot final.png");

        let step: ScenarioStep = toml::from_str("action = \"screenshot\"\npath = \"final.png\"\nfull_page = true").unwrap();
        assert_eq!(step.step, Step::full_page_screenshot("final.png"));
    }

    #[test]
    fn test_malformed_wait_selector_is_rejected() {
        let scenario = Scenario::new("typo")
            .step(Step::navigate("http://app.test/"))
            .best_effort(Step::wait_for_selector("div[", 200));

        let err = scenario.validate().unwrap_err();
        assert!(matches!(err, HarnessError::ConfigurationError(_)));
        assert!(err.to_string().contains("step 1 (wait_for_selector)"));
        assert!(Step::wait_for_selector("canvas", 200).validate().is_ok());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let scenario = Scenario::new("x").with_base_url("not a url");
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn test_unknown_action_is_parse_error() {
        let err = ScenarioFile::from_toml_str(
            r#"
            name = "x"
            [[steps]]
            action = "hover"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::ScenarioParse(_)));
    }

    #[test]
    fn test_tolerance_policy() {
        assert!(!Tolerance::Required.tolerates(FailureReason::NotFound));
        assert!(Tolerance::Optional.tolerates(FailureReason::NotFound));
        assert!(!Tolerance::Optional.tolerates(FailureReason::TimeoutExceeded));
        assert!(Tolerance::BestEffort.tolerates(FailureReason::TimeoutExceeded));
        assert!(!Tolerance::BestEffort.tolerates(FailureReason::UnexpectedException));
    }

    #[test]
    fn test_builder_labels_last_step() {
        let scenario = Scenario::new("builder")
            .step(Step::navigate("/"))
            .optional(Step::click(LocatorSpec::text("Skip intro")))
            .labeled("skip intro");

        assert_eq!(scenario.steps[1].tolerance, Tolerance::Optional);
        assert_eq!(scenario.steps[1].label.as_deref(), Some("skip intro"));
        assert_eq!(scenario.steps[0].describe(), "navigate to /");
    }
}
