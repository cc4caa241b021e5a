use crate::types::{ClickMode, Viewport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub browser: BrowserConfig,
    pub locator: LocatorConfig,
    pub timing: TimingConfig,
    pub artifacts: ArtifactConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: Viewport,
    pub user_agent: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub args: Vec<String>,
    pub navigation_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Attributes consulted, in order, when resolving a test id.
    pub test_attributes: Vec<String>,
    /// Click mode used for visible elements. Non-visible elements are
    /// always clicked by script.
    pub visible_click: ClickMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
    pub step_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub dir: PathBuf,
    pub screenshot_on_failure: bool,
    /// Script evaluated after a failure; its value lands in the report.
    pub failure_probe: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport::default(),
            user_agent: None,
            chrome_path: None,
            args: vec![],
            navigation_timeout_ms: 30_000,
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            test_attributes: vec!["data-testid".into(), "data-test".into(), "id".into()],
            visible_click: ClickMode::Pointer,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 100,
            poll_interval_ms: 50,
            step_timeout_ms: 30_000,
            run_timeout_ms: 300_000,
            reset_timeout_ms: 10_000,
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("verification"),
            screenshot_on_failure: true,
            failure_probe: None,
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        // a zero interval would spin
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

impl ArtifactConfig {
    /// Relative artifact paths land under `dir`; absolute ones are kept.
    pub fn resolve(&self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        if path.is_absolute() {
            path
        } else {
            self.dir.join(path)
        }
    }
}
