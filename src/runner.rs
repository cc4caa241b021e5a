//! Drives a scenario through one browser session.
//!
//! ```text
//! Idle -> SessionOpen -> Running -> {Completed, Failed} -> Closed
//! ```
//!
//! The session is opened at the start of [`ScenarioRunner::run`] and closed
//! on every exit path before the report is returned.

use crate::browser::Session;
use crate::core::{BrowserTrait, Config};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsCollector};
use crate::errors::{FailureReason, HarnessError};
use crate::executor::{StepExecutor, StepOutput};
use crate::scenario::{Scenario, ScenarioStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    SessionOpen,
    Running,
    Completed,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    /// Failed, but the step's tolerance covered the reason
    Tolerated,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: &'static str,
    pub description: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerated: Option<FailureReason>,
}

/// Why a run failed, with the artifacts collected for triage.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    /// None when the run failed before its first step
    pub step_index: Option<usize>,
    pub label: Option<String>,
    pub reason: FailureReason,
    pub message: String,
    pub screenshot_path: Option<PathBuf>,
    pub screenshot_error: Option<String>,
    pub console_log: Vec<DiagnosticEvent>,
    pub state_probe: Option<Value>,
}

impl Failure {
    fn before_steps(err: &HarnessError) -> Self {
        Self {
            step_index: None,
            label: None,
            reason: err.reason(),
            message: err.to_string(),
            screenshot_path: None,
            screenshot_error: None,
            console_log: Vec::new(),
            state_probe: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps_executed: usize,
    pub steps: Vec<StepRecord>,
    pub failure: Option<Failure>,
    pub diagnostics: Vec<DiagnosticEvent>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }

    pub async fn write_json(&self, path: &Path) -> crate::errors::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

/// One-shot: a runner executes a single scenario, then stays `Closed`.
pub struct ScenarioRunner {
    config: Config,
    base_url: Option<Url>,
    state: RunnerState,
    transitions: Vec<RunnerState>,
}

impl ScenarioRunner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            base_url: None,
            state: RunnerState::Idle,
            transitions: vec![RunnerState::Idle],
        }
    }

    /// Takes precedence over the scenario's own base URL.
    pub fn with_base_url(mut self, base_url: Option<Url>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn transitions(&self) -> &[RunnerState] {
        &self.transitions
    }

    fn enter(&mut self, state: RunnerState) {
        info!(from = ?self.state, to = ?state, "Runner state change");
        self.state = state;
        self.transitions.push(state);
    }

    pub async fn run<B: BrowserTrait>(&mut self, browser: B, scenario: &Scenario) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport {
            scenario: scenario.name.clone(),
            status: RunStatus::Failed,
            started_at: Utc::now(),
            duration_ms: 0,
            steps_executed: 0,
            steps: Vec::new(),
            failure: None,
            diagnostics: Vec::new(),
        };

        if self.state != RunnerState::Idle {
            let err = HarnessError::Precondition("runner has already run a scenario".to_string());
            report.failure = Some(Failure::before_steps(&err));
            return report;
        }

        let base_url = match scenario.validate().and_then(|_| scenario.base_url()) {
            Ok(url) => self.base_url.clone().or(url),
            Err(e) => return self.abort(report, e, started),
        };

        let mut session = match Session::open(browser, self.config.clone()).await {
            Ok(session) => session.with_base_url(base_url),
            Err(e) => return self.abort(report, e, started),
        };
        self.enter(RunnerState::SessionOpen);

        info!(scenario = %scenario.name, steps = scenario.len(), session = %session.id(), "Running scenario");
        self.enter(RunnerState::Running);
        let deadline = started + self.config.timing.run_timeout();

        for (index, scenario_step) in scenario.steps.iter().enumerate() {
            let step_started = Instant::now();
            let result = match tokio::time::timeout_at(
                deadline,
                StepExecutor::execute(&mut session, &scenario_step.step),
            )
            .await
            {
                Ok(result) => result.map_err(|e| (e, false)),
                // The run deadline is never tolerated.
                Err(_) => Err((
                    HarnessError::timeout(
                        format!("scenario '{}' to finish", scenario.name),
                        self.config.timing.run_timeout_ms,
                    ),
                    true,
                )),
            };
            report.steps_executed += 1;
            let duration_ms = step_started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    info!(step = index, action = scenario_step.step.kind(), duration_ms, "Step passed");
                    report.steps.push(record(index, scenario_step, StepStatus::Passed, duration_ms, Some(output), None));
                }
                Err((e, false)) if scenario_step.tolerance.tolerates(e.reason()) => {
                    warn!(step = index, reason = %e.reason(), error = %e, "Step failed within its tolerance, continuing");
                    report.steps.push(record(
                        index,
                        scenario_step,
                        StepStatus::Tolerated,
                        duration_ms,
                        None,
                        Some(e.reason()),
                    ));
                }
                Err((e, _)) => {
                    report.failure = Some(self.diagnose(&session, index, scenario_step, e).await);
                    break;
                }
            }
        }

        if report.failure.is_none() {
            report.status = RunStatus::Completed;
            self.enter(RunnerState::Completed);
            info!(scenario = %scenario.name, steps = report.steps_executed, "Scenario completed");
        } else {
            self.enter(RunnerState::Failed);
        }

        report.diagnostics = session.diagnostics().snapshot();
        if let Err(e) = session.close().await {
            warn!(error = %e, "Session close reported an error");
        }
        self.enter(RunnerState::Closed);
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Failure before any step could run: nothing to capture.
    fn abort(&mut self, mut report: RunReport, err: HarnessError, started: Instant) -> RunReport {
        error!(reason = %err.reason(), error = %err, "Scenario could not start");
        report.failure = Some(Failure::before_steps(&err));
        self.enter(RunnerState::Failed);
        self.enter(RunnerState::Closed);
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    async fn diagnose<B: BrowserTrait>(
        &self,
        session: &Session<B>,
        index: usize,
        step: &ScenarioStep,
        err: HarnessError,
    ) -> Failure {
        let reason = err.reason();
        error!(step = index, description = %step.describe(), reason = %reason, "Step failed: {}", err);

        let mut failure = Failure {
            step_index: Some(index),
            label: Some(step.describe()),
            reason,
            message: err.to_string(),
            screenshot_path: None,
            screenshot_error: None,
            console_log: Vec::new(),
            state_probe: None,
        };

        let artifacts = &self.config.artifacts;
        let step_timeout = self.config.timing.step_timeout();
        if artifacts.screenshot_on_failure {
            let path = PathBuf::from(format!("failure-step-{}.png", index));
            let capture = tokio::time::timeout(
                step_timeout,
                DiagnosticsCollector::screenshot(session, &path, None, true),
            )
            .await
            .unwrap_or_else(|_| Err(HarnessError::timeout("failure screenshot", self.config.timing.step_timeout_ms)));
            match capture {
                Ok(saved) => failure.screenshot_path = Some(saved),
                Err(e) => {
                    warn!(error = %e, "Failure screenshot not captured");
                    failure.screenshot_error = Some(e.to_string());
                }
            }
        }

        if let Some(probe) = &artifacts.failure_probe {
            let evaluated = match session.tab() {
                Ok(tab) => tokio::time::timeout(step_timeout, session.browser().execute_script(tab, probe))
                    .await
                    .unwrap_or_else(|_| Err(HarnessError::timeout("state probe", self.config.timing.step_timeout_ms))),
                Err(e) => Err(e),
            };
            match evaluated {
                Ok(value) => {
                    info!(probe = %probe, value = %value, "Application state at failure");
                    failure.state_probe = Some(value);
                }
                Err(e) => warn!(probe = %probe, error = %e, "State probe failed"),
            }
        }

        failure.console_log = session.diagnostics().snapshot();
        DiagnosticsCollector::emit(&failure.console_log);
        failure
    }
}

fn record(
    index: usize,
    step: &ScenarioStep,
    status: StepStatus,
    duration_ms: u64,
    output: Option<StepOutput>,
    tolerated: Option<FailureReason>,
) -> StepRecord {
    StepRecord {
        index,
        action: step.step.kind(),
        description: step.describe(),
        status,
        duration_ms,
        output,
        tolerated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;
    use crate::locator::LocatorSpec;
    use crate::scenario::Step;
    use crate::testing::{FakeBrowser, Reaction};
    use serde_json::json;
    use std::time::Duration;

    const MUSIC_LAB: &str = r#"
        <h1>Music Lab</h1>
        <p>Step 1: The Kick</p>
        <canvas width="800" height="600"></canvas>
        <div style="opacity: 0">
            <button data-testid="toggle-step-1" aria-label="Toggle kick step 1">1</button>
            <button data-testid="toggle-step-5" aria-label="Toggle kick step 5">5</button>
        </div>
    "#;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.artifacts.dir = dir.to_path_buf();
        config.timing.settle_ms = 10;
        config
    }

    fn music_lab(html: &str) -> FakeBrowser {
        let browser = FakeBrowser::new();
        browser.route("http://localhost:3000/", html);
        browser.on_click(
            r#"[aria-label="Toggle kick step 1"]"#,
            Reaction::persist("musicLabState", r#"{"stage":2}"#, "<p>Step 2: The Snap</p>"),
        );
        browser
    }

    fn tutorial() -> Scenario {
        Scenario::new("music lab tutorial")
            .with_base_url("http://localhost:3000")
            .step(Step::navigate("/"))
            .step(Step::ResetState)
            .step(Step::click(LocatorSpec::test_id("toggle-step-1")))
            .step(Step::wait_for_text("Step 2", 5000))
    }

    #[tokio::test]
    async fn test_empty_scenario_completes() {
        let dir = tempfile::tempdir().unwrap();
        let browser = FakeBrowser::new();
        let mut runner = ScenarioRunner::new(config(dir.path()));

        let report = runner.run(browser.clone(), &Scenario::new("empty")).await;

        assert!(report.passed());
        assert_eq!(report.steps_executed, 0);
        assert_eq!(runner.state(), RunnerState::Closed);
        assert!(!browser.is_running());
    }

    #[tokio::test]
    async fn test_tutorial_completes() {
        let dir = tempfile::tempdir().unwrap();
        let browser = music_lab(MUSIC_LAB);
        let mut runner = ScenarioRunner::new(config(dir.path()));

        let report = runner.run(browser.clone(), &tutorial()).await;

        assert!(report.passed(), "{:?}", report.failure);
        assert_eq!(report.steps_executed, 4);
        assert_eq!(
            runner.transitions(),
            &[
                RunnerState::Idle,
                RunnerState::SessionOpen,
                RunnerState::Running,
                RunnerState::Completed,
                RunnerState::Closed,
            ]
        );
        assert_eq!(browser.storage().get("musicLabState").map(String::as_str), Some(r#"{"stage":2}"#));
        assert!(!browser.is_running());
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_renamed_identifier_fails_with_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let renamed = MUSIC_LAB.replace("toggle-step-1", "kick-step-1");
        let browser = music_lab(&renamed);
        let mut runner = ScenarioRunner::new(config(dir.path()));

        let report = runner.run(browser.clone(), &tutorial()).await;

        assert_eq!(report.status, RunStatus::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.reason, FailureReason::NotFound);
        assert_eq!(failure.step_index, Some(2));
        let screenshot = failure.screenshot_path.unwrap();
        assert_eq!(screenshot, dir.path().join("failure-step-2.png"));
        assert!(!std::fs::read(&screenshot).unwrap().is_empty());
        assert_eq!(report.steps_executed, 3);
        assert_eq!(runner.state(), RunnerState::Closed);
        assert!(!browser.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_view_times_out() {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/garage", "<h1>Pit Crew</h1><p>Warming up</p>");
        browser.reveal_after("http://app.test/garage", Duration::from_millis(3000), "Telemetry online");
        browser.script_result("localStorage", json!("{\"pitStops\":0}"));
        let mut config = Config::default();
        config.artifacts.screenshot_on_failure = false;
        config.artifacts.failure_probe = Some("localStorage.getItem('pitCrewState')".to_string());
        let scenario = Scenario::new("slow telemetry")
            .step(Step::navigate("http://app.test/garage"))
            .step(Step::wait_for_text("Telemetry online", 1000));

        let report = ScenarioRunner::new(config).run(browser, &scenario).await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.reason, FailureReason::TimeoutExceeded);
        assert_eq!(failure.step_index, Some(1));
        assert_eq!(failure.state_probe, Some(json!("{\"pitStops\":0}")));
        assert!(failure.screenshot_path.is_none());
        assert_eq!(report.duration_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_order_is_observable() {
        let browser = FakeBrowser::new();
        browser.route(
            "http://app.test/",
            r#"<button data-testid="select-kick">Kick</button><button data-testid="add-step">Add</button>"#,
        );
        browser.on_click(r#"[data-testid="select-kick"]"#, Reaction::append("<p>Kick selected</p>"));
        browser.on_click(
            r#"[data-testid="add-step"]"#,
            Reaction::append("<p>Step added</p>").requires_text("Kick selected"),
        );
        let mut config = Config::default();
        config.artifacts.screenshot_on_failure = false;
        let scenario = |first: &str, second: &str| {
            Scenario::new("ordering")
                .step(Step::navigate("http://app.test/"))
                .step(Step::click(LocatorSpec::test_id(first)))
                .step(Step::click(LocatorSpec::test_id(second)))
                .step(Step::wait_for_text("Step added", 500))
        };

        let forward = ScenarioRunner::new(config.clone())
            .run(browser.clone(), &scenario("select-kick", "add-step"))
            .await;
        let backward = ScenarioRunner::new(config)
            .run(browser, &scenario("add-step", "select-kick"))
            .await;

        assert!(forward.passed());
        let failure = backward.failure.unwrap();
        assert_eq!(failure.reason, FailureReason::TimeoutExceeded);
        assert_eq!(failure.step_index, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_intro_is_tolerated() {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/", "<p>Welcome back</p>");
        let mut config = Config::default();
        config.artifacts.screenshot_on_failure = false;
        let scenario = Scenario::new("returning visitor")
            .step(Step::navigate("http://app.test/"))
            .optional(Step::click(LocatorSpec::role("button", Some("Let's Make a Beat"))))
            .labeled("dismiss intro")
            .step(Step::wait_for_text("Welcome back", 100));

        let report = ScenarioRunner::new(config).run(browser, &scenario).await;

        assert!(report.passed());
        assert_eq!(report.steps[1].status, StepStatus::Tolerated);
        assert_eq!(report.steps[1].tolerated, Some(FailureReason::NotFound));
        assert_eq!(report.steps[1].description, "dismiss intro");
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_step_does_not_tolerate_timeouts() {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/", "<p>Loading</p>");
        let mut config = Config::default();
        config.artifacts.screenshot_on_failure = false;
        let scenario = Scenario::new("checkpoint")
            .step(Step::navigate("http://app.test/"))
            .optional(Step::wait_for_text("Ready", 200))
            .best_effort(Step::wait_for_text("Ready", 200));

        let report = ScenarioRunner::new(config).run(browser, &scenario).await;

        assert_eq!(report.failure.unwrap().step_index, Some(1));
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let mut runner = ScenarioRunner::new(Config::default());
        let report = runner
            .run(FakeBrowser::failing_launch("no chrome"), &tutorial())
            .await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.reason, FailureReason::LaunchError);
        assert_eq!(failure.step_index, None);
        assert_eq!(report.steps_executed, 0);
        assert_eq!(runner.state(), RunnerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_overrides_tolerance() {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/", "<p>Idle</p>");
        let mut config = Config::default();
        config.artifacts.screenshot_on_failure = false;
        config.timing.run_timeout_ms = 300;
        let scenario = Scenario::new("long pause")
            .step(Step::navigate("http://app.test/"))
            .best_effort(Step::Pause { duration_ms: 1000 })
            .step(Step::navigate("http://app.test/"));

        let report = ScenarioRunner::new(config).run(browser, &scenario).await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.reason, FailureReason::TimeoutExceeded);
        assert_eq!(failure.step_index, Some(1));
        assert_eq!(report.duration_ms, 300);
    }

    #[tokio::test]
    async fn test_failure_carries_diagnostics_and_screenshot_errors() {
        let dir = tempfile::tempdir().unwrap();
        let browser = music_lab(MUSIC_LAB);
        browser.log_on_load("http://localhost:3000/", Severity::Error, "AudioContext was not allowed to start");
        browser.on_click(
            r#"[aria-label="Toggle kick step 5"]"#,
            Reaction::page_error("TypeError: sampler is undefined"),
        );
        browser.fail_screenshots("target closed");
        let scenario = Scenario::new("broken sampler")
            .with_base_url("http://localhost:3000")
            .step(Step::navigate("/"))
            .step(Step::click(LocatorSpec::attribute("aria-label", "Toggle kick step 5")))
            .step(Step::wait_for_text("Step 3", 100));

        let report = ScenarioRunner::new(config(dir.path())).run(browser, &scenario).await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.reason, FailureReason::TimeoutExceeded);
        assert!(failure.screenshot_path.is_none());
        assert!(failure.screenshot_error.unwrap().contains("target closed"));
        assert_eq!(failure.console_log.len(), 2);
        assert!(failure.console_log.iter().all(DiagnosticEvent::is_error));
        assert!(matches!(
            &failure.console_log[1],
            DiagnosticEvent::PageError { message, .. } if message.contains("sampler")
        ));
    }

    #[tokio::test]
    async fn test_runner_is_single_use() {
        let mut runner = ScenarioRunner::new(Config::default());
        runner.run(FakeBrowser::new(), &Scenario::new("first")).await;

        let browser = FakeBrowser::new();
        let report = runner.run(browser.clone(), &Scenario::new("second")).await;

        assert_eq!(report.failure.unwrap().reason, FailureReason::PreconditionError);
        assert!(!browser.is_running());
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let report = ScenarioRunner::new(config(dir.path()))
            .run(music_lab(MUSIC_LAB), &tutorial())
            .await;
        let path = dir.path().join("reports/run.json");

        report.write_json(&path).await.unwrap();

        let json: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["steps"][2]["action"], "click");
        assert!(json["failure"].is_null());
    }
}
