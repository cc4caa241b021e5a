pub mod browser;
pub mod core;
pub mod diagnostics;
pub mod errors;
pub mod executor;
pub mod locator;
pub mod reset;
pub mod runner;
pub mod scenario;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod utils;
pub mod waiter;

pub use browser::{ChromeBrowser, Session, SessionState};
pub use crate::core::{BrowserTrait, Config};
pub use diagnostics::{DiagnosticEvent, DiagnosticsCollector, DiagnosticsLog, Severity};
pub use errors::{FailureReason, HarnessError, Result};
pub use executor::{StepExecutor, StepOutput};
pub use locator::{LocatorResolver, LocatorSpec, Resolution};
pub use reset::StateReset;
pub use runner::{Failure, RunReport, RunStatus, RunnerState, ScenarioRunner};
pub use scenario::{Scenario, ScenarioFile, ScenarioStep, Step, Tolerance};
pub use types::*;
pub use waiter::{ConditionWaiter, TextMatch};
