use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timed out after {timeout_ms}ms waiting for {condition}")]
    Timeout { condition: String, timeout_ms: u64 },

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("JavaScript execution failed: {0}")]
    JavaScriptFailed(String),

    #[error("Screenshot failed: {0}")]
    ScreenshotFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Scenario parse error: {0}")]
    ScenarioParse(#[from] toml::de::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Chrome error: {0}")]
    ChromeError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

// headless_chrome reports everything as anyhow::Error
impl From<anyhow::Error> for HarnessError {
    fn from(err: anyhow::Error) -> Self {
        HarnessError::ChromeError(err.to_string())
    }
}

/// Coarse classification of a failed step, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    LaunchError,
    PreconditionError,
    NotFound,
    TimeoutExceeded,
    UnexpectedException,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureReason::LaunchError => "LaunchError",
            FailureReason::PreconditionError => "PreconditionError",
            FailureReason::NotFound => "NotFound",
            FailureReason::TimeoutExceeded => "TimeoutExceeded",
            FailureReason::UnexpectedException => "UnexpectedException",
        };
        f.write_str(name)
    }
}

impl HarnessError {
    pub fn timeout(condition: impl Into<String>, timeout_ms: u64) -> Self {
        HarnessError::Timeout {
            condition: condition.into(),
            timeout_ms,
        }
    }

    /// Errors a poll may retry: the page's script context went away
    /// because a navigation or reload replaced the document.
    pub fn is_transient(&self) -> bool {
        const CONTEXT_GONE: [&str; 3] = [
            "Execution context was destroyed",
            "Cannot find context with specified id",
            "Inspected target navigated or closed",
        ];
        match self {
            HarnessError::JavaScriptFailed(message) | HarnessError::ChromeError(message) => {
                CONTEXT_GONE.iter().any(|needle| message.contains(needle))
            }
            _ => false,
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            HarnessError::LaunchFailed(_) => FailureReason::LaunchError,
            HarnessError::Precondition(_) => FailureReason::PreconditionError,
            HarnessError::ElementNotFound(_) => FailureReason::NotFound,
            HarnessError::Timeout { .. } => FailureReason::TimeoutExceeded,
            _ => FailureReason::UnexpectedException,
        }
    }
}
