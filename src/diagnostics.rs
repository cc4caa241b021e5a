//! Console and page-error capture for a session, plus screenshot artifacts.
//!
//! The driver's listener threads append to a [`DiagnosticsLog`] while the
//! foreground flow executes steps. Appending is the only mutation; the log
//! is sealed when the session closes and is never cleared.

use crate::browser::Session;
use crate::core::BrowserTrait;
use crate::errors::{HarnessError, Result};
use crate::locator::{LocatorResolver, LocatorSpec, Resolution};
use crate::types::Capture;
use crate::utils::screenshot::ScreenshotManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Log,
    Warning,
    Error,
}

impl Severity {
    /// Map a CDP `consoleAPICalled` type onto a severity.
    pub fn from_console_type(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Severity::Debug,
            "info" => Severity::Info,
            "warning" | "warn" => Severity::Warning,
            "error" | "assert" => Severity::Error,
            _ => Severity::Log,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    Console {
        severity: Severity,
        text: String,
        timestamp: DateTime<Utc>,
    },
    PageError {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DiagnosticEvent {
    pub fn console(severity: Severity, text: impl Into<String>) -> Self {
        DiagnosticEvent::Console {
            severity,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn page_error(message: impl Into<String>) -> Self {
        DiagnosticEvent::PageError {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DiagnosticEvent::PageError { .. }
                | DiagnosticEvent::Console {
                    severity: Severity::Error,
                    ..
                }
        )
    }
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<DiagnosticEvent>,
    sealed: bool,
}

/// Shared, append-only, ordered event log.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsLog {
    inner: Arc<Mutex<LogState>>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        // A panicking listener must not take the log down with it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if the log was already sealed and the event dropped.
    pub fn append(&self, event: DiagnosticEvent) -> bool {
        let mut state = self.state();
        if state.sealed {
            return false;
        }
        state.events.push(event);
        true
    }

    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.state().events.clone()
    }

    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn error_count(&self) -> usize {
        self.state().events.iter().filter(|e| e.is_error()).count()
    }

    pub fn seal(&self) {
        self.state().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.state().sealed
    }
}

/// Owns the diagnostics log of one session.
pub struct DiagnosticsCollector {
    log: DiagnosticsLog,
    attached: bool,
}

impl DiagnosticsCollector {
    pub fn new() -> Self {
        Self {
            log: DiagnosticsLog::new(),
            attached: false,
        }
    }

    /// Must run before the first navigation, or early events are lost.
    pub async fn attach<B: BrowserTrait>(&mut self, browser: &B, tab: &B::TabHandle) -> Result<()> {
        if self.attached {
            return Ok(());
        }
        browser.subscribe(tab, self.log.clone()).await?;
        self.attached = true;
        debug!("Diagnostics listeners attached");
        Ok(())
    }

    pub fn detach(&mut self) {
        if self.attached {
            self.log.seal();
            self.attached = false;
            debug!(events = self.log.len(), "Diagnostics listeners detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn log(&self) -> &DiagnosticsLog {
        &self.log
    }

    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.log.snapshot()
    }

    /// Re-emit events through tracing, keyed by severity.
    pub fn emit(events: &[DiagnosticEvent]) {
        if events.is_empty() {
            info!("Browser diagnostics: no console output");
            return;
        }
        info!(count = events.len(), "Browser diagnostics");
        for event in events {
            match event {
                DiagnosticEvent::Console { severity, text, .. } => match severity {
                    Severity::Error => error!("Browser console [error]: {}", text),
                    Severity::Warning => warn!("Browser console [warning]: {}", text),
                    Severity::Debug => debug!("Browser console [debug]: {}", text),
                    Severity::Info | Severity::Log => info!("Browser console [{:?}]: {}", severity, text),
                },
                DiagnosticEvent::PageError { message, .. } => {
                    error!("Browser page error: {}", message)
                }
            }
        }
    }

    /// Capture the viewport, the full page, or one element's region to
    /// `path`. An element takes precedence over `full_page`.
    ///
    /// Relative paths resolve under the configured artifacts directory.
    /// A missing element is an error; nothing is written in that case.
    pub async fn screenshot<B: BrowserTrait>(
        session: &Session<B>,
        path: &Path,
        element: Option<&LocatorSpec>,
        full_page: bool,
    ) -> Result<PathBuf> {
        let target = session.config().artifacts.resolve(path);
        let capture = match element {
            None if full_page => Capture::FullPage,
            None => Capture::Viewport,
            Some(spec) => match LocatorResolver::resolve(session, spec).await? {
                Resolution::Found(element) => match element.rect {
                    Some(rect) if !rect.is_empty() => Capture::Region(rect),
                    _ => {
                        return Err(HarnessError::ScreenshotFailed(format!(
                            "{} has no rendered area",
                            spec
                        )))
                    }
                },
                Resolution::NotFound => {
                    return Err(HarnessError::ElementNotFound(format!(
                        "screenshot target {}",
                        spec
                    )))
                }
            },
        };

        let bytes = ScreenshotManager::capture(session.browser(), session.tab()?, capture).await?;
        ScreenshotManager::save_to_file(&bytes, &target).await?;
        info!(path = %target.display(), bytes = bytes.len(), "Screenshot saved");
        Ok(target)
    }
}

impl Default for DiagnosticsCollector {
    fn default() -> Self {
        Self::new()
    }
}
