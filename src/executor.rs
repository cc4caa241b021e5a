use crate::browser::{NavigationManager, Session};
use crate::core::BrowserTrait;
use crate::diagnostics::DiagnosticsCollector;
use crate::errors::{HarnessError, Result};
use crate::locator::{LocatorResolver, LocatorSpec, Resolution};
use crate::reset::StateReset;
use crate::scenario::Step;
use crate::types::ClickMode;
use crate::waiter::ConditionWaiter;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a successful step produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutput {
    Done,
    /// JSON value of an `Evaluate` step
    Value(Value),
    /// Where a `Screenshot` step wrote its file
    Screenshot(PathBuf),
}

/// Runs one step against a session.
///
/// Failures come back as `Err` values and are classified through
/// [`HarnessError::reason`]; an unresolved locator is
/// [`HarnessError::ElementNotFound`], which callers may choose to tolerate.
pub struct StepExecutor;

impl StepExecutor {
    pub async fn execute<B: BrowserTrait>(session: &mut Session<B>, step: &Step) -> Result<StepOutput> {
        step.validate()?;
        debug!(session = %session.id(), step = %step, "Executing step");

        let timing = session.config().timing.clone();
        match step {
            Step::WaitForText {
                text,
                timeout_ms,
                mode,
            } => {
                let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(timing.step_timeout());
                ConditionWaiter::wait_for_text(session, text, *mode, timeout).await?;
                Ok(StepOutput::Done)
            }
            Step::WaitForSelector {
                selector,
                timeout_ms,
            } => {
                let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(timing.step_timeout());
                ConditionWaiter::wait_for_selector(session, selector, timeout).await?;
                Ok(StepOutput::Done)
            }
            Step::Pause { duration_ms } => {
                let requested = Duration::from_millis(*duration_ms);
                let capped = requested.min(timing.step_timeout());
                if capped < requested {
                    warn!(
                        requested_ms = *duration_ms,
                        step_timeout_ms = timing.step_timeout_ms,
                        "Pause capped at the step timeout"
                    );
                }
                tokio::time::sleep(capped).await;
                Ok(StepOutput::Done)
            }
            _ => match tokio::time::timeout(timing.step_timeout(), Self::perform(session, step)).await {
                Ok(result) => result,
                Err(_) => Err(HarnessError::timeout(
                    format!("step '{}' to finish", step),
                    timing.step_timeout_ms,
                )),
            },
        }
    }

    async fn perform<B: BrowserTrait>(session: &mut Session<B>, step: &Step) -> Result<StepOutput> {
        match step {
            Step::Navigate { url } => {
                session.navigate(url).await?;
                let navigation_timeout =
                    Duration::from_millis(session.config().browser.navigation_timeout_ms);
                let loaded = NavigationManager::wait_for_document_parsed(
                    session.browser(),
                    session.tab()?,
                    navigation_timeout,
                    session.config().timing.poll_interval(),
                )
                .await?;
                info!(url = %url, ready_state = %loaded.ready_state, duration_ms = loaded.duration_ms, "Page loaded");
                Ok(StepOutput::Done)
            }
            Step::ResetState => {
                StateReset::reset(session).await?;
                Ok(StepOutput::Done)
            }
            Step::Click { locator } => {
                Self::click(session, locator).await?;
                Self::settle(session).await;
                Ok(StepOutput::Done)
            }
            Step::Evaluate { script } => {
                let tab = session.require_navigated()?;
                let value = session.browser().execute_script(tab, script).await?;
                debug!(result = %value, "Script evaluated");
                Self::settle(session).await;
                Ok(StepOutput::Value(value))
            }
            Step::KeyPress { key, repeat } => {
                let tab = session.require_navigated()?;
                for _ in 0..*repeat {
                    session.browser().press_key(tab, key).await?;
                }
                Self::settle(session).await;
                Ok(StepOutput::Done)
            }
            Step::Screenshot {
                path,
                element,
                full_page,
            } => {
                let saved =
                    DiagnosticsCollector::screenshot(session, path, element.as_ref(), *full_page).await?;
                Ok(StepOutput::Screenshot(saved))
            }
            Step::WaitForText { .. } | Step::WaitForSelector { .. } | Step::Pause { .. } => {
                Err(HarnessError::Precondition(format!(
                    "'{}' is not a single interaction",
                    step.kind()
                )))
            }
        }
    }

    async fn click<B: BrowserTrait>(session: &Session<B>, locator: &LocatorSpec) -> Result<()> {
        let element = match LocatorResolver::resolve(session, locator).await? {
            Resolution::Found(element) => element,
            Resolution::NotFound => return Err(HarnessError::ElementNotFound(locator.to_string())),
        };

        // Obscured controls never receive pointer events.
        let mode = if element.visible {
            session.config().locator.visible_click
        } else {
            ClickMode::Script
        };
        debug!(locator = %locator, mode = ?mode, "Clicking element");
        session.browser().click(session.tab()?, &element, mode).await
    }

    async fn settle<B: BrowserTrait>(session: &Session<B>) {
        let settle = session.config().timing.settle();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
    }
}
