use crate::core::BrowserTrait;
use crate::errors::{HarnessError, Result};
use std::time::Duration;
use tokio::time::Instant;

pub struct NavigationManager;

impl NavigationManager {
    /// Poll `document.readyState` until the document has been parsed
    /// (`interactive` or `complete`). Subresources may still be loading.
    ///
    /// Lost script contexts while the old document is torn down are
    /// retried until the deadline; other driver errors end the wait.
    pub async fn wait_for_document_parsed<B: BrowserTrait>(
        browser: &B,
        tab: &B::TabHandle,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<NavigationResult> {
        let start_time = Instant::now();
        let deadline = start_time + timeout;
        let mut last_state = String::from("unknown");

        loop {
            match browser.ready_state(tab).await {
                Ok(state) if state == "interactive" || state == "complete" => {
                    return Ok(NavigationResult {
                        ready_state: state,
                        duration_ms: start_time.elapsed().as_millis() as u64,
                    });
                }
                Ok(state) => last_state = state,
                Err(e) if e.is_transient() => last_state = format!("error: {}", e),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::timeout(
                    format!("document to finish parsing (last readyState: {})", last_state),
                    timeout.as_millis() as u64,
                ));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Poll until the tab shows a document other than the one identified by
    /// `previous`, then until that document has been parsed. Both phases
    /// share one deadline.
    pub async fn wait_for_replacement<B: BrowserTrait>(
        browser: &B,
        tab: &B::TabHandle,
        previous: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<NavigationResult> {
        let start_time = Instant::now();
        let deadline = start_time + timeout;
        let mut last_error = None;

        loop {
            match browser.document_token(tab).await {
                Ok(token) if token != previous => break,
                Ok(_) => {}
                Err(e) if e.is_transient() => last_error = Some(e.to_string()),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                let condition = match last_error {
                    Some(e) => format!("document to be replaced (last error: {})", e),
                    None => "document to be replaced".to_string(),
                };
                return Err(HarnessError::timeout(condition, timeout.as_millis() as u64));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let parsed = Self::wait_for_document_parsed(browser, tab, remaining, poll_interval)
            .await
            .map_err(|e| match e {
                HarnessError::Timeout { condition, .. } => {
                    HarnessError::timeout(condition, timeout.as_millis() as u64)
                }
                other => other,
            })?;

        Ok(NavigationResult {
            ready_state: parsed.ready_state,
            duration_ms: start_time.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NavigationResult {
    pub ready_state: String,
    pub duration_ms: u64,
}
