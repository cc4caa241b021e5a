use crate::browser::{NavigationManager, Session};
use crate::core::BrowserTrait;
use crate::errors::Result;
use std::time::Duration;
use tracing::info;

/// Returns the application to its first-visit state.
pub struct StateReset;

impl StateReset {
    /// Clear origin-scoped persisted state, reload, and wait until a new
    /// document has replaced the old one and been parsed.
    ///
    /// Fails with a precondition error if nothing has been loaded yet:
    /// storage is scoped to an origin, and there is none before the first
    /// navigation.
    pub async fn reset<B: BrowserTrait>(session: &Session<B>) -> Result<()> {
        let tab = session.require_navigated()?;
        let browser = session.browser();
        let timing = &session.config().timing;

        let previous = browser.document_token(tab).await?;
        browser.clear_storage(tab).await?;
        browser.reload(tab).await?;

        let loaded = NavigationManager::wait_for_replacement(
            browser,
            tab,
            &previous,
            Duration::from_millis(timing.reset_timeout_ms),
            timing.poll_interval(),
        )
        .await?;

        info!(
            session = %session.id(),
            ready_state = %loaded.ready_state,
            duration_ms = loaded.duration_ms,
            "Persisted state cleared and page reloaded"
        );
        Ok(())
    }
}
