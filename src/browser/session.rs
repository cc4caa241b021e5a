use crate::core::{BrowserTrait, Config};
use crate::diagnostics::DiagnosticsCollector;
use crate::errors::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Navigated,
    Closed,
}

/// One browser tab under automation, with its diagnostics collector.
///
/// A session is owned by exactly one scenario run and never reused. Every
/// component receives it explicitly; nothing reaches for a global page.
pub struct Session<B: BrowserTrait> {
    id: String,
    browser: B,
    tab: Option<B::TabHandle>,
    state: SessionState,
    diagnostics: DiagnosticsCollector,
    config: Config,
    base_url: Option<Url>,
}

impl<B: BrowserTrait> Session<B> {
    /// Launch the browser, open one tab and attach diagnostics listeners.
    ///
    /// Any failure before the tab exists is reported as a launch failure
    /// and leaves no browser process behind.
    pub async fn open(mut browser: B, config: Config) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        info!(session = %id, headless = config.browser.headless, "Opening browser session");

        if let Err(e) = browser.launch(&config).await {
            let _ = browser.close().await;
            return Err(match e {
                HarnessError::LaunchFailed(_) => e,
                other => HarnessError::LaunchFailed(other.to_string()),
            });
        }

        let tab = match browser.new_tab().await {
            Ok(tab) => tab,
            Err(e) => {
                let _ = browser.close().await;
                return Err(HarnessError::LaunchFailed(e.to_string()));
            }
        };

        let mut diagnostics = DiagnosticsCollector::new();
        if let Err(e) = diagnostics.attach(&browser, &tab).await {
            let _ = browser.close().await;
            return Err(HarnessError::LaunchFailed(format!(
                "attaching diagnostics: {}",
                e
            )));
        }

        Ok(Self {
            id,
            browser,
            tab: Some(tab),
            state: SessionState::Created,
            diagnostics,
            config,
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, base_url: Option<Url>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn diagnostics(&self) -> &DiagnosticsCollector {
        &self.diagnostics
    }

    pub fn tab(&self) -> Result<&B::TabHandle> {
        match (&self.tab, self.state) {
            (Some(tab), SessionState::Created | SessionState::Navigated) => Ok(tab),
            _ => Err(HarnessError::Precondition("session is closed".to_string())),
        }
    }

    /// Fails unless a document has been loaded in this session.
    pub fn require_navigated(&self) -> Result<&B::TabHandle> {
        let tab = self.tab()?;
        if self.state != SessionState::Navigated {
            return Err(HarnessError::Precondition(
                "no page loaded yet; navigate first".to_string(),
            ));
        }
        Ok(tab)
    }

    /// Absolute URLs are used as given, relative ones join the base URL.
    pub fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => Ok(base.join(url)?),
                None => Err(HarnessError::ConfigurationError(format!(
                    "relative URL '{}' without a base URL",
                    url
                ))),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn navigate(&mut self, url: &str) -> Result<()> {
        let target = self.resolve_url(url)?;
        let tab = self.tab()?;
        info!(session = %self.id, url = %target, "Navigating");
        self.browser.navigate(tab, target.as_str()).await?;
        self.state = SessionState::Navigated;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String> {
        self.browser.get_url(self.tab()?).await
    }

    /// Release the tab and the browser. Safe to call more than once; the
    /// diagnostics log is sealed but stays readable.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.diagnostics.detach();
        self.tab = None;
        self.state = SessionState::Closed;

        let result = self.browser.close().await;
        match &result {
            Ok(()) => debug!(session = %self.id, "Browser session closed"),
            Err(e) => warn!(session = %self.id, error = %e, "Browser did not close cleanly"),
        }
        result
    }
}
