//! Bounded polling for page conditions.
//!
//! Waits are the checkpoints of a scenario: they turn timing assumptions
//! into explicit synchronization points. Every wait returns control when
//! its timeout elapses, and the condition is always checked once more at
//! the deadline.

use crate::browser::Session;
use crate::core::BrowserTrait;
use crate::errors::{HarnessError, Result};
use crate::locator::normalize_text;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMatch {
    /// Case-insensitive substring of the normalized page text
    #[default]
    Contains,
    /// Some line of the page text equals the expected text after trimming
    Exact,
    Regex,
}

enum TextMatcher {
    Contains(String),
    Exact(String),
    Regex(Regex),
}

impl TextMatcher {
    fn new(text: &str, mode: TextMatch) -> Result<Self> {
        Ok(match mode {
            TextMatch::Contains => TextMatcher::Contains(normalize_text(text).to_lowercase()),
            TextMatch::Exact => TextMatcher::Exact(normalize_text(text)),
            TextMatch::Regex => TextMatcher::Regex(Regex::new(text).map_err(|e| {
                HarnessError::ConfigurationError(format!("invalid text pattern: {}", e))
            })?),
        })
    }

    fn matches(&self, page_text: &str) -> bool {
        match self {
            TextMatcher::Contains(wanted) => {
                normalize_text(page_text).to_lowercase().contains(wanted.as_str())
            }
            TextMatcher::Exact(wanted) => page_text
                .lines()
                .any(|line| normalize_text(line) == *wanted),
            TextMatcher::Regex(pattern) => pattern.is_match(page_text),
        }
    }
}

pub struct ConditionWaiter;

impl ConditionWaiter {
    pub async fn wait_for_text<B: BrowserTrait>(
        session: &Session<B>,
        text: &str,
        mode: TextMatch,
        timeout: Duration,
    ) -> Result<()> {
        let tab = session.require_navigated()?;
        let matcher = &TextMatcher::new(text, mode)?;
        let browser = session.browser();

        Self::poll(
            &format!("text '{}'", text),
            timeout,
            session.config().timing.poll_interval(),
            move || async move { Ok::<_, HarnessError>(matcher.matches(&browser.page_text(tab).await?)) },
        )
        .await
    }

    pub async fn wait_for_selector<B: BrowserTrait>(
        session: &Session<B>,
        selector: &str,
        timeout: Duration,
    ) -> Result<()> {
        let tab = session.require_navigated()?;
        let browser = session.browser();

        Self::poll(
            &format!("selector '{}'", selector),
            timeout,
            session.config().timing.poll_interval(),
            move || async move { Ok::<_, HarnessError>(browser.query_selector(tab, selector, 0).await?.is_some()) },
        )
        .await
    }

    /// A transient driver error (the page is mid-navigation) counts as
    /// "not yet"; if the probe at the deadline still fails that way, the
    /// error is returned instead of a timeout. Any other error ends the
    /// wait at once.
    pub async fn poll<F, Fut>(
        condition: &str,
        timeout: Duration,
        interval: Duration,
        mut probe: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last_error = match probe().await {
                Ok(true) => {
                    info!(
                        condition,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Checkpoint reached"
                    );
                    return Ok(());
                }
                Ok(false) => None,
                Err(e) if e.is_transient() => {
                    debug!(condition, error = %e, "Probe hit a navigation, retrying");
                    Some(e)
                }
                Err(e) => return Err(e),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(match last_error {
                    Some(e) => e,
                    None => HarnessError::timeout(
                        format!("{} (after {} polls)", condition, attempts),
                        timeout.as_millis() as u64,
                    ),
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::errors::FailureReason;
    use crate::testing::FakeBrowser;

    async fn slow_page(reveal_after: Duration) -> Session<FakeBrowser> {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/slow", "<h1>Loading report</h1>");
        browser.reveal_after("http://app.test/slow", reveal_after, "Report ready");
        let mut session = Session::open(browser, Config::default()).await.unwrap();
        session.navigate("http://app.test/slow").await.unwrap();
        session
    }

    #[test]
    fn test_text_matching_modes() {
        let page = "Music Lab\nStep 2: The Snap\n  Tempo 120 BPM ";

        assert!(TextMatcher::new("step 2", TextMatch::Contains).unwrap().matches(page));
        assert!(!TextMatcher::new("Step 2", TextMatch::Exact).unwrap().matches(page));
        assert!(TextMatcher::new("Tempo 120 BPM", TextMatch::Exact).unwrap().matches(page));
        assert!(TextMatcher::new(r"Tempo \d+ BPM", TextMatch::Regex).unwrap().matches(page));
        assert!(TextMatcher::new("(", TextMatch::Regex).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_true_just_before_deadline_succeeds() {
        let session = slow_page(Duration::from_millis(990)).await;

        let result = ConditionWaiter::wait_for_text(
            &session,
            "Report ready",
            TextMatch::Contains,
            Duration::from_millis(1000),
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_true_just_after_deadline_times_out() {
        let session = slow_page(Duration::from_millis(1010)).await;
        let started = Instant::now();

        let err = ConditionWaiter::wait_for_text(
            &session,
            "Report ready",
            TextMatch::Contains,
            Duration::from_millis(1000),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, HarnessError::Timeout { timeout_ms: 1000, .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_selector() {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/", "<main></main>");
        let mut session = Session::open(browser, Config::default()).await.unwrap();
        session.navigate("http://app.test/").await.unwrap();

        ConditionWaiter::wait_for_selector(&session, "main", Duration::from_millis(100))
            .await
            .unwrap();

        let err = ConditionWaiter::wait_for_selector(&session, "#pit-stop", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("selector '#pit-stop'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_context_is_retried_until_deadline() {
        let mut calls = 0;
        let err = ConditionWaiter::poll(
            "navigating probe",
            Duration::from_millis(200),
            Duration::from_millis(50),
            || {
                calls += 1;
                async {
                    Err::<bool, _>(HarnessError::JavaScriptFailed(
                        "Execution context was destroyed.".into(),
                    ))
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls, 5);
        assert!(matches!(err, HarnessError::JavaScriptFailed(_)));
        assert_eq!(err.reason(), FailureReason::UnexpectedException);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_context_then_match_succeeds() {
        let mut calls = 0;
        ConditionWaiter::poll(
            "reloading probe",
            Duration::from_millis(200),
            Duration::from_millis(50),
            || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt == 1 {
                        Err(HarnessError::JavaScriptFailed("Cannot find context with specified id".into()))
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_selector_fails_without_waiting() {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/", "<main></main>");
        let mut session = Session::open(browser, Config::default()).await.unwrap();
        session.navigate("http://app.test/").await.unwrap();
        let started = Instant::now();

        let err = ConditionWaiter::wait_for_selector(&session, "div[", Duration::from_millis(200))
            .await
            .unwrap_err();

        assert_eq!(err.reason(), FailureReason::UnexpectedException);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_before_navigation_is_precondition_error() {
        let session = Session::open(FakeBrowser::new(), Config::default()).await.unwrap();
        let err = ConditionWaiter::wait_for_text(
            &session,
            "anything",
            TextMatch::Contains,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::Precondition(_)));
    }
}
