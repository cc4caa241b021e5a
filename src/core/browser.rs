use crate::diagnostics::DiagnosticsLog;
use crate::errors::Result;
use crate::types::{Capture, ClickMode, ElementRef};
use async_trait::async_trait;
use serde_json::Value;

/// Boundary to the browser engine.
///
/// Implementations own the browser process and translate each call into
/// engine operations. Element queries work on the DOM tree and must find
/// elements regardless of whether they are visible.
#[async_trait]
pub trait BrowserTrait: Send + Sync {
    type TabHandle: Send + Sync;

    /// Launch a new browser instance
    async fn launch(&mut self, config: &crate::core::Config) -> Result<()>;

    /// Create a new tab/page
    async fn new_tab(&self) -> Result<Self::TabHandle>;

    /// Navigate to a URL and wait for the navigation to commit
    async fn navigate(&self, tab: &Self::TabHandle, url: &str) -> Result<()>;

    /// Request a full reload of the current document, bypassing the cache.
    ///
    /// May return before the new document replaces the old one; compare
    /// [`document_token`](Self::document_token) to observe the swap.
    async fn reload(&self, tab: &Self::TabHandle) -> Result<()>;

    /// Current `document.readyState`
    async fn ready_state(&self, tab: &Self::TabHandle) -> Result<String>;

    /// Token unique to the current document instance; changes whenever a
    /// navigation or reload replaces the document.
    async fn document_token(&self, tab: &Self::TabHandle) -> Result<String>;

    /// Execute JavaScript in the page and return its JSON value.
    /// A thrown exception or rejected promise is an error.
    async fn execute_script(&self, tab: &Self::TabHandle, script: &str) -> Result<Value>;

    /// The `nth` element matching a CSS selector
    async fn query_selector(
        &self,
        tab: &Self::TabHandle,
        selector: &str,
        nth: usize,
    ) -> Result<Option<ElementRef>>;

    /// The `nth` element with the given ARIA role and, if given, accessible name
    async fn query_role(
        &self,
        tab: &Self::TabHandle,
        role: &str,
        name: Option<&str>,
        nth: usize,
    ) -> Result<Option<ElementRef>>;

    /// The innermost element whose normalized text contains `text`, ignoring case
    async fn query_text(&self, tab: &Self::TabHandle, text: &str) -> Result<Option<ElementRef>>;

    async fn click(&self, tab: &Self::TabHandle, element: &ElementRef, mode: ClickMode)
        -> Result<()>;

    async fn press_key(&self, tab: &Self::TabHandle, key: &str) -> Result<()>;

    /// Rendered text of the document body
    async fn page_text(&self, tab: &Self::TabHandle) -> Result<String>;

    /// Clear cookies and web storage for the current origin
    async fn clear_storage(&self, tab: &Self::TabHandle) -> Result<()>;

    /// PNG of the requested area
    async fn take_screenshot(&self, tab: &Self::TabHandle, capture: Capture) -> Result<Vec<u8>>;

    /// Get current URL
    async fn get_url(&self, tab: &Self::TabHandle) -> Result<String>;

    /// Start forwarding console messages and uncaught page errors to `log`
    async fn subscribe(&self, tab: &Self::TabHandle, log: DiagnosticsLog) -> Result<()>;

    /// Check if browser is still running
    fn is_running(&self) -> bool;

    /// Close the browser
    async fn close(&mut self) -> Result<()>;
}
