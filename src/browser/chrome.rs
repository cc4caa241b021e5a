use crate::core::{BrowserTrait, Config};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsLog, Severity};
use crate::errors::{HarnessError, Result};
use crate::types::{Capture, ClickMode, ElementRect, ElementRef};
use crate::utils::javascript;
use async_trait::async_trait;
use base64::Engine;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::{Page, Runtime};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Headless Chrome driver over the DevTools protocol.
pub struct ChromeBrowser {
    browser: Option<Browser>,
    navigation_timeout: Duration,
}

impl ChromeBrowser {
    pub fn new() -> Self {
        Self {
            browser: None,
            navigation_timeout: Duration::from_secs(30),
        }
    }

    /// `Runtime.evaluate` by value, awaiting promises. `Tab::evaluate`
    /// drops `exceptionDetails`, so the method is called directly.
    fn evaluate(&self, tab: &Arc<Tab>, expression: &str) -> Result<Value> {
        let response = tab
            .call_method(Runtime::Evaluate {
                expression: expression.to_string(),
                object_group: None,
                include_command_line_api: Some(false),
                silent: Some(false),
                context_id: None,
                return_by_value: Some(true),
                generate_preview: Some(false),
                user_gesture: Some(false),
                await_promise: Some(true),
                throw_on_side_effect: None,
                timeout: None,
                disable_breaks: None,
                repl_mode: None,
                allow_unsafe_eval_blocked_by_csp: None,
                unique_context_id: None,
                serialization_options: None,
            })
            .map_err(|e| HarnessError::JavaScriptFailed(e.to_string()))?;

        evaluation_value(serde_json::to_value(&response)?)
    }

    fn element_from(&self, value: Value) -> Result<Option<ElementRef>> {
        if value.is_null() {
            return Ok(None);
        }
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Err(HarnessError::JavaScriptFailed(error.to_string()));
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    fn fresh_ref() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

impl Default for ChromeBrowser {
    fn default() -> Self {
        Self::new()
    }
}

fn console_text(params: &Value) -> String {
    params
        .get("args")
        .and_then(|args| args.as_array())
        .map(|args| {
            args.iter()
                .filter_map(|arg| match arg.get("value") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Null) | None => arg
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(str::to_string),
                    Some(other) => Some(other.to_string()),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// The value of a `Runtime.evaluate` response, or the exception it threw.
fn evaluation_value(response: Value) -> Result<Value> {
    if response.get("exceptionDetails").is_some() {
        return Err(HarnessError::JavaScriptFailed(exception_text(&response)));
    }
    let result = &response["result"];
    if let Some(value) = result.get("value") {
        return Ok(value.clone());
    }
    // NaN, Infinity, -0 and bigints have no JSON form
    Ok(result
        .get("unserializableValue")
        .and_then(|v| v.as_str())
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Null))
}

fn clip_of(rect: ElementRect) -> Page::Viewport {
    Page::Viewport {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
        scale: 1.0,
    }
}

fn exception_text(params: &Value) -> String {
    let details = &params["exceptionDetails"];
    details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or("uncaught exception")
        .to_string()
}

#[async_trait]
impl BrowserTrait for ChromeBrowser {
    type TabHandle = Arc<Tab>;

    async fn launch(&mut self, config: &Config) -> Result<()> {
        let window_size_arg = format!(
            "--window-size={},{}",
            config.browser.viewport.width, config.browser.viewport.height
        );

        let user_agent_arg = config
            .browser
            .user_agent
            .as_ref()
            .map(|ua| format!("--user-agent={}", ua));

        let mut args = vec![
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new(&window_size_arg),
        ];

        if let Some(ref ua_arg) = user_agent_arg {
            args.push(OsStr::new(ua_arg));
        }

        for arg in &config.browser.args {
            args.push(OsStr::new(arg));
        }

        let launch_options = LaunchOptions::default_builder()
            .headless(config.browser.headless)
            .window_size(Some((
                config.browser.viewport.width,
                config.browser.viewport.height,
            )))
            .path(config.browser.chrome_path.clone())
            .args(args)
            .build()
            .map_err(|e| HarnessError::LaunchFailed(e.to_string()))?;

        let browser =
            Browser::new(launch_options).map_err(|e| HarnessError::LaunchFailed(e.to_string()))?;

        self.navigation_timeout = Duration::from_millis(config.browser.navigation_timeout_ms);
        self.browser = Some(browser);
        Ok(())
    }

    async fn new_tab(&self) -> Result<Self::TabHandle> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| HarnessError::Precondition("browser not launched".to_string()))?;

        let tab = browser
            .new_tab()
            .map_err(|e| HarnessError::LaunchFailed(e.to_string()))?;
        tab.set_default_timeout(self.navigation_timeout);

        Ok(tab)
    }

    async fn navigate(&self, tab: &Self::TabHandle, url: &str) -> Result<()> {
        tab.navigate_to(url)
            .map_err(|e| HarnessError::NavigationFailed(e.to_string()))?;

        tab.wait_until_navigated()
            .map_err(|e| HarnessError::NavigationFailed(e.to_string()))?;

        Ok(())
    }

    async fn reload(&self, tab: &Self::TabHandle) -> Result<()> {
        tab.reload(true, None)
            .map_err(|e| HarnessError::NavigationFailed(e.to_string()))?;
        Ok(())
    }

    async fn ready_state(&self, tab: &Self::TabHandle) -> Result<String> {
        let state = self.evaluate(tab, javascript::READY_STATE)?;
        Ok(state.as_str().unwrap_or("loading").to_string())
    }

    async fn document_token(&self, tab: &Self::TabHandle) -> Result<String> {
        let token = self.evaluate(tab, &javascript::document_token(&Self::fresh_ref()))?;
        token
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HarnessError::JavaScriptFailed(format!("unexpected document token {}", token)))
    }

    async fn execute_script(&self, tab: &Self::TabHandle, script: &str) -> Result<Value> {
        if javascript::is_function_source(script) {
            return self.evaluate(tab, &format!("({})()", script.trim()));
        }
        self.evaluate(tab, script)
    }

    async fn query_selector(
        &self,
        tab: &Self::TabHandle,
        selector: &str,
        nth: usize,
    ) -> Result<Option<ElementRef>> {
        let script = javascript::query_selector(selector, nth, &Self::fresh_ref());
        self.element_from(self.evaluate(tab, &script)?)
    }

    async fn query_role(
        &self,
        tab: &Self::TabHandle,
        role: &str,
        name: Option<&str>,
        nth: usize,
    ) -> Result<Option<ElementRef>> {
        let script = javascript::query_role(role, name, nth, &Self::fresh_ref());
        self.element_from(self.evaluate(tab, &script)?)
    }

    async fn query_text(&self, tab: &Self::TabHandle, text: &str) -> Result<Option<ElementRef>> {
        let script = javascript::query_text(text, &Self::fresh_ref());
        self.element_from(self.evaluate(tab, &script)?)
    }

    async fn click(
        &self,
        tab: &Self::TabHandle,
        element: &ElementRef,
        mode: ClickMode,
    ) -> Result<()> {
        match mode {
            ClickMode::Pointer => {
                let target = self.evaluate(tab, &javascript::pointer_target(&element.handle))?;
                let (x, y) = match (target["x"].as_f64(), target["y"].as_f64()) {
                    (Some(x), Some(y)) => (x, y),
                    _ => return Err(HarnessError::ElementNotFound(format!("{} left the document", element.handle))),
                };
                tab.click_point(Point { x, y })
                    .map_err(|e| HarnessError::JavaScriptFailed(e.to_string()))?;
            }
            ClickMode::Script => {
                let clicked = self.evaluate(tab, &javascript::script_click(&element.handle))?;
                if clicked.as_bool() != Some(true) {
                    return Err(HarnessError::ElementNotFound(format!("{} left the document", element.handle)));
                }
            }
        }
        Ok(())
    }

    async fn press_key(&self, tab: &Self::TabHandle, key: &str) -> Result<()> {
        tab.press_key(key)
            .map_err(|e| HarnessError::JavaScriptFailed(e.to_string()))?;
        Ok(())
    }

    async fn page_text(&self, tab: &Self::TabHandle) -> Result<String> {
        let text = self.evaluate(tab, javascript::PAGE_TEXT)?;
        Ok(text.as_str().unwrap_or_default().to_string())
    }

    async fn clear_storage(&self, tab: &Self::TabHandle) -> Result<()> {
        let result = self.evaluate(tab, javascript::CLEAR_STORAGE)?;
        if result.get("success").and_then(|v| v.as_bool()) != Some(true) {
            let reason = result
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(HarnessError::JavaScriptFailed(format!(
                "clearing storage: {}",
                reason
            )));
        }
        Ok(())
    }

    async fn take_screenshot(&self, tab: &Self::TabHandle, capture: Capture) -> Result<Vec<u8>> {
        // Clips are in document coordinates, so anything but the plain
        // viewport has to be captured beyond it.
        let (clip, beyond_viewport) = match capture {
            Capture::Viewport => (None, false),
            Capture::FullPage => {
                let metrics = tab
                    .call_method(Page::GetLayoutMetrics(None))
                    .map_err(|e| HarnessError::ScreenshotFailed(e.to_string()))?;
                let size = metrics.css_content_size;
                let page = ElementRect {
                    x: 0.0,
                    y: 0.0,
                    width: size.width,
                    height: size.height,
                };
                (Some(clip_of(page)), true)
            }
            Capture::Region(rect) => (Some(clip_of(rect)), true),
        };

        let data = tab
            .call_method(Page::CaptureScreenshot {
                format: Some(Page::CaptureScreenshotFormatOption::Png),
                quality: None,
                clip,
                from_surface: Some(true),
                capture_beyond_viewport: Some(beyond_viewport),
                optimize_for_speed: None,
            })
            .map_err(|e| HarnessError::ScreenshotFailed(e.to_string()))?
            .data;

        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| HarnessError::ScreenshotFailed(format!("invalid image data: {}", e)))
    }

    async fn get_url(&self, tab: &Self::TabHandle) -> Result<String> {
        Ok(tab.get_url())
    }

    async fn subscribe(&self, tab: &Self::TabHandle, log: DiagnosticsLog) -> Result<()> {
        tab.enable_runtime()?;

        tab.add_event_listener(Arc::new(move |event: &Event| match event {
            Event::RuntimeConsoleAPICalled(called) => {
                let params = serde_json::to_value(&called.params).unwrap_or_default();
                let severity = Severity::from_console_type(params["type"].as_str().unwrap_or("log"));
                log.append(DiagnosticEvent::console(severity, console_text(&params)));
            }
            Event::RuntimeExceptionThrown(thrown) => {
                let params = serde_json::to_value(&thrown.params).unwrap_or_default();
                log.append(DiagnosticEvent::page_error(exception_text(&params)));
            }
            _ => {}
        }))?;

        debug!("Console and exception listeners registered");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.browser.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the handle terminates the Chrome process.
        self.browser = None;
        Ok(())
    }
}
