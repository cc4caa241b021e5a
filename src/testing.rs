//! In-memory browser for exercising the harness without Chrome.
//!
//! [`FakeBrowser`] serves HTML registered per URL, parses it with
//! `scraper` and answers element queries against the parsed tree. Pages
//! react to clicks and key presses through [`Reaction`]s, which is enough
//! to model single-page apps that persist progress in storage.
//!
//! Clones share state, so a test can keep a handle while a session owns
//! another.

use crate::core::{BrowserTrait, Config};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsLog, Severity};
use crate::errors::{HarnessError, Result};
use crate::locator::{accessible_name_matches, normalize_text};
use crate::types::{Capture, ClickMode, ElementRect, ElementRef};
use async_trait::async_trait;
use scraper::{ElementRef as DomElement, Html, Selector};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const HANDLE_PREFIX: &str = "fake-n";
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const ROW_HEIGHT: f64 = 24.0;

#[derive(Debug, Clone)]
enum Effect {
    Append(String),
    Persist {
        key: String,
        value: String,
        html: String,
    },
    Console(Severity, String),
    PageError(String),
}

/// What the page does when an element is clicked or a key is pressed.
#[derive(Debug, Clone)]
pub struct Reaction {
    effect: Effect,
    requires_text: Option<String>,
}

impl Reaction {
    fn new(effect: Effect) -> Self {
        Self {
            effect,
            requires_text: None,
        }
    }

    /// Append markup to the current document; lost on reload.
    pub fn append(html: impl Into<String>) -> Self {
        Self::new(Effect::Append(html.into()))
    }

    /// Write `key` to storage and render `html`, now and after every reload
    /// until storage is cleared.
    pub fn persist(key: impl Into<String>, value: impl Into<String>, html: impl Into<String>) -> Self {
        Self::new(Effect::Persist {
            key: key.into(),
            value: value.into(),
            html: html.into(),
        })
    }

    pub fn console(severity: Severity, text: impl Into<String>) -> Self {
        Self::new(Effect::Console(severity, text.into()))
    }

    pub fn page_error(message: impl Into<String>) -> Self {
        Self::new(Effect::PageError(message.into()))
    }

    /// Only fire while the page text contains `text`.
    pub fn requires_text(mut self, text: impl Into<String>) -> Self {
        self.requires_text = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickRecord {
    /// `data-testid`, `aria-label`, `id` or text of the clicked element
    pub label: String,
    pub mode: ClickMode,
}

#[derive(Debug, Clone)]
pub struct FakeTab {
    pub id: u32,
}

struct Reveal {
    url: String,
    after: Duration,
    text: String,
}

struct FakeState {
    running: bool,
    launch_error: Option<String>,
    tabs_opened: u32,
    routes: HashMap<String, String>,
    reveals: Vec<Reveal>,
    load_events: Vec<(String, DiagnosticEvent)>,
    url: Option<String>,
    body: String,
    loaded_at: Instant,
    storage: BTreeMap<String, String>,
    persisted_html: BTreeMap<String, String>,
    click_reactions: Vec<(String, Reaction)>,
    key_reactions: Vec<(String, Reaction)>,
    loading_polls: u32,
    remaining_loading_polls: u32,
    document_serial: u64,
    stale_reload_polls: u32,
    /// Polls left before a requested reload replaces the document
    pending_reload: Option<u32>,
    reload_count: u32,
    clicks: Vec<ClickRecord>,
    keys: Vec<String>,
    scripts: Vec<String>,
    script_results: Vec<(String, std::result::Result<Value, String>)>,
    screenshots: Vec<Capture>,
    screenshot_error: Option<String>,
    log: Option<DiagnosticsLog>,
}

impl FakeState {
    fn new() -> Self {
        Self {
            running: false,
            launch_error: None,
            tabs_opened: 0,
            routes: HashMap::new(),
            reveals: Vec::new(),
            load_events: Vec::new(),
            url: None,
            body: String::new(),
            loaded_at: Instant::now(),
            storage: BTreeMap::new(),
            persisted_html: BTreeMap::new(),
            click_reactions: Vec::new(),
            key_reactions: Vec::new(),
            loading_polls: 0,
            remaining_loading_polls: 0,
            document_serial: 0,
            stale_reload_polls: 1,
            pending_reload: None,
            reload_count: 0,
            clicks: Vec::new(),
            keys: Vec::new(),
            scripts: Vec::new(),
            script_results: Vec::new(),
            screenshots: Vec::new(),
            screenshot_error: None,
            log: None,
        }
    }

    fn load(&mut self, url: &str) -> Result<()> {
        let html = self
            .routes
            .get(url)
            .cloned()
            .ok_or_else(|| HarnessError::NavigationFailed(format!("net::ERR_CONNECTION_REFUSED at {}", url)))?;

        let mut body = html;
        for fragment in self.persisted_html.values() {
            body.push_str(fragment);
        }
        self.body = body;
        self.url = Some(url.to_string());
        self.loaded_at = Instant::now();
        self.remaining_loading_polls = self.loading_polls;
        self.document_serial += 1;
        self.pending_reload = None;

        let events: Vec<DiagnosticEvent> = self
            .load_events
            .iter()
            .filter(|(target, _)| target == url)
            .map(|(_, event)| event.clone())
            .collect();
        for event in events {
            self.record(event);
        }
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| HarnessError::NavigationFailed("nothing to reload".to_string()))?;
        self.reload_count += 1;
        self.load(&url)
    }

    /// Like `Page.reload`: the old document stays live for a few polls.
    fn request_reload(&mut self) -> Result<()> {
        if self.url.is_none() {
            return Err(HarnessError::NavigationFailed("nothing to reload".to_string()));
        }
        if self.stale_reload_polls == 0 {
            return self.reload();
        }
        self.pending_reload = Some(self.stale_reload_polls);
        Ok(())
    }

    /// Advance a requested reload by one poll. True while the old document
    /// is still the one answering.
    fn poll_reload(&mut self) -> Result<bool> {
        match self.pending_reload {
            None => Ok(false),
            Some(0) => {
                self.reload()?;
                Ok(false)
            }
            Some(polls) => {
                self.pending_reload = Some(polls - 1);
                Ok(true)
            }
        }
    }

    fn record(&mut self, event: DiagnosticEvent) {
        // Without a listener the event is lost, as in a real browser.
        if let Some(log) = &self.log {
            log.append(event);
        }
    }

    fn rendered(&self) -> String {
        let mut html = self.body.clone();
        let url = self.url.as_deref().unwrap_or_default();
        let elapsed = self.loaded_at.elapsed();
        for reveal in &self.reveals {
            if reveal.url == url && elapsed >= reveal.after {
                html.push_str(&format!("<p>{}</p>", escape(&reveal.text)));
            }
        }
        html
    }

    fn document(&self) -> Html {
        Html::parse_document(&self.rendered())
    }

    fn page_text(&self) -> String {
        page_text(&self.document())
    }

    fn apply(&mut self, reactions: Vec<Reaction>) {
        for reaction in reactions {
            if let Some(required) = &reaction.requires_text {
                if !accessible_name_matches(&self.page_text(), required) {
                    continue;
                }
            }
            match reaction.effect {
                Effect::Append(html) => self.body.push_str(&html),
                Effect::Persist { key, value, html } => {
                    self.storage.insert(key.clone(), value);
                    self.persisted_html.insert(key, html.clone());
                    self.body.push_str(&html);
                }
                Effect::Console(severity, text) => self.record(DiagnosticEvent::console(severity, text)),
                Effect::PageError(message) => self.record(DiagnosticEvent::page_error(message)),
            }
        }
    }

    /// Click the element at document index `index`, firing its reactions.
    fn activate(&mut self, index: usize, mode: ClickMode) -> Result<()> {
        let (label, visible, reactions) = {
            let document = self.document();
            let element = all_elements(&document)
                .into_iter()
                .nth(index)
                .ok_or_else(|| HarnessError::ElementNotFound(format!("element n{} is gone", index)))?;
            let reactions: Vec<Reaction> = self
                .click_reactions
                .iter()
                .filter(|(selector, _)| matches_selector(&document, selector, &element))
                .map(|(_, reaction)| reaction.clone())
                .collect();
            (label_of(&element), is_visible(&element), reactions)
        };

        self.clicks.push(ClickRecord { label, mode });
        // A pointer click on a hidden element lands on whatever covers it.
        if mode == ClickMode::Pointer && !visible {
            return Ok(());
        }
        self.apply(reactions);
        Ok(())
    }
}

/// Scriptable stand-in for [`ChromeBrowser`](crate::browser::ChromeBrowser).
#[derive(Clone)]
pub struct FakeBrowser {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::new())),
        }
    }

    /// A browser whose launch always fails with `message`.
    pub fn failing_launch(message: impl Into<String>) -> Self {
        let browser = Self::new();
        browser.state().launch_error = Some(message.into());
        browser
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn route(&self, url: impl Into<String>, html: impl Into<String>) {
        self.state().routes.insert(url.into(), html.into());
    }

    /// Render `text` on `url` once `after` has passed since the page loaded.
    pub fn reveal_after(&self, url: impl Into<String>, after: Duration, text: impl Into<String>) {
        self.state().reveals.push(Reveal {
            url: url.into(),
            after,
            text: text.into(),
        });
    }

    /// Emit a console event every time `url` loads.
    pub fn log_on_load(&self, url: impl Into<String>, severity: Severity, text: impl Into<String>) {
        self.state()
            .load_events
            .push((url.into(), DiagnosticEvent::console(severity, text)));
    }

    pub fn on_click(&self, selector: impl Into<String>, reaction: Reaction) {
        self.state().click_reactions.push((selector.into(), reaction));
    }

    pub fn on_key(&self, key: impl Into<String>, reaction: Reaction) {
        self.state().key_reactions.push((key.into(), reaction));
    }

    /// Scripts containing `fragment` evaluate to `value`.
    pub fn script_result(&self, fragment: impl Into<String>, value: Value) {
        self.state().script_results.push((fragment.into(), Ok(value)));
    }

    /// Scripts containing `fragment` throw `message`.
    pub fn script_error(&self, fragment: impl Into<String>, message: impl Into<String>) {
        self.state()
            .script_results
            .push((fragment.into(), Err(message.into())));
    }

    pub fn fail_screenshots(&self, message: impl Into<String>) {
        self.state().screenshot_error = Some(message.into());
    }

    /// Number of polls a requested reload keeps answering from the old,
    /// fully loaded document. Defaults to one.
    pub fn set_stale_reload_polls(&self, polls: u32) {
        self.state().stale_reload_polls = polls;
    }

    /// Number of `readyState` polls answered with `loading` after each load.
    pub fn set_loading_polls(&self, polls: u32) {
        let mut state = self.state();
        state.loading_polls = polls;
        state.remaining_loading_polls = polls;
    }

    /// Click the first element with `data-testid`, as a user would.
    pub fn click_test_id(&self, test_id: &str) {
        let mut state = self.state();
        let selector = format!("[data-testid=\"{}\"]", test_id);
        let index = {
            let document = state.document();
            find(&document, &selector, 0).ok().flatten().map(|(index, _)| index)
        };
        if let Some(index) = index {
            let _ = state.activate(index, ClickMode::Pointer);
        }
    }

    /// Reload as a user would, replacing the document at once.
    pub fn reload_page(&self) {
        let _ = self.state().reload();
    }

    pub fn emit_console(&self, severity: Severity, text: impl Into<String>) {
        self.state().record(DiagnosticEvent::console(severity, text));
    }

    pub fn text(&self) -> String {
        self.state().page_text()
    }

    pub fn storage(&self) -> BTreeMap<String, String> {
        self.state().storage.clone()
    }

    pub fn reload_count(&self) -> u32 {
        self.state().reload_count
    }

    pub fn clicks(&self) -> Vec<ClickRecord> {
        self.state().clicks.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().keys.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state().scripts.clone()
    }

    pub fn screenshots(&self) -> Vec<Capture> {
        self.state().screenshots.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state().log.is_some()
    }

    pub fn tabs_opened(&self) -> u32 {
        self.state().tabs_opened
    }

    fn require_running(&self) -> Result<MutexGuard<'_, FakeState>> {
        let state = self.state();
        if !state.running {
            return Err(HarnessError::ChromeError("browser is not running".to_string()));
        }
        Ok(state)
    }

    fn query<F>(&self, pick: F) -> Result<Option<ElementRef>>
    where
        F: FnOnce(&Html) -> Result<Option<(usize, DomElement<'_>)>>,
    {
        let state = self.require_running()?;
        let document = state.document();
        Ok(pick(&document)?.map(|(index, element)| describe(index, &element)))
    }
}

#[async_trait]
impl BrowserTrait for FakeBrowser {
    type TabHandle = FakeTab;

    async fn launch(&mut self, _config: &Config) -> Result<()> {
        let mut state = self.state();
        if let Some(message) = &state.launch_error {
            return Err(HarnessError::LaunchFailed(message.clone()));
        }
        state.running = true;
        Ok(())
    }

    async fn new_tab(&self) -> Result<FakeTab> {
        let mut state = self.require_running()?;
        state.tabs_opened += 1;
        Ok(FakeTab {
            id: state.tabs_opened,
        })
    }

    async fn navigate(&self, _tab: &FakeTab, url: &str) -> Result<()> {
        self.require_running()?.load(url)
    }

    async fn reload(&self, _tab: &FakeTab) -> Result<()> {
        self.require_running()?.request_reload()
    }

    async fn ready_state(&self, _tab: &FakeTab) -> Result<String> {
        let mut state = self.require_running()?;
        if state.poll_reload()? {
            return Ok("complete".to_string());
        }
        if state.remaining_loading_polls > 0 {
            state.remaining_loading_polls -= 1;
            return Ok("loading".to_string());
        }
        Ok("interactive".to_string())
    }

    async fn document_token(&self, _tab: &FakeTab) -> Result<String> {
        let mut state = self.require_running()?;
        // A stale poll answers with the old document's serial.
        state.poll_reload()?;
        Ok(format!("document-{}", state.document_serial))
    }

    async fn execute_script(&self, _tab: &FakeTab, script: &str) -> Result<Value> {
        let mut state = self.require_running()?;
        state.scripts.push(script.to_string());
        let result = state
            .script_results
            .iter()
            .find(|(fragment, _)| script.contains(fragment.as_str()))
            .map(|(_, result)| result.clone());
        match result {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(HarnessError::JavaScriptFailed(message)),
            None => Ok(Value::Null),
        }
    }

    async fn query_selector(
        &self,
        _tab: &FakeTab,
        selector: &str,
        nth: usize,
    ) -> Result<Option<ElementRef>> {
        self.query(|document| find(document, selector, nth))
    }

    async fn query_role(
        &self,
        _tab: &FakeTab,
        role: &str,
        name: Option<&str>,
        nth: usize,
    ) -> Result<Option<ElementRef>> {
        self.query(|document| {
            Ok(all_elements(document)
                .into_iter()
                .enumerate()
                .filter(|(_, element)| role_of(element).as_deref() == Some(role))
                .filter(|(_, element)| {
                    name.map_or(true, |name| accessible_name_matches(&accessible_name(element), name))
                })
                .nth(nth))
        })
    }

    async fn query_text(&self, _tab: &FakeTab, text: &str) -> Result<Option<ElementRef>> {
        self.query(|document| {
            let wanted = normalize_text(text).to_lowercase();
            if wanted.is_empty() {
                return Ok(None);
            }
            let hits: Vec<(usize, DomElement<'_>)> = all_elements(document)
                .into_iter()
                .enumerate()
                .filter(|(_, element)| !matches!(element.value().name(), "html" | "head" | "body" | "script" | "style"))
                .filter(|(_, element)| {
                    normalize_text(&element.text().collect::<String>())
                        .to_lowercase()
                        .contains(&wanted)
                })
                .collect();
            let innermost = hits.iter().find(|(_, element)| {
                !hits
                    .iter()
                    .any(|(_, other)| other.id() != element.id() && other.ancestors().any(|a| a.id() == element.id()))
            });
            Ok(innermost.cloned())
        })
    }

    async fn click(&self, _tab: &FakeTab, element: &ElementRef, mode: ClickMode) -> Result<()> {
        let mut state = self.require_running()?;
        let index = handle_index(&element.handle)
            .ok_or_else(|| HarnessError::ElementNotFound(format!("unknown handle {}", element.handle)))?;
        state.activate(index, mode)
    }

    async fn press_key(&self, _tab: &FakeTab, key: &str) -> Result<()> {
        let mut state = self.require_running()?;
        state.keys.push(key.to_string());
        let reactions: Vec<Reaction> = state
            .key_reactions
            .iter()
            .filter(|(bound, _)| bound == key)
            .map(|(_, reaction)| reaction.clone())
            .collect();
        state.apply(reactions);
        Ok(())
    }

    async fn page_text(&self, _tab: &FakeTab) -> Result<String> {
        Ok(self.require_running()?.page_text())
    }

    async fn clear_storage(&self, _tab: &FakeTab) -> Result<()> {
        let mut state = self.require_running()?;
        state.storage.clear();
        state.persisted_html.clear();
        Ok(())
    }

    async fn take_screenshot(&self, _tab: &FakeTab, capture: Capture) -> Result<Vec<u8>> {
        let mut state = self.require_running()?;
        if let Some(message) = &state.screenshot_error {
            return Err(HarnessError::ScreenshotFailed(message.clone()));
        }
        state.screenshots.push(capture);
        Ok(PNG_MAGIC.to_vec())
    }

    async fn get_url(&self, _tab: &FakeTab) -> Result<String> {
        let state = self.require_running()?;
        Ok(state.url.clone().unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn subscribe(&self, _tab: &FakeTab, log: DiagnosticsLog) -> Result<()> {
        self.require_running()?.log = Some(log);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state().running
    }

    async fn close(&mut self) -> Result<()> {
        self.state().running = false;
        Ok(())
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn all_elements(document: &Html) -> Vec<DomElement<'_>> {
    document
        .root_element()
        .descendants()
        .filter_map(DomElement::wrap)
        .collect()
}

/// The `nth` match of `selector`, paired with its document index.
fn find<'a>(document: &'a Html, selector: &str, nth: usize) -> Result<Option<(usize, DomElement<'a>)>> {
    let elements = all_elements(document);
    let parsed = Selector::parse(selector)
        .map_err(|e| HarnessError::JavaScriptFailed(format!("invalid selector '{}': {:?}", selector, e)))?;
    let found = document.select(&parsed).nth(nth);
    Ok(found.and_then(|element| {
        elements
            .iter()
            .position(|candidate| candidate.id() == element.id())
            .map(|index| (index, element))
    }))
}

/// Handles handed out by [`describe`] carry the document index.
fn handle_index(handle: &str) -> Option<usize> {
    handle.strip_prefix(HANDLE_PREFIX)?.parse().ok()
}

fn matches_selector(document: &Html, selector: &str, element: &DomElement<'_>) -> bool {
    match Selector::parse(selector) {
        Ok(parsed) => document.select(&parsed).any(|candidate| candidate.id() == element.id()),
        Err(_) => false,
    }
}

fn describe(index: usize, element: &DomElement<'_>) -> ElementRef {
    let visible = is_visible(element);
    let rect = if hidden_by_layout(element) {
        ElementRect {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
        }
    } else {
        ElementRect {
            x: 0.0,
            y: index as f64 * ROW_HEIGHT,
            width: 320.0,
            height: ROW_HEIGHT,
        }
    };
    ElementRef {
        handle: format!("{}{}", HANDLE_PREFIX, index),
        tag_name: element.value().name().to_string(),
        visible,
        rect: Some(rect),
    }
}

fn style_of(element: &DomElement<'_>) -> String {
    element
        .value()
        .attr("style")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect()
}

fn chain<'a>(element: &DomElement<'a>) -> Vec<DomElement<'a>> {
    let mut nodes = vec![*element];
    nodes.extend(element.ancestors().filter_map(DomElement::wrap));
    nodes
}

/// Takes no space: `hidden`, `display:none` or a hidden input.
fn hidden_by_layout(element: &DomElement<'_>) -> bool {
    chain(element).iter().any(|node| {
        let value = node.value();
        value.attr("hidden").is_some()
            || style_of(node).contains("display:none")
            || (value.name() == "input" && value.attr("type") == Some("hidden"))
    })
}

fn is_visible(element: &DomElement<'_>) -> bool {
    if hidden_by_layout(element) {
        return false;
    }
    !chain(element).iter().any(|node| {
        let style = style_of(node);
        style.contains("visibility:hidden") || opacity_is_zero(&style)
    })
}

fn opacity_is_zero(style: &str) -> bool {
    style
        .split(';')
        .filter_map(|declaration| declaration.strip_prefix("opacity:"))
        .any(|value| value.parse::<f64>().map(|v| v == 0.0).unwrap_or(false))
}

fn role_of(element: &DomElement<'_>) -> Option<String> {
    let value = element.value();
    if let Some(role) = value.attr("role") {
        return Some(role.to_ascii_lowercase());
    }
    let role = match value.name() {
        "button" | "summary" => "button",
        "a" if value.attr("href").is_some() => "link",
        "select" => "combobox",
        "textarea" => "textbox",
        "img" => "img",
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
        "input" => match value.attr("type").unwrap_or("text").to_ascii_lowercase().as_str() {
            "range" => "slider",
            "checkbox" => "checkbox",
            "radio" => "radio",
            "button" | "submit" | "reset" | "image" => "button",
            "hidden" => return None,
            _ => "textbox",
        },
        _ => return None,
    };
    Some(role.to_string())
}

fn accessible_name(element: &DomElement<'_>) -> String {
    let value = element.value();
    if let Some(label) = value.attr("aria-label") {
        return normalize_text(label);
    }
    let text = normalize_text(&element.text().collect::<String>());
    if !text.is_empty() {
        return text;
    }
    ["title", "alt", "value"]
        .iter()
        .find_map(|attribute| value.attr(attribute))
        .map(normalize_text)
        .unwrap_or_default()
}

fn label_of(element: &DomElement<'_>) -> String {
    let value = element.value();
    ["data-testid", "aria-label", "id"]
        .iter()
        .find_map(|attribute| value.attr(attribute))
        .map(str::to_string)
        .unwrap_or_else(|| normalize_text(&element.text().collect::<String>()))
}

/// Text nodes outside `script` and `style`, one per line.
fn page_text(document: &Html) -> String {
    document
        .root_element()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node.parent().and_then(DomElement::wrap)?;
            if matches!(parent.value().name(), "script" | "style" | "head" | "title") {
                return None;
            }
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
