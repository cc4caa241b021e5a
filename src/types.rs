use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementRect {
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// A concrete element found in the live DOM.
///
/// `handle` is an opaque driver token that addresses exactly this element
/// for follow-up calls, even when it was located by role or text. The page
/// markup is never modified to produce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRef {
    pub handle: String,
    pub tag_name: String,
    /// False when the element is hidden, transparent, zero-sized or
    /// outside the viewport. Such elements can only be driven by script.
    pub visible: bool,
    pub rect: Option<ElementRect>,
}

/// Area covered by a screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capture {
    Viewport,
    /// The whole scrollable document, beyond the viewport
    FullPage,
    /// A region in document coordinates
    Region(ElementRect),
}

/// How a click reaches the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickMode {
    /// Synthesized mouse events at the element's center.
    Pointer,
    /// `element.click()` evaluated in the page.
    Script,
}
