//! Symbolic element descriptions and their resolution against the live DOM.
//!
//! A [`LocatorSpec`] is never resolved ahead of time: the element may not
//! exist until earlier steps have run. Resolution walks the DOM tree, so
//! elements hidden behind a canvas overlay or rendered at zero opacity are
//! still found; they come back with `visible = false`.

use crate::browser::Session;
use crate::core::{BrowserTrait, LocatorConfig};
use crate::errors::{HarnessError, Result};
use crate::types::ElementRef;
use regex::Regex;
use scraper::error::SelectorErrorKind;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocatorSpec {
    /// Exact match on the configured test attributes, tried in order.
    TestId { test_id: String },
    /// Exact match on one named attribute, e.g. `aria-label`.
    Attribute { attribute: String, value: String },
    /// ARIA role plus a case-insensitive accessible-name substring.
    Role {
        role: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        nth: usize,
    },
    Css {
        css: String,
        #[serde(default)]
        nth: usize,
    },
    /// Innermost element containing the text. Last resort: label text
    /// changes with copy edits and locales.
    Text { text: String },
    /// First member that resolves wins.
    Any { any: Vec<LocatorSpec> },
}

impl LocatorSpec {
    pub fn test_id(value: impl Into<String>) -> Self {
        LocatorSpec::TestId {
            test_id: value.into(),
        }
    }

    pub fn attribute(name: impl Into<String>, value: impl Into<String>) -> Self {
        LocatorSpec::Attribute {
            attribute: name.into(),
            value: value.into(),
        }
    }

    pub fn role(role: impl Into<String>, name: Option<&str>) -> Self {
        LocatorSpec::Role {
            role: role.into(),
            name: name.map(str::to_string),
            nth: 0,
        }
    }

    pub fn css(selector: impl Into<String>) -> Self {
        LocatorSpec::Css {
            css: selector.into(),
            nth: 0,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        LocatorSpec::Text { text: text.into() }
    }

    pub fn any(members: Vec<LocatorSpec>) -> Self {
        LocatorSpec::Any { any: members }
    }

    pub fn nth(self, index: usize) -> Self {
        match self {
            LocatorSpec::Role { role, name, .. } => LocatorSpec::Role {
                role,
                name,
                nth: index,
            },
            LocatorSpec::Css { css, .. } => LocatorSpec::Css { css, nth: index },
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LocatorSpec::TestId { test_id } if test_id.is_empty() => {
                Err(invalid("test_id must not be empty"))
            }
            LocatorSpec::Attribute { attribute, .. } if !is_attribute_name(attribute) => {
                Err(invalid(format!("'{}' is not a valid attribute name", attribute)))
            }
            LocatorSpec::Role { role, .. } if role.trim().is_empty() => {
                Err(invalid("role must not be empty"))
            }
            LocatorSpec::Css { css, .. } if css.trim().is_empty() => {
                Err(invalid("css selector must not be empty"))
            }
            LocatorSpec::Css { css, .. } => check_css(css),
            LocatorSpec::Text { text } if normalize_text(text).is_empty() => {
                Err(invalid("text must not be empty"))
            }
            LocatorSpec::Any { any } if any.is_empty() => {
                Err(invalid("any must list at least one locator"))
            }
            LocatorSpec::Any { any } => any.iter().try_for_each(LocatorSpec::validate),
            _ => Ok(()),
        }
    }
}

/// Rejects selectors that do not parse as CSS at all. Pseudo-classes the
/// parser does not implement, such as `:has()`, are left to the browser.
pub fn check_css(selector: &str) -> Result<()> {
    match Selector::parse(selector) {
        Ok(_) | Err(SelectorErrorKind::UnexpectedSelectorParseError(_)) => Ok(()),
        Err(e) => Err(invalid(format!("'{}' is not a valid CSS selector: {}", selector, e))),
    }
}

fn invalid(message: impl Into<String>) -> HarnessError {
    HarnessError::ConfigurationError(format!("invalid locator: {}", message.into()))
}

impl fmt::Display for LocatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocatorSpec::TestId { test_id } => write!(f, "test id '{}'", test_id),
            LocatorSpec::Attribute { attribute, value } => {
                write!(f, "[{}=\"{}\"]", attribute, value)
            }
            LocatorSpec::Role { role, name, nth } => {
                write!(f, "role {}", role)?;
                if let Some(name) = name {
                    write!(f, " named '{}'", name)?;
                }
                if *nth > 0 {
                    write!(f, " (#{})", nth)?;
                }
                Ok(())
            }
            LocatorSpec::Css { css, nth } if *nth > 0 => write!(f, "css '{}' (#{})", css, nth),
            LocatorSpec::Css { css, .. } => write!(f, "css '{}'", css),
            LocatorSpec::Text { text } => write!(f, "text '{}'", text),
            LocatorSpec::Any { any } => {
                let members: Vec<String> = any.iter().map(|m| m.to_string()).collect();
                write!(f, "any of [{}]", members.join(", "))
            }
        }
    }
}

/// A single driver-level lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementQuery {
    Css { selector: String, nth: usize },
    Role {
        role: String,
        name: Option<String>,
        nth: usize,
    },
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(ElementRef),
    NotFound,
}

impl Resolution {
    pub fn found(self) -> Option<ElementRef> {
        match self {
            Resolution::Found(element) => Some(element),
            Resolution::NotFound => None,
        }
    }
}

pub struct LocatorResolver;

impl LocatorResolver {
    pub async fn resolve<B: BrowserTrait>(
        session: &Session<B>,
        spec: &LocatorSpec,
    ) -> Result<Resolution> {
        let tab = session.require_navigated()?;
        Self::resolve_in(session.browser(), tab, &session.config().locator, spec).await
    }

    pub async fn resolve_in<B: BrowserTrait>(
        browser: &B,
        tab: &B::TabHandle,
        config: &LocatorConfig,
        spec: &LocatorSpec,
    ) -> Result<Resolution> {
        spec.validate()?;

        for query in Self::plan(spec, config) {
            let found = match &query {
                ElementQuery::Css { selector, nth } => {
                    browser.query_selector(tab, selector, *nth).await?
                }
                ElementQuery::Role { role, name, nth } => {
                    browser.query_role(tab, role, name.as_deref(), *nth).await?
                }
                ElementQuery::Text(text) => browser.query_text(tab, text).await?,
            };

            if let Some(element) = found {
                debug!(locator = %spec, query = ?query, visible = element.visible, "Locator resolved");
                return Ok(Resolution::Found(element));
            }
        }

        debug!(locator = %spec, "Locator did not resolve");
        Ok(Resolution::NotFound)
    }

    /// Ordered list of driver queries for a spec.
    pub fn plan(spec: &LocatorSpec, config: &LocatorConfig) -> Vec<ElementQuery> {
        match spec {
            LocatorSpec::TestId { test_id } => config
                .test_attributes
                .iter()
                .filter(|attribute| is_attribute_name(attribute))
                .map(|attribute| ElementQuery::Css {
                    selector: attribute_selector(attribute, test_id),
                    nth: 0,
                })
                .collect(),
            LocatorSpec::Attribute { attribute, value } => vec![ElementQuery::Css {
                selector: attribute_selector(attribute, value),
                nth: 0,
            }],
            LocatorSpec::Role { role, name, nth } => vec![ElementQuery::Role {
                role: role.to_ascii_lowercase(),
                name: name.clone(),
                nth: *nth,
            }],
            LocatorSpec::Css { css, nth } => vec![ElementQuery::Css {
                selector: css.clone(),
                nth: *nth,
            }],
            LocatorSpec::Text { text } => vec![ElementQuery::Text(text.clone())],
            LocatorSpec::Any { any } => any.iter().flat_map(|m| Self::plan(m, config)).collect(),
        }
    }
}

fn is_attribute_name(name: &str) -> bool {
    static ATTRIBUTE: OnceLock<Regex> = OnceLock::new();
    ATTRIBUTE
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_:.-]*$").expect("static regex"))
        .is_match(name)
}

/// `[name="value"]` with the value escaped as a CSS string.
pub fn attribute_selector(name: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("[{}=\"{}\"]", name, escaped)
}

/// Collapse whitespace runs and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accessible-name comparison: case-insensitive substring on normalized text.
pub fn accessible_name_matches(candidate: &str, wanted: &str) -> bool {
    normalize_text(candidate)
        .to_lowercase()
        .contains(&normalize_text(wanted).to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::testing::FakeBrowser;

    const SEQUENCER: &str = r#"
        <canvas width="800" height="600"></canvas>
        <div style="opacity: 0">
            <button aria-label="Toggle kick step 1" data-testid="toggle-step-1">1</button>
            <button aria-label="Toggle kick step 5">5</button>
        </div>
        <button id="intro-close">Let's Make a Beat!</button>
        <input type="range" aria-label="Tempo">
        <input type="range" aria-label="Reverb mix">
    "#;

    async fn session_with(html: &str) -> Session<FakeBrowser> {
        let browser = FakeBrowser::new();
        browser.route("http://app.test/", html);
        let mut session = Session::open(browser, Config::default()).await.unwrap();
        session.navigate("http://app.test/").await.unwrap();
        session
    }

    #[test]
    fn test_test_id_plan_follows_configured_attributes() {
        let plan = LocatorResolver::plan(&LocatorSpec::test_id("toggle-step-1"), &LocatorConfig::default());
        assert_eq!(
            plan,
            vec![
                ElementQuery::Css { selector: r#"[data-testid="toggle-step-1"]"#.into(), nth: 0 },
                ElementQuery::Css { selector: r#"[data-test="toggle-step-1"]"#.into(), nth: 0 },
                ElementQuery::Css { selector: r#"[id="toggle-step-1"]"#.into(), nth: 0 },
            ]
        );
    }

    #[test]
    fn test_attribute_selector_escapes_quotes() {
        assert_eq!(
            attribute_selector("aria-label", r#"Say "hi" \o/"#),
            r#"[aria-label="Say \"hi\" \\o/"]"#
        );
    }

    #[test]
    fn test_accessible_name_is_case_insensitive_substring() {
        assert!(accessible_name_matches("Let's Make a Beat!", "let's make a beat"));
        assert!(accessible_name_matches("  Toggle\n kick   step 1 ", "toggle kick step 1"));
        assert!(!accessible_name_matches("Reverb", "Delay"));
    }

    #[test]
    fn test_validation_rejects_empty_and_bad_attributes() {
        assert!(LocatorSpec::any(vec![]).validate().is_err());
        assert!(LocatorSpec::attribute("bad name", "x").validate().is_err());
        assert!(LocatorSpec::any(vec![LocatorSpec::css("  ")]).validate().is_err());
        assert!(LocatorSpec::attribute("aria-label", "Toggle kick step 1").validate().is_ok());
    }

    #[test]
    fn test_malformed_css_is_rejected() {
        assert!(LocatorSpec::css("div[").validate().is_err());
        assert!(LocatorSpec::css("button[aria-label=").validate().is_err());
        assert!(LocatorSpec::any(vec![LocatorSpec::test_id("go"), LocatorSpec::css("div[data-x")])
            .validate()
            .is_err());

        assert!(LocatorSpec::css(".sequencer > button:nth-child(2)").validate().is_ok());
    }

    #[test]
    fn test_locators_deserialize_from_toml_tables() {
        #[derive(Deserialize)]
        struct Holder {
            locators: Vec<LocatorSpec>,
        }
        let holder: Holder = toml::from_str(
            r#"
            locators = [
                { test_id = "toggle-step-1" },
                { attribute = "aria-label", value = "Toggle kick step 5" },
                { role = "slider", nth = 1 },
                { css = ".w-full" },
                { text = "Start Engine" },
                { any = [{ test_id = "reverb" }, { role = "button", name = "Reverb" }] },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(holder.locators[0], LocatorSpec::test_id("toggle-step-1"));
        assert_eq!(holder.locators[2], LocatorSpec::role("slider", None).nth(1));
        assert_eq!(holder.locators[4], LocatorSpec::text("Start Engine"));
        assert_eq!(
            holder.locators[5],
            LocatorSpec::any(vec![
                LocatorSpec::test_id("reverb"),
                LocatorSpec::role("button", Some("Reverb")),
            ])
        );
    }

    #[tokio::test]
    async fn test_resolves_elements_behind_transparent_overlay() {
        let session = session_with(SEQUENCER).await;

        let element = LocatorResolver::resolve(&session, &LocatorSpec::test_id("toggle-step-1"))
            .await
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(element.tag_name, "button");
        assert!(!element.visible);

        let by_label = LocatorResolver::resolve(
            &session,
            &LocatorSpec::attribute("aria-label", "Toggle kick step 5"),
        )
        .await
        .unwrap();
        assert!(matches!(by_label, Resolution::Found(ref e) if !e.visible));
    }

    #[tokio::test]
    async fn test_role_fallback_and_nth() {
        let session = session_with(SEQUENCER).await;

        let spec = LocatorSpec::any(vec![
            LocatorSpec::test_id("intro-dismiss"),
            LocatorSpec::role("button", Some("Let's Make a Beat")),
        ]);
        let intro = LocatorResolver::resolve(&session, &spec).await.unwrap().found().unwrap();
        assert!(intro.visible);

        let slider = LocatorResolver::resolve(&session, &LocatorSpec::role("slider", None).nth(1))
            .await
            .unwrap()
            .found()
            .unwrap();
        let reverb = LocatorResolver::resolve(&session, &LocatorSpec::attribute("aria-label", "Reverb mix"))
            .await
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(slider.handle, reverb.handle);
    }

    #[tokio::test]
    async fn test_missing_element_is_not_found() {
        let session = session_with(SEQUENCER).await;
        let resolution = LocatorResolver::resolve(&session, &LocatorSpec::test_id("toggle-step-99"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_resolution_before_navigation_is_precondition_error() {
        let session = Session::open(FakeBrowser::new(), Config::default()).await.unwrap();
        let err = LocatorResolver::resolve(&session, &LocatorSpec::test_id("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Precondition(_)));
    }
}
