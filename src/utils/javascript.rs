//! Page-side scripts used by the Chrome driver.
//!
//! Every element query returns the same JSON shape (see [`ElementRef`]).
//! Matched elements are registered in a page-global map keyed by handle,
//! held through `WeakRef`, so follow-up calls can address them without
//! touching the application's markup.
//!
//! [`ElementRef`]: crate::types::ElementRef

use regex::Regex;
use std::sync::OnceLock;

pub const READY_STATE: &str = "document.readyState";

pub const PAGE_TEXT: &str = "document.body ? document.body.innerText : ''";

pub const CLEAR_STORAGE: &str = r#"
    (function() {
        try {
            document.cookie.split(';').forEach(cookie => {
                const name = cookie.split('=')[0].trim();
                if (name) {
                    document.cookie = name + '=; expires=Thu, 01 Jan 1970 00:00:00 UTC; path=/;';
                    document.cookie = name + '=; expires=Thu, 01 Jan 1970 00:00:00 UTC; path=/; domain=' + window.location.hostname + ';';
                }
            });

            localStorage.clear();
            sessionStorage.clear();

            if (window.indexedDB && indexedDB.databases) {
                indexedDB.databases().then(databases => {
                    databases.forEach(db => indexedDB.deleteDatabase(db.name));
                }).catch(() => {});
            }

            if ('caches' in window) {
                caches.keys().then(names => names.forEach(name => caches.delete(name))).catch(() => {});
            }

            return { success: true };
        } catch (error) {
            return { success: false, error: String(error && error.message || error) };
        }
    })()
"#;

/// Handle registry, scoped to the window of the current document.
const REGISTRY: &str = r#"
    const registry = () => {
        if (!window.__uiVerifyRefs) {
            Object.defineProperty(window, '__uiVerifyRefs', {
                value: { ids: new WeakMap(), elements: new Map() },
                enumerable: false
            });
        }
        return window.__uiVerifyRefs;
    };
    const lookup = (handle) => {
        const held = registry().elements.get(handle);
        const el = held && held.deref();
        return el && el.isConnected ? el : null;
    };
"#;

/// Shared helpers injected in front of every query script.
const DESCRIBE: &str = r#"
    const hiddenByStyle = (el) => {
        for (let node = el; node && node.nodeType === 1; node = node.parentElement) {
            const style = window.getComputedStyle(node);
            if (style.display === 'none' || style.visibility === 'hidden' || parseFloat(style.opacity) === 0) {
                return true;
            }
        }
        return false;
    };
    const describe = (el, freshRef) => {
        const refs = registry();
        let ref = refs.ids.get(el);
        if (!ref) {
            ref = freshRef;
            refs.ids.set(el, ref);
            refs.elements.set(ref, new WeakRef(el));
        }
        const rect = el.getBoundingClientRect();
        let visible = rect.width > 0 && rect.height > 0 && !hiddenByStyle(el);
        if (visible) {
            const cx = rect.left + rect.width / 2;
            const cy = rect.top + rect.height / 2;
            const inViewport = cx >= 0 && cy >= 0 && cx < window.innerWidth && cy < window.innerHeight;
            const top = inViewport ? document.elementFromPoint(cx, cy) : null;
            visible = !!top && (top === el || el.contains(top));
        }
        return {
            handle: ref,
            tag_name: el.tagName.toLowerCase(),
            visible: visible,
            rect: { x: rect.x + window.scrollX, y: rect.y + window.scrollY, width: rect.width, height: rect.height }
        };
    };
    const normalize = (text) => (text || '').replace(/\s+/g, ' ').trim();
"#;

const ROLE_HELPERS: &str = r#"
    const implicitRole = (el) => {
        const tag = el.tagName.toLowerCase();
        if (tag === 'button' || tag === 'summary') return 'button';
        if (tag === 'a' && el.hasAttribute('href')) return 'link';
        if (tag === 'select') return 'combobox';
        if (tag === 'textarea') return 'textbox';
        if (tag === 'img') return 'img';
        if (/^h[1-6]$/.test(tag)) return 'heading';
        if (tag === 'input') {
            const type = (el.getAttribute('type') || 'text').toLowerCase();
            if (type === 'range') return 'slider';
            if (type === 'checkbox') return 'checkbox';
            if (type === 'radio') return 'radio';
            if (['button', 'submit', 'reset', 'image'].includes(type)) return 'button';
            return 'textbox';
        }
        return null;
    };
    const accessibleName = (el) => {
        const label = el.getAttribute('aria-label');
        if (label) return normalize(label);
        const labelledBy = el.getAttribute('aria-labelledby');
        if (labelledBy) {
            const text = labelledBy.split(/\s+/)
                .map(id => document.getElementById(id))
                .filter(Boolean)
                .map(node => node.textContent)
                .join(' ');
            if (normalize(text)) return normalize(text);
        }
        return normalize(el.textContent || el.getAttribute('title') || el.getAttribute('alt') || el.value || '');
    };
"#;

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn with_helpers(body: &str) -> String {
    format!("(function() {{\n{}\n{}\n{}\n}})()", REGISTRY, DESCRIBE, body)
}

/// Identifies the live document: the value is stored on first read and
/// disappears with the document.
pub fn document_token(fresh: &str) -> String {
    format!(
        r#"
    (function() {{
        if (!window.__uiVerifyDocument) {{
            Object.defineProperty(window, '__uiVerifyDocument', {{ value: {fresh}, enumerable: false }});
        }}
        return window.__uiVerifyDocument;
    }})()
"#,
        fresh = js_string(fresh)
    )
}

pub fn query_selector(selector: &str, nth: usize, fresh_ref: &str) -> String {
    with_helpers(&format!(
        r#"
    let matches;
    try {{
        matches = document.querySelectorAll({selector});
    }} catch (e) {{
        return {{ error: 'invalid selector: ' + e.message }};
    }}
    const el = matches[{nth}];
    return el ? describe(el, {fresh_ref}) : null;
"#,
        selector = js_string(selector),
        nth = nth,
        fresh_ref = js_string(fresh_ref),
    ))
}

pub fn query_role(role: &str, name: Option<&str>, nth: usize, fresh_ref: &str) -> String {
    let name = name.map(js_string).unwrap_or_else(|| "null".to_string());
    with_helpers(&format!(
        r#"
{helpers}
    const wanted = {name};
    const matches = Array.from(document.querySelectorAll('*')).filter(el => {{
        const role = (el.getAttribute('role') || implicitRole(el) || '').toLowerCase();
        if (role !== {role}) return false;
        return wanted === null || accessibleName(el).toLowerCase().includes(wanted.toLowerCase());
    }});
    const el = matches[{nth}];
    return el ? describe(el, {fresh_ref}) : null;
"#,
        helpers = ROLE_HELPERS,
        name = name,
        role = js_string(&role.to_ascii_lowercase()),
        nth = nth,
        fresh_ref = js_string(fresh_ref),
    ))
}

pub fn query_text(text: &str, fresh_ref: &str) -> String {
    with_helpers(&format!(
        r#"
    const wanted = normalize({text}).toLowerCase();
    if (!document.body || !wanted) return null;
    const hits = Array.from(document.body.querySelectorAll('*')).filter(el =>
        !['script', 'style'].includes(el.tagName.toLowerCase()) &&
        normalize(el.textContent).toLowerCase().includes(wanted));
    const innermost = hits.filter(el => !hits.some(other => other !== el && el.contains(other)));
    return innermost.length ? describe(innermost[0], {fresh_ref}) : null;
"#,
        text = js_string(text),
        fresh_ref = js_string(fresh_ref),
    ))
}

pub fn script_click(handle: &str) -> String {
    with_helpers(&format!(
        r#"
    const el = lookup({handle});
    if (!el) return false;
    el.click();
    return true;
"#,
        handle = js_string(handle)
    ))
}

/// Scrolls the element into view and returns its center in viewport
/// coordinates, or null once it has left the document.
pub fn pointer_target(handle: &str) -> String {
    with_helpers(&format!(
        r#"
    const el = lookup({handle});
    if (!el) return null;
    el.scrollIntoView({{ block: 'center', inline: 'center' }});
    const rect = el.getBoundingClientRect();
    return {{ x: rect.left + rect.width / 2, y: rect.top + rect.height / 2 }};
"#,
        handle = js_string(handle)
    ))
}

/// True for `() => ...`, `async () => ...` and `function` sources, which
/// are invoked rather than evaluated as statements.
pub fn is_function_source(script: &str) -> bool {
    static FUNCTION_HEAD: OnceLock<Regex> = OnceLock::new();
    FUNCTION_HEAD
        .get_or_init(|| {
            Regex::new(r"^\s*(async\s+)?(function\b|(\([^()]*\)|[A-Za-z_$][\w$]*)\s*=>)")
                .expect("static regex")
        })
        .is_match(script)
}
