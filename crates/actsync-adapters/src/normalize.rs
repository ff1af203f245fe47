//! Text correction and HTML sanitization applied to activity content before persistence.
//!
//! Both passes are idempotent: normalizing already-normalized content returns it
//! unchanged, which keeps content hashes stable across runs.

use std::sync::LazyLock;

use actsync_core::ActivityContent;
use regex::{Captures, Regex};
use scraper::{ElementRef, Html, Node};
use thiserror::Error;
use tracing::warn;

/// Locale artifacts some sources emit in location text.
pub const LOCATION_REPLACEMENTS: &[(&str, &str)] = &[("(Italië)", "(Italia)")];

const ALLOWED_TAGS: &[&str] = &["p", "br", "b", "i", "em", "strong", "ul", "ol", "li", "a"];

// Dropped together with everything inside them.
const OPAQUE_TAGS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "noscript", "template", "textarea",
    "select", "svg", "math", "head", "title",
];

const LINK_SCHEMES: &[&str] = &["http", "https", "mailto"];

const DEFAULT_MAX_DEPTH: usize = 256;

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
        .expect("valid script/style regex")
});
static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?(-->|$)").expect("valid comment regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(/?)\s*([a-z][a-z0-9]*)\b[^>]*>").expect("valid tag regex")
});

pub fn correct_location(location: &str) -> String {
    LOCATION_REPLACEMENTS
        .iter()
        .fold(location.to_string(), |text, (from, to)| text.replace(from, to))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("markup nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Allow-list HTML sanitizer for free-text descriptions.
#[derive(Debug, Clone)]
pub struct HtmlSanitizer {
    max_depth: usize,
}

impl Default for HtmlSanitizer {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl HtmlSanitizer {
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Parse `input` as a body fragment and re-serialize only allow-listed tags.
    /// Disallowed tags are unwrapped (their text survives) except opaque ones
    /// like `<script>`, which are removed with their content.
    pub fn sanitize(&self, input: &str) -> Result<String, SanitizeError> {
        let fragment = Html::parse_fragment(input);
        let mut out = String::with_capacity(input.len());
        self.write_children(fragment.root_element(), 0, &mut out)?;
        Ok(out)
    }

    /// Sanitize, falling back to blunt tag stripping when the markup cannot be processed.
    pub fn sanitize_or_strip(&self, input: &str) -> (String, bool) {
        match self.sanitize(input) {
            Ok(clean) => (clean, false),
            Err(err) => {
                warn!(error = %err, "html sanitizer failed, stripping tags instead");
                (strip_tags(input), true)
            }
        }
    }

    fn write_children(
        &self,
        element: ElementRef<'_>,
        depth: usize,
        out: &mut String,
    ) -> Result<(), SanitizeError> {
        if depth > self.max_depth {
            return Err(SanitizeError::TooDeep(self.max_depth));
        }
        for child in element.children() {
            match child.value() {
                Node::Text(text) => out.push_str(&escape_html(text)),
                Node::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        self.write_element(child, depth + 1, out)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn write_element(
        &self,
        element: ElementRef<'_>,
        depth: usize,
        out: &mut String,
    ) -> Result<(), SanitizeError> {
        let name = element.value().name();
        if OPAQUE_TAGS.contains(&name) {
            return Ok(());
        }
        if !ALLOWED_TAGS.contains(&name) {
            return self.write_children(element, depth, out);
        }

        out.push('<');
        out.push_str(name);
        if name == "a" {
            if let Some(href) = element.value().attr("href").and_then(safe_href) {
                out.push_str(" href=\"");
                out.push_str(&escape_html(href));
                out.push('"');
                if !href.to_ascii_lowercase().starts_with("mailto:") {
                    out.push_str(" target=\"_blank\" rel=\"noopener noreferrer\"");
                }
            }
        }
        out.push('>');

        if name == "br" {
            return Ok(());
        }
        self.write_children(element, depth, out)?;
        out.push_str("</");
        out.push_str(name);
        out.push('>');
        Ok(())
    }
}

/// Returns the trimmed href when it is an absolute http, https or mailto URL.
fn safe_href(href: &str) -> Option<&str> {
    let href = href.trim();
    let parsed = url::Url::parse(href).ok()?;
    LINK_SCHEMES
        .contains(&parsed.scheme())
        .then_some(href)
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Regex-based stripper used when the parse-tree sanitizer gives up. Allowed
/// tags survive bare, without any attributes; everything else is removed and
/// stray angle brackets in text are escaped.
pub fn strip_tags(input: &str) -> String {
    let without_blocks = SCRIPT_OR_STYLE.replace_all(input, "");
    let without_comments = COMMENT.replace_all(&without_blocks, "");
    let text = without_comments.as_ref();

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in TAG.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&escape_angle_brackets(&text[last..whole.start()]));
        out.push_str(&bare_tag(&caps));
        last = whole.end();
    }
    out.push_str(&escape_angle_brackets(&text[last..]));
    out
}

fn bare_tag(caps: &Captures<'_>) -> String {
    let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
    let name = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_TAGS.contains(&name.as_str()) || (closing && name == "br") {
        return String::new();
    }
    if closing {
        format!("</{name}>")
    } else {
        format!("<{name}>")
    }
}

fn escape_angle_brackets(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

/// What normalization changed on one activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    pub location_corrected: bool,
    pub description_sanitized: bool,
    pub sanitizer_fallback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContentNormalizer {
    sanitizer: HtmlSanitizer,
}

impl ContentNormalizer {
    pub fn new(sanitizer: HtmlSanitizer) -> Self {
        Self { sanitizer }
    }

    pub fn normalize(&self, content: &mut ActivityContent) -> NormalizeOutcome {
        let mut outcome = NormalizeOutcome::default();

        if let Some(location) = content.location.as_mut() {
            let corrected = correct_location(location);
            if corrected != *location {
                *location = corrected;
                outcome.location_corrected = true;
            }
        }

        if let Some(description) = content.description.as_mut().filter(|d| !d.is_empty()) {
            let (clean, fallback) = self.sanitizer.sanitize_or_strip(description);
            outcome.description_sanitized = clean != *description;
            outcome.sanitizer_fallback = fallback;
            *description = clean;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitize(input: &str) -> String {
        HtmlSanitizer::default().sanitize(input).expect("sanitize")
    }

    #[test]
    fn allow_list_removes_script_and_unsafe_links() {
        let out = sanitize(
            "<script>alert(1)</script><p>ok</p><a href='javascript:x()'>bad</a><a href='https://x.test'>good</a>",
        );
        assert_eq!(
            out,
            "<p>ok</p><a>bad</a><a href=\"https://x.test\" target=\"_blank\" rel=\"noopener noreferrer\">good</a>"
        );
        assert!(!out.contains("script"));
        assert!(!out.contains("javascript"));
    }

    #[test]
    fn attributes_are_stripped_from_retained_tags() {
        let out = sanitize(
            r#"<p style="color:red" onclick="steal()">Hi <strong class="x">there</strong></p><img src=x onerror=alert(1)>"#,
        );
        assert_eq!(out, "<p>Hi <strong>there</strong></p>");
    }

    #[test]
    fn disallowed_wrappers_are_unwrapped_and_text_escaped() {
        let out = sanitize("<div><span>5 &lt; 6 &amp; &quot;ok&quot;</span><br/><ul><li>one</li></ul></div>");
        assert_eq!(out, "5 &lt; 6 &amp; &quot;ok&quot;<br><ul><li>one</li></ul>");
    }

    #[test]
    fn mailto_links_keep_href_without_target() {
        let out = sanitize(r#"<a href="mailto:info@example.test" target="_self">write</a>"#);
        assert_eq!(out, r#"<a href="mailto:info@example.test">write</a>"#);
    }

    #[test]
    fn relative_and_data_links_lose_href() {
        assert_eq!(sanitize(r#"<a href="/local">x</a>"#), "<a>x</a>");
        assert_eq!(sanitize(r#"<a href="data:text/html,hi">x</a>"#), "<a>x</a>");
        assert_eq!(sanitize(r#"<a href=" java	script:alert(1)">x</a>"#), "<a>x</a>");
    }

    #[test]
    fn sanitizing_is_idempotent() {
        let once = sanitize(
            r#"<p>Tom &amp; Jerry "live"</p><a href="https://x.test/?a=1&b=2">go</a><em>done</em>"#,
        );
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn deep_nesting_falls_back_to_tag_stripping() {
        let input = format!("{}deep<b onclick=\"x()\">bold</b>{}", "<div>".repeat(40), "</div>".repeat(40));
        let sanitizer = HtmlSanitizer::with_max_depth(10);
        assert_eq!(sanitizer.sanitize(&input), Err(SanitizeError::TooDeep(10)));

        let (out, fallback) = sanitizer.sanitize_or_strip(&input);
        assert!(fallback);
        assert_eq!(out, "deep<b>bold</b>");
    }

    #[test]
    fn strip_tags_keeps_bare_allowed_tags() {
        let out = strip_tags(
            "<script>evil()</script><!-- note --><p class=x>a</p><a href=\"javascript:y\">b</a><br/> 1 > 0<table>t</table>",
        );
        assert_eq!(out, "<p>a</p><a>b</a><br> 1 &gt; 0t");
    }

    #[test]
    fn location_correction_is_idempotent() {
        let fixed = correct_location("Roma (Italië)");
        assert_eq!(fixed, "Roma (Italia)");
        assert_eq!(correct_location(&fixed), fixed);
    }

    #[test]
    fn normalizer_reports_changes() {
        let mut content = actsync_core::RawActivity::from_json(serde_json::json!({
            "id": 1,
            "location": "Milano (Italië)",
            "description": "<p onclick=\"x\">hi</p>"
        }))
        .expect("decode")
        .into_content(1);

        let outcome = ContentNormalizer::default().normalize(&mut content);
        assert!(outcome.location_corrected);
        assert!(outcome.description_sanitized);
        assert!(!outcome.sanitizer_fallback);
        assert_eq!(content.location.as_deref(), Some("Milano (Italia)"));
        assert_eq!(content.description.as_deref(), Some("<p>hi</p>"));

        let again = ContentNormalizer::default().normalize(&mut content);
        assert_eq!(again, NormalizeOutcome::default());
    }
}
