//! HTML sanitizer policies shared by both annotation call sites.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use url::Url;

/// Tags a chronicle author may use directly in prose, notes and definitions.
pub const ALLOWED_TAGS: &[&str] = &[
    "a", "b", "strong", "i", "em", "u", "s", "del", "mark", "br", "p", "ul", "ol", "li",
    "blockquote", "code", "pre", "h1", "h2", "h3", "h4", "span",
];

static FRAGMENT: LazyLock<ammonia::Builder<'static>> = LazyLock::new(|| {
    let mut b = ammonia::Builder::default();
    b.tags(ALLOWED_TAGS.iter().copied().collect())
        .generic_attributes(HashSet::new())
        .tag_attributes(HashMap::from([("a", HashSet::from(["href"]))]))
        .clean_content_tags(HashSet::from(["script", "style"]))
        .link_rel(Some("noopener noreferrer"))
        .strip_comments(true);
    b
});

// No tags, no attributes: whatever survives is escaped text.
static TEXT_ONLY: LazyLock<ammonia::Builder<'static>> = LazyLock::new(|| {
    let mut b = ammonia::Builder::empty();
    b.clean_content_tags(HashSet::from(["script", "style"]))
        .strip_comments(true);
    b
});

/// Sanitize user-authored markup against the allow-list.
///
/// A `<` that cannot open a complete tag is kept as text, so `a<b c` stays readable
/// instead of being parsed as an unterminated `<b>`.
pub fn clean_fragment(src: &str) -> String {
    FRAGMENT.clean(&escape_stray_lt(src)).to_string()
}

fn escape_stray_lt(src: &str) -> Cow<'_, str> {
    if !src.contains('<') {
        return Cow::Borrowed(src);
    }
    let mut out = String::with_capacity(src.len() + 8);
    let mut rest = src;
    while let Some(i) = rest.find('<') {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        if opens_tag(tail) {
            out.push('<');
        } else {
            out.push_str("&lt;");
        }
        rest = &tail[1..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn opens_tag(s: &str) -> bool {
    let starts_name = s[1..]
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));
    starts_name && tag_end(s).is_some()
}

/// Byte index of the `>` closing the tag that opens `s`.
///
/// Quoted attribute values may hold `>`. An unquoted `<` first means the tag never closes.
pub(crate) fn tag_end(s: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            (None, '<') => return None,
            (None, _) => {}
        }
    }
    None
}

/// Sanitize an image URL for use as a double-quoted `src` attribute.
///
/// Returns `None` when nothing usable remains or the URL carries a scheme other than
/// `http`/`https`. Relative paths are kept.
pub fn clean_image_url(raw: &str) -> Option<String> {
    let text = TEXT_ONLY.clean(raw.trim()).to_string();
    if text.is_empty() {
        return None;
    }
    if !has_web_scheme(&text) {
        tracing::warn!(url = %text, "dropping glossary image with unsupported scheme");
        return None;
    }
    Some(text.replace('"', "&quot;"))
}

// Relative references have no scheme to check; absolute ones must be http(s).
fn has_web_scheme(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(url::ParseError::RelativeUrlWithoutBase) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_and_handlers() {
        let out = clean_fragment(r#"<p onclick="x()">hi</p><script>alert(1)</script>"#);
        assert_eq!(out, "<p>hi</p>");
    }

    #[test]
    fn keeps_allowed_formatting() {
        let out = clean_fragment("<em>Kindred</em> &amp; <strong>kine</strong>");
        assert_eq!(out, "<em>Kindred</em> &amp; <strong>kine</strong>");
        let out = clean_fragment(r#"<a href="https://example.com" style="color:red">x</a>"#);
        assert!(out.contains(r#"href="https://example.com""#), "{out}");
        assert!(out.contains(r#"rel="noopener noreferrer""#), "{out}");
        assert!(!out.contains("style"), "{out}");
    }

    #[test]
    fn leaves_markup_markers_alone() {
        assert_eq!(clean_fragment("==bold== ^[note]"), "==bold== ^[note]");
    }

    #[test]
    fn already_clean_text_is_not_double_encoded() {
        let once = clean_fragment("a < b & c");
        assert_eq!(once, "a &lt; b &amp; c");
        assert_eq!(clean_fragment(&once), once);
    }

    #[test]
    fn stray_angle_brackets_are_text() {
        assert_eq!(clean_fragment("a<b c"), "a&lt;b c");
        assert_eq!(clean_fragment("x<3 and <em>y</em>"), "x&lt;3 and <em>y</em>");
        assert_eq!(clean_fragment("a<b c <em>d</em>"), "a&lt;b c <em>d</em>");
        assert!(clean_fragment(r#"<b title="a<b">ok</b>"#).starts_with("<b>ok"));
        let once = clean_fragment("a<b c");
        assert_eq!(clean_fragment(&once), once);
    }

    #[test]
    fn image_urls() {
        assert_eq!(
            clean_image_url(" https://cdn.example.com/a.png?x=1&y=2 ").as_deref(),
            Some("https://cdn.example.com/a.png?x=1&amp;y=2")
        );
        assert_eq!(
            clean_image_url("/img/prince.png").as_deref(),
            Some("/img/prince.png")
        );
        assert_eq!(clean_image_url("javascript:alert(1)"), None);
        assert_eq!(clean_image_url("data:image/png;base64,AAAA"), None);
        assert_eq!(clean_image_url(""), None);
        assert_eq!(clean_image_url("JavaScript:alert(1)"), None);
        assert_eq!(clean_image_url("java\tscript:alert(1)"), None);
        assert_eq!(clean_image_url("mailto:x@example.com"), None);
        assert_eq!(
            clean_image_url("HTTPS://cdn.example/a.png").as_deref(),
            Some("HTTPS://cdn.example/a.png")
        );
        assert_eq!(
            clean_image_url("img/a:b.png").as_deref(),
            Some("img/a:b.png")
        );
        assert_eq!(
            clean_image_url("//cdn.example/a.png").as_deref(),
            Some("//cdn.example/a.png")
        );

        let out = clean_image_url(r#"x.png" onerror="alert(1)"#).unwrap();
        assert!(!out.contains('"'));
        let out = clean_image_url("<img src=x onerror=alert(1)>y.png").unwrap();
        assert!(!out.contains('<'));
    }
}
