//! Lore annotation: marked-up prose in, sanitized tooltip HTML out.
//!
//! The body is sanitized once on entry. Highlight and note markers are matched over
//! the sanitized body, so they may wrap inline tags, but a delimiter never counts
//! when it sits inside a tag. What remains is split into text runs and frozen markup
//! before glossary matching, so markup inserted by an earlier stage (highlights,
//! notes, longer glossary terms) is never matched again.
//!
//! Stages, in order:
//! 1. empty input short-circuits;
//! 2. `==text==` becomes a highlight;
//! 3. `^[text]` becomes a `?` tooltip holding the note;
//! 4. glossary terms, longest first, become tooltips holding their definition;
//! 5. notes, definitions and image URLs go through [`crate::sanitize`];
//! 6. chronicle output also reports reading time of the original text.

use std::sync::LazyLock;

use chronicle_protocol::{AnnotationResult, GlossaryTerm, ReadingTime, Variant};
use regex::Regex;

use crate::sanitize;

pub const WORDS_PER_MINUTE: u32 = 250;

static HIGHLIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"==([^=]+)==").expect("valid regex"));
static NOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\^\[([^\]]+)\]").expect("valid regex"));
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#[0-9]+|#[xX][0-9a-fA-F]+|[A-Za-z][A-Za-z0-9]*);").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    /// Escaped prose still open to substitution.
    Text(String),
    /// Tags and inserted widgets; emitted as-is.
    Markup(String),
}

#[derive(Debug, Clone, Copy)]
enum TooltipKind {
    Note,
    Term,
}

impl TooltipKind {
    fn modifier(self) -> &'static str {
        match self {
            TooltipKind::Note => "note",
            TooltipKind::Term => "term",
        }
    }
}

/// Render `text` for the given call site.
///
/// `None` and `""` yield an empty result; nothing here can fail.
pub fn annotate(text: Option<&str>, glossary: &[GlossaryTerm], variant: Variant) -> AnnotationResult {
    let raw = match text {
        Some(t) if !t.is_empty() => t,
        _ => return AnnotationResult::empty(variant),
    };

    let body = sanitize::clean_fragment(raw);
    let mut pieces = vec![Piece::Text(body)];
    pieces = splice(pieces, |text| highlight(text, variant));
    pieces = splice(pieces, |text| notes(text, variant));
    pieces = splice(pieces, split_markup);
    let matched = apply_glossary(&mut pieces, glossary, variant);

    let content = render(&pieces);
    tracing::debug!(
        ?variant,
        input_len = raw.len(),
        glossary = glossary.len(),
        matched,
        "annotated text"
    );

    match variant {
        Variant::Chronicle => AnnotationResult {
            content,
            reading_time: Some(reading_time(raw)),
            footnotes: Some(Vec::new()),
        },
        Variant::EditorPreview => AnnotationResult {
            content,
            reading_time: None,
            footnotes: None,
        },
    }
}

/// Whitespace-separated word count and minutes at [`WORDS_PER_MINUTE`], rounded up.
pub fn reading_time(text: &str) -> ReadingTime {
    let words = text.split_whitespace().count() as u32;
    ReadingTime {
        words,
        minutes: words.div_ceil(WORDS_PER_MINUTE),
    }
}

/// Decode a glossary from untyped JSON.
///
/// Anything other than an array yields an empty glossary. Entries without a string
/// `term` are dropped; blank terms are kept here and skipped at match time.
pub fn glossary_from_value(value: &serde_json::Value) -> Vec<GlossaryTerm> {
    let Some(items) = value.as_array() else {
        if !value.is_null() {
            tracing::warn!("glossary is not an array; skipping glossary substitution");
        }
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let term = obj.get("term")?.as_str()?;
            let definition = obj
                .get("definition")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let image = obj
                .get("image")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty());
            Some(GlossaryTerm {
                term: term.to_string(),
                definition: definition.to_string(),
                image: image.map(str::to_string),
            })
        })
        .collect()
}

fn split_markup(html: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for (start, end) in tag_spans(html) {
        if start > last {
            pieces.push(Piece::Text(html[last..start].to_string()));
        }
        pieces.push(Piece::Markup(html[start..end].to_string()));
        last = end;
    }
    if last < html.len() {
        pieces.push(Piece::Text(html[last..].to_string()));
    }
    pieces
}

fn tag_spans(html: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(i) = html[from..].find('<') {
        let start = from + i;
        let end = sanitize::tag_end(&html[start..]).map_or(html.len(), |e| start + e + 1);
        spans.push((start, end));
        from = end;
    }
    spans
}

// Every tag opened inside `fragment` is closed inside it, in order.
fn balanced(fragment: &str) -> bool {
    let mut open = Vec::new();
    for (start, end) in tag_spans(fragment) {
        let tag = &fragment[start + 1..end];
        let (closing, tag) = match tag.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, tag),
        };
        let name: String = tag
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if closing {
            if open.pop() != Some(name) {
                return false;
            }
        } else if name != "br" {
            open.push(name);
        }
    }
    open.is_empty()
}

fn splice(pieces: Vec<Piece>, mut f: impl FnMut(&str) -> Vec<Piece>) -> Vec<Piece> {
    let mut out = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match piece {
            Piece::Text(text) => out.extend(f(&text)),
            markup => out.push(markup),
        }
    }
    out
}

fn replace_matches(
    text: &str,
    re: &Regex,
    mut widget: impl FnMut(&regex::Captures<'_>) -> Vec<Piece>,
) -> Vec<Piece> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        if m.start() > last {
            out.push(Piece::Text(text[last..m.start()].to_string()));
        }
        out.extend(widget(&caps));
        last = m.end();
    }
    if last < text.len() {
        out.push(Piece::Text(text[last..].to_string()));
    }
    out
}

/// Like [`replace_matches`] for `==`/`^[` markers over text that still holds tags.
///
/// A match is taken only when both delimiters sit outside tags and the wrapped markup
/// is balanced; otherwise scanning resumes one byte past the rejected start.
fn replace_markers(
    text: &str,
    re: &Regex,
    mut widget: impl FnMut(&str) -> Vec<Piece>,
) -> Vec<Piece> {
    let tags = tag_spans(text);
    let inside_tag = |pos: usize| tags.iter().any(|&(s, e)| s <= pos && pos < e);

    let mut out = Vec::new();
    let mut last = 0;
    let mut at = 0;
    while let Some(caps) = re.captures_at(text, at) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        if inside_tag(whole.start()) || inside_tag(inner.end()) || !balanced(inner.as_str()) {
            at = whole.start() + 1;
            continue;
        }
        if whole.start() > last {
            out.push(Piece::Text(text[last..whole.start()].to_string()));
        }
        out.extend(widget(inner.as_str()));
        last = whole.end();
        at = whole.end();
    }
    if last < text.len() {
        out.push(Piece::Text(text[last..].to_string()));
    }
    out
}

fn highlight(text: &str, variant: Variant) -> Vec<Piece> {
    let class = match variant {
        Variant::Chronicle => "lore-highlight",
        Variant::EditorPreview => "preview-highlight",
    };
    replace_markers(text, &HIGHLIGHT_RE, |inner| {
        // Inner text stays open so glossary terms inside a highlight still match.
        vec![
            Piece::Markup(format!(r#"<mark class="{class}">"#)),
            Piece::Text(inner.to_string()),
            Piece::Markup("</mark>".to_string()),
        ]
    })
}

fn notes(text: &str, variant: Variant) -> Vec<Piece> {
    replace_markers(text, &NOTE_RE, |inner| {
        let content = sanitize::clean_fragment(inner);
        vec![Piece::Markup(tooltip(variant, TooltipKind::Note, "?", &content))]
    })
}

fn apply_glossary(pieces: &mut Vec<Piece>, glossary: &[GlossaryTerm], variant: Variant) -> usize {
    let mut entries: Vec<(&str, &GlossaryTerm)> = glossary
        .iter()
        .map(|g| (g.term.trim(), g))
        .filter(|(term, _)| !term.is_empty())
        .collect();
    // Stable: equal lengths keep glossary order.
    entries.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

    let mut matched = 0;
    for (term, entry) in entries {
        let pattern = format!(r"(?i)\b{}\b", regex::escape(&escape_text(term)));
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!(term, error = %e, "skipping glossary term");
                continue;
            }
        };
        let content = term_content(entry);
        let taken = std::mem::take(pieces);
        *pieces = splice(taken, |text| {
            let entities: Vec<(usize, usize)> = ENTITY_RE
                .find_iter(text)
                .map(|m| (m.start(), m.end()))
                .collect();
            replace_matches(text, &re, |caps| {
                let whole = &caps[0];
                let Some(m) = caps.get(0) else {
                    return Vec::new();
                };
                if cuts_entity(&entities, m.start(), m.end()) {
                    return vec![Piece::Text(whole.to_string())];
                }
                matched += 1;
                vec![Piece::Markup(tooltip(
                    variant,
                    TooltipKind::Term,
                    whole,
                    &content,
                ))]
            })
        });
    }
    matched
}

// Text runs hold serializer-escaped text, so terms are escaped the same way before matching.
fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\u{a0}', "&nbsp;")
}

fn cuts_entity(entities: &[(usize, usize)], start: usize, end: usize) -> bool {
    entities.iter().any(|&(es, ee)| {
        let overlaps = es < end && start < ee;
        let contains = start <= es && ee <= end;
        overlaps && !contains
    })
}

fn term_content(entry: &GlossaryTerm) -> String {
    let definition = sanitize::clean_fragment(&entry.definition);
    match entry.image.as_deref().and_then(sanitize::clean_image_url) {
        Some(src) => format!(r#"<img class="lore-tooltip__image" src="{src}" alt="">{definition}"#),
        None => definition,
    }
}

fn tooltip(variant: Variant, kind: TooltipKind, trigger: &str, content: &str) -> String {
    let m = kind.modifier();
    match variant {
        // Deferred: the template node stays inert until the reader opens it.
        Variant::Chronicle => format!(
            concat!(
                r#"<span class="lore-tooltip lore-tooltip--{m}" tabindex="0">"#,
                r#"<span class="lore-tooltip__trigger">{trigger}</span>"#,
                r#"<template class="lore-tooltip__content">{content}</template>"#,
                "</span>"
            ),
            m = m,
            trigger = trigger,
            content = content,
        ),
        Variant::EditorPreview => format!(
            concat!(
                r#"<span class="preview-tooltip preview-tooltip--{m}">"#,
                r#"<span class="preview-tooltip__trigger">{trigger}</span>"#,
                r#"<span class="preview-tooltip__content" role="tooltip">{content}</span>"#,
                "</span>"
            ),
            m = m,
            trigger = trigger,
            content = content,
        ),
    }
}

fn render(pieces: &[Piece]) -> String {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Text(s) | Piece::Markup(s) => out.push_str(s),
        }
    }
    out
}
