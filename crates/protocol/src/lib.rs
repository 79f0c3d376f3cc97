use serde::{Deserialize, Serialize};

/// Replaces the inner HTML of the element whose id is `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl Patch {
    pub fn replace(target: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            html: Some(html.into()),
            payload: None,
            trigger: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiUpdate {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub patches: Vec<Patch>,
}

impl UiUpdate {
    pub fn new(event: impl Into<String>, patches: Vec<Patch>) -> Self {
        Self {
            event: event.into(),
            payload: None,
            patches,
        }
    }
}

pub mod targets {
    pub const PANEL_DICE: &str = "panel.dice";
    pub const PANEL_PREVIEW: &str = "panel.preview";
}

pub mod triggers {
    pub const MESSY_CRITICAL: &str = "roll.messy-critical";
    pub const BESTIAL_FAILURE: &str = "roll.bestial-failure";
}

/// Request body for a dice-pool roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollRequest {
    pub pool_size: u32,
    #[serde(default)]
    pub hunger_count: u32,
}

/// Outcome of one dice-pool roll. Created fresh per roll and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollResult {
    pub normal_dice: Vec<u8>,
    pub hunger_dice: Vec<u8>,
    /// Dice (both groups) showing 6 or more.
    pub successes: u32,
    /// Every two 10s anywhere in the pool form one pair.
    pub critical_pairs: u32,
    /// Two or more 10s on hunger dice.
    pub messy_critical: bool,
    /// No successes and at least one hunger die showing 1.
    pub bestial_failure: bool,
}

impl RollResult {
    pub fn pool_size(&self) -> usize {
        self.normal_dice.len() + self.hunger_dice.len()
    }
}

/// A lore keyword supplied by the glossary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl GlossaryTerm {
    pub fn new(term: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            definition: definition.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Which call site the annotation is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Variant {
    /// Read-only chronicle page: deferred tooltips plus reading time.
    Chronicle,
    /// Live editor preview: inline hidden tooltips, content only.
    EditorPreview,
}

impl Default for Variant {
    fn default() -> Self {
        Self::Chronicle
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotateRequest {
    #[serde(default)]
    pub text: Option<String>,
    /// Left untyped on purpose: anything that is not an array disables glossary matching.
    #[serde(default)]
    pub glossary: serde_json::Value,
    #[serde(default)]
    pub variant: Variant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadingTime {
    pub words: u32,
    pub minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationResult {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading_time: Option<ReadingTime>,
    /// Reserved; nothing produces footnotes yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footnotes: Option<Vec<String>>,
}

impl AnnotationResult {
    pub fn empty(variant: Variant) -> Self {
        match variant {
            Variant::Chronicle => Self {
                content: String::new(),
                reading_time: Some(ReadingTime::default()),
                footnotes: Some(Vec::new()),
            },
            Variant::EditorPreview => Self {
                content: String::new(),
                reading_time: None,
                footnotes: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_request_uses_camel_case() {
        let req: RollRequest =
            serde_json::from_str(r#"{"poolSize":5,"hungerCount":2}"#).expect("parse");
        assert_eq!(req.pool_size, 5);
        assert_eq!(req.hunger_count, 2);

        let req: RollRequest = serde_json::from_str(r#"{"poolSize":3}"#).expect("parse");
        assert_eq!(req.hunger_count, 0);
    }

    #[test]
    fn preview_result_omits_chronicle_fields() {
        let v = serde_json::to_value(AnnotationResult::empty(Variant::EditorPreview)).unwrap();
        assert_eq!(v, serde_json::json!({ "content": "" }));

        let v = serde_json::to_value(AnnotationResult::empty(Variant::Chronicle)).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "content": "",
                "readingTime": { "words": 0, "minutes": 0 },
                "footnotes": [],
            })
        );
    }

    #[test]
    fn variant_names() {
        let v: Variant = serde_json::from_str(r#""editorPreview""#).unwrap();
        assert_eq!(v, Variant::EditorPreview);
        let req: AnnotateRequest = serde_json::from_str(r#"{"text":"x"}"#).unwrap();
        assert_eq!(req.variant, Variant::Chronicle);
        assert!(req.glossary.is_null());
    }
}
