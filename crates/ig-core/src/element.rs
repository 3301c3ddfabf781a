use std::fmt;

use serde::{Deserialize, Serialize};

/// Known element categories. Declaration order is the order in which the
/// prompt builder lays out fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementCategory {
    Style,
    Pose,
    Background,
    Hairstyle,
    Expression,
    Outfit,
    /// ControlNet reference images. Contributes no prompt text.
    Reference,
}

impl ElementCategory {
    /// Key used in config files, placeholders and sidecar records
    pub fn id(&self) -> &'static str {
        match self {
            Self::Style => "style",
            Self::Pose => "pose",
            Self::Background => "background",
            Self::Hairstyle => "hairstyle",
            Self::Expression => "expression",
            Self::Outfit => "outfit",
            Self::Reference => "reference",
        }
    }

    /// Placeholder recognised inside genre prompts, e.g. `{pose}`
    pub fn placeholder(&self) -> String {
        format!("{{{}}}", self.id())
    }

    pub fn contributes_text(&self) -> bool {
        !matches!(self, Self::Reference)
    }

    pub fn all() -> [ElementCategory; 7] {
        [
            Self::Style,
            Self::Pose,
            Self::Background,
            Self::Hairstyle,
            Self::Expression,
            Self::Outfit,
            Self::Reference,
        ]
    }
}

impl fmt::Display for ElementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

pub type ElementId = String;

/// LoRA weight set attached to a style element. Strength is drawn per pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSpec {
    pub id: String,
    #[serde(default = "default_strength_min")]
    pub strength_min: f64,
    #[serde(default = "default_strength_max")]
    pub strength_max: f64,
}

fn default_strength_min() -> f64 {
    0.5
}

fn default_strength_max() -> f64 {
    1.0
}

/// One interchangeable content fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraSpec>,
}

impl Element {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            lora: None,
        }
    }

    pub fn with_lora(mut self, lora: LoraSpec) -> Self {
        self.lora = Some(lora);
        self
    }
}

/// How a category may repeat within one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RepeatPolicy {
    /// Each element at most once per batch; running out is `PoolExhausted`.
    NoRepeatPerBatch,
    /// Plain weighted draw, repeats allowed.
    RepeatAllowedWeighted,
    /// Weighted draw that avoids the last `window` picks and favours
    /// elements that have been used less.
    RecentWindow { window: usize },
}

/// What the orchestrator does when a no-repeat pool runs dry mid-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    Reset,
    Skip,
}

/// The element that ended up in a request, as recorded in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSelection {
    pub category: ElementCategory,
    pub id: ElementId,
    pub text: String,
}

impl ElementSelection {
    pub fn from_element(category: ElementCategory, element: &Element) -> Self {
        Self {
            category,
            id: element.id.clone(),
            text: element.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_ids() {
        assert_eq!(ElementCategory::Pose.id(), "pose");
        assert_eq!(ElementCategory::Background.placeholder(), "{background}");
    }

    #[test]
    fn test_prompt_order() {
        let mut cats = vec![
            ElementCategory::Background,
            ElementCategory::Pose,
            ElementCategory::Style,
        ];
        cats.sort();
        assert_eq!(
            cats,
            vec![
                ElementCategory::Style,
                ElementCategory::Pose,
                ElementCategory::Background
            ]
        );
    }

    #[test]
    fn test_repeat_policy_yaml() {
        let p: RepeatPolicy = serde_yaml::from_str("kind: recent_window\nwindow: 3").unwrap();
        assert_eq!(p, RepeatPolicy::RecentWindow { window: 3 });
        let p: RepeatPolicy = serde_yaml::from_str("kind: no_repeat_per_batch").unwrap();
        assert_eq!(p, RepeatPolicy::NoRepeatPerBatch);
    }
}
