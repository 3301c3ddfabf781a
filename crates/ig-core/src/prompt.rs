//! Prompt assembly from genre templates and pool selections.
//!
//! Composition is deterministic given the selections: fragments are laid out
//! in a fixed order (style, pose, background, the remaining categories, age,
//! quality boosters) so two builds with the same picks produce the same text.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::element::{Element, ElementCategory, ElementId, ElementSelection, LoraSpec};
use crate::error::{GenError, Result};
use crate::pool::PoolManager;
use crate::random::RandomSource;
use crate::request::{LoraWeight, PoseMode};

const AGE_PLACEHOLDER: &str = "{age}";

/// Genre-specific clauses appended to their slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenreModifiers {
    #[serde(default)]
    pub style: Vec<String>,
    #[serde(default)]
    pub pose: Vec<String>,
    #[serde(default)]
    pub background: Vec<String>,
    #[serde(default)]
    pub quality_boosters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreTemplate {
    /// Model checkpoint the genre is generated with
    pub checkpoint: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub required: Vec<ElementCategory>,
    #[serde(default)]
    pub age_range: Option<(u32, u32)>,
    /// LoRAs applied to every image of the genre
    #[serde(default)]
    pub loras: Vec<LoraSpec>,
    /// Element ids never used for this genre
    #[serde(default)]
    pub exclude: HashSet<ElementId>,
    #[serde(default)]
    pub modifiers: GenreModifiers,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSet {
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub face: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub negative: String,
    #[serde(default)]
    pub adetailer_negative: Option<String>,
    #[serde(default)]
    pub genres: BTreeMap<String, GenreTemplate>,
}

impl TemplateSet {
    pub fn genre(&self, name: &str) -> Result<&GenreTemplate> {
        self.genres
            .get(name)
            .ok_or_else(|| GenError::TemplateResolution(format!("unknown genre '{name}'")))
    }
}

/// Output of one `build` call.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPrompt {
    pub genre: String,
    pub checkpoint: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub adetailer_negative: String,
    pub selections: Vec<ElementSelection>,
    pub loras: Vec<LoraWeight>,
}

pub struct PromptBuilder {
    pools: Arc<PoolManager>,
    rng: Arc<dyn RandomSource>,
    pose_mode: PoseMode,
}

impl PromptBuilder {
    pub fn new(pools: Arc<PoolManager>, rng: Arc<dyn RandomSource>, pose_mode: PoseMode) -> Self {
        Self {
            pools,
            rng,
            pose_mode,
        }
    }

    /// Categories a genre actually draws from under the current pose mode,
    /// in prompt order.
    pub fn categories_for(&self, template: &GenreTemplate) -> Vec<ElementCategory> {
        let mut cats = template.required.clone();
        cats.sort();
        cats.dedup();
        if self.pose_mode == PoseMode::Detection {
            cats.retain(|c| *c != ElementCategory::Pose);
        }
        cats
    }

    /// Resolve `genre`, take one selection per required category and compose
    /// the prompt. Selections made before a failure are released again.
    pub fn build(&self, genre: &str, templates: &TemplateSet) -> Result<BuiltPrompt> {
        let template = templates.genre(genre)?;
        let categories = self.categories_for(template);

        for category in &categories {
            if !category.contributes_text() {
                return Err(GenError::TemplateResolution(format!(
                    "genre '{genre}' lists '{category}' which is not a prompt category"
                )));
            }
            if !self.pools.has_pool(*category) {
                return Err(GenError::TemplateResolution(format!(
                    "genre '{genre}' requires a '{category}' pool but none is registered"
                )));
            }
        }

        let mut picked: Vec<(ElementCategory, Element)> = Vec::with_capacity(categories.len());
        for category in categories {
            match self.pools.select(category, &template.exclude) {
                Ok(element) => picked.push((category, element)),
                Err(e) => {
                    self.release(&picked);
                    return Err(e);
                }
            }
        }

        self.compose(genre, template, templates, &picked).inspect_err(|_| {
            self.release(&picked);
        })
    }

    fn release(&self, picked: &[(ElementCategory, Element)]) {
        for (category, element) in picked {
            self.pools.release(*category, &element.id);
        }
    }

    fn compose(
        &self,
        genre: &str,
        template: &GenreTemplate,
        templates: &TemplateSet,
        picked: &[(ElementCategory, Element)],
    ) -> Result<BuiltPrompt> {
        let mut genre_prompt = template.prompt.clone();
        let mut slots: BTreeMap<ElementCategory, Vec<String>> = BTreeMap::new();
        let mut loras = Vec::new();

        for (category, element) in picked {
            let placeholder = category.placeholder();
            if genre_prompt.contains(&placeholder) {
                genre_prompt = genre_prompt.replace(&placeholder, &element.text);
            } else {
                slots.entry(*category).or_default().push(element.text.clone());
            }
            if let Some(spec) = &element.lora {
                loras.push(self.draw_lora(spec)?);
            }
        }
        for spec in &template.loras {
            loras.push(self.draw_lora(spec)?);
        }

        let mut age_clause = None;
        if let Some((lo, hi)) = template.age_range {
            let age = self.rng.randint(lo as i64, hi as i64)?;
            let clause = format!("{age} years old");
            if genre_prompt.contains(AGE_PLACEHOLDER) {
                genre_prompt = genre_prompt.replace(AGE_PLACEHOLDER, &clause);
            } else {
                age_clause = Some(clause);
            }
        }

        // Placeholders whose category was not drawn (e.g. pose in detection mode).
        for category in ElementCategory::all() {
            genre_prompt = genre_prompt.replace(&category.placeholder(), "");
        }
        genre_prompt = genre_prompt.replace(AGE_PLACEHOLDER, "");

        let mods = &template.modifiers;
        let mut parts: Vec<String> = vec![
            templates.quality.clone(),
            templates.face.clone(),
            templates.body.clone(),
            genre_prompt,
        ];

        parts.extend(slots.remove(&ElementCategory::Style).unwrap_or_default());
        parts.extend(loras.iter().map(LoraWeight::tag));
        parts.extend(mods.style.iter().cloned());

        parts.extend(slots.remove(&ElementCategory::Pose).unwrap_or_default());
        if self.pose_mode == PoseMode::Specification {
            parts.extend(mods.pose.iter().cloned());
        }

        parts.extend(slots.remove(&ElementCategory::Background).unwrap_or_default());
        parts.extend(mods.background.iter().cloned());

        // Remaining categories in declaration order.
        for (_, fragments) in slots {
            parts.extend(fragments);
        }
        parts.extend(age_clause);
        parts.extend(mods.quality_boosters.iter().cloned());

        let prompt = join_fragments(parts);
        if prompt.is_empty() {
            warn!(genre, "Composed prompt is empty");
        }

        let negative_prompt = join_fragments([templates.negative.clone(), template.negative_prompt.clone()]);
        let adetailer_negative = templates
            .adetailer_negative
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| negative_prompt.clone());

        debug!(genre, selections = picked.len(), loras = loras.len(), "Built prompt");

        Ok(BuiltPrompt {
            genre: genre.to_string(),
            checkpoint: template.checkpoint.clone(),
            prompt,
            negative_prompt,
            adetailer_negative,
            selections: picked
                .iter()
                .map(|(c, e)| ElementSelection::from_element(*c, e))
                .collect(),
            loras,
        })
    }

    /// Strength on a 0.01 grid inside the configured range.
    fn draw_lora(&self, spec: &LoraSpec) -> Result<LoraWeight> {
        let steps = ((spec.strength_max - spec.strength_min) / 0.01).round() as i64;
        let k = self.rng.randint(0, steps.max(0))?;
        let strength = ((spec.strength_min + k as f64 * 0.01) * 100.0).round() / 100.0;
        Ok(LoraWeight {
            id: spec.id.clone(),
            strength,
        })
    }
}

/// Split on commas, trim, drop empties, rejoin. Keeps output stable no matter
/// how the template fragments were punctuated.
fn join_fragments(parts: impl IntoIterator<Item = String>) -> String {
    parts
        .into_iter()
        .flat_map(|p| {
            p.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .join(", ")
}
