use thiserror::Error;

use crate::element::ElementCategory;

pub type Result<T> = std::result::Result<T, GenError>;

#[derive(Error, Debug)]
pub enum GenError {
    /// Bad or inconsistent configuration snapshot. Aborts before any generation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid pool for {category}: {reason}")]
    InvalidPool {
        category: ElementCategory,
        reason: String,
    },

    #[error("Pool exhausted: no unused {0} elements left in this batch")]
    PoolExhausted(ElementCategory),

    #[error("Template resolution failed: {0}")]
    TemplateResolution(String),

    /// Backend gave up after retries, or failed with a non-transient error.
    #[error("Generation failed after {attempts} attempt(s): {diagnostic}")]
    GenerationFailed { attempts: u32, diagnostic: String },

    #[error("Post-processing failed: {0}")]
    PostProcess(String),

    #[error("Reference image unusable: {0}")]
    ReferenceImage(String),

    #[error("Persisting result failed: {0}")]
    Persistence(String),

    #[error("Checkpoint switch to '{checkpoint}' failed: {reason}")]
    ModelSwitch { checkpoint: String, reason: String },

    #[error("OS entropy source unavailable: {0}")]
    InsufficientEntropy(String),

    #[error("Cannot choose from an empty sequence")]
    EmptyChoice,

    #[error("Invalid selection weights: {0}")]
    InvalidWeights(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenError {
    /// Errors that are allowed to terminate the process. Everything else is
    /// recorded against the batch item it happened in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ModelSwitch { .. } | Self::InsufficientEntropy(_)
        )
    }

    /// Short machine-readable tag, stored in result records and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidPool { .. } => "invalid_pool",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::TemplateResolution(_) => "template_resolution",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::PostProcess(_) => "post_process",
            Self::ReferenceImage(_) => "reference_image",
            Self::Persistence(_) => "persistence",
            Self::ModelSwitch { .. } => "model_switch",
            Self::InsufficientEntropy(_) => "insufficient_entropy",
            Self::EmptyChoice => "empty_choice",
            Self::InvalidWeights(_) => "invalid_weights",
            Self::Io(_) => "io",
            Self::Yaml(_) => "yaml",
            Self::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(GenError::Configuration("x".into()).is_fatal());
        assert!(GenError::InsufficientEntropy("x".into()).is_fatal());
        assert!(!GenError::PoolExhausted(ElementCategory::Pose).is_fatal());
        assert!(
            !GenError::GenerationFailed {
                attempts: 3,
                diagnostic: "boom".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_display_mentions_category() {
        let err = GenError::PoolExhausted(ElementCategory::Background);
        assert!(err.to_string().contains("background"));
        assert_eq!(err.kind(), "pool_exhausted");
    }
}
