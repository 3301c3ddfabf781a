//! Generator configuration snapshot.
//!
//! Loaded once per process from YAML, with an optional `.env` and a couple of
//! environment overrides on top. Components get the sections they need
//! through their constructors.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::element::{Element, ElementCategory, ExhaustionPolicy, LoraSpec, RepeatPolicy};
use crate::error::{GenError, Result};
use crate::history::PoolHistory;
use crate::pool::{PoolManager, PoolPolicy};
use crate::prompt::TemplateSet;
use crate::random::validate_weights;
use crate::request::{ADetailerParams, ControlNetUnit, PoseMode, SamplerSettings};
use crate::retry::RetryConfig;

pub const ENV_API_URL: &str = "IMAGEGEN_API_URL";
pub const ENV_OUTPUT_DIR: &str = "IMAGEGEN_OUTPUT_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub api_url: String,
    /// Hard per-call timeout for one generation request.
    pub timeout_secs: u64,
    /// Generation calls allowed in flight at once.
    pub max_in_flight: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:7860".to_string(),
            timeout_secs: 600,
            max_in_flight: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_items: usize,
    pub post_process_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_items: 2,
            post_process_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlNetConfig {
    pub enabled: bool,
    pub units: Vec<ControlNetUnit>,
}

impl Default for ControlNetConfig {
    fn default() -> Self {
        let unit = |module: &str, model: &str, weight: f64| ControlNetUnit {
            enabled: true,
            module: module.to_string(),
            model: model.to_string(),
            weight,
            guidance_start: 0.0,
            guidance_end: 1.0,
            pixel_perfect: true,
            control_mode: "Balanced".to_string(),
            resize_mode: "Crop and Resize".to_string(),
        };
        Self {
            enabled: true,
            units: vec![
                unit("openpose_full", "control_v11p_sd15_openpose", 1.0),
                unit("depth_midas", "control_v11f1p_sd15_depth", 0.6),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceImagesConfig {
    pub directory: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    pub on_exhausted: ExhaustionPolicy,
}

fn default_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "webp"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    /// Not collected by the registration scanner, which only picks up
    /// png, jpg, jpeg and bmp.
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }

    /// Whether the downstream registration step will pick the file up.
    pub fn is_registrable(&self) -> bool {
        !matches!(self, Self::Webp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub position: Corner,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_margin")]
    pub margin: u32,
}

fn default_opacity() -> f32 {
    0.5
}

fn default_margin() -> u32 {
    16
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Resize to the sampler resolution when the backend returns another size.
    pub resize: bool,
    pub enhance: bool,
    pub format: OutputFormat,
    pub jpeg_quality: u8,
    pub watermark: Option<WatermarkConfig>,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            resize: true,
            enhance: false,
            format: OutputFormat::Png,
            jpeg_quality: 95,
            watermark: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub per_genre_dirs: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            per_genre_dirs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSwitchingConfig {
    pub enabled: bool,
    /// Pause after a switch request before the first verification poll.
    pub wait_secs: u64,
    pub verify_attempts: u32,
    pub verify_interval_secs: u64,
}

impl Default for ModelSwitchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_secs: 5,
            verify_attempts: 3,
            verify_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyConfig {
    pub batch_size: u64,
    pub genres: Vec<String>,
    /// Share of the batch per genre. Missing entries split evenly.
    pub distribution: BTreeMap<String, f64>,
}

impl Default for DailyConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            genres: Vec::new(),
            distribution: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementConfig {
    pub id: String,
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub lora: Option<LoraSpec>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_repeat")]
    pub repeat: RepeatPolicy,
    /// No default: every pool states what happens when it runs dry.
    pub on_exhausted: ExhaustionPolicy,
    pub elements: Vec<ElementConfig>,
}

fn default_repeat() -> RepeatPolicy {
    RepeatPolicy::NoRepeatPerBatch
}

impl PoolConfig {
    pub fn policy(&self) -> PoolPolicy {
        PoolPolicy {
            repeat: self.repeat,
            on_exhausted: self.on_exhausted,
        }
    }

    pub fn split(&self) -> (Vec<Element>, Vec<f64>) {
        self.elements
            .iter()
            .map(|e| {
                let element = Element {
                    id: e.id.clone(),
                    text: e.text.clone(),
                    lora: e.lora.clone(),
                };
                (element, e.weight)
            })
            .unzip()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub backend: BackendConfig,
    pub generation: SamplerSettings,
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
    pub controlnet: ControlNetConfig,
    /// `None` disables the ADetailer pass.
    pub adetailer: Option<ADetailerParams>,
    pub pose_mode: PoseMode,
    pub reference_images: Option<ReferenceImagesConfig>,
    pub post_process: PostProcessConfig,
    pub output: OutputConfig,
    pub model_switching: ModelSwitchingConfig,
    pub daily: DailyConfig,
    pub prompts: TemplateSet,
    pub pools: BTreeMap<ElementCategory, PoolConfig>,
    /// Pool counts and recent windows are loaded from and saved to this
    /// file so they survive restarts. `None` keeps them in memory only.
    pub history_file: Option<PathBuf>,
}

impl GeneratorConfig {
    /// Read `path`, apply `.env` and environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        load_env_file(None)?;

        let raw = std::fs::read_to_string(path).map_err(|e| {
            GenError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::parse(&raw)?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;

        info!(
            path = %path.display(),
            genres = config.prompts.genres.len(),
            pools = config.pools.len(),
            "Loaded generator config"
        );
        Ok(config)
    }

    /// Parse and validate without touching the environment.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config = Self::parse(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| GenError::Configuration(e.to_string()))
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.backend.api_url = url;
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            self.output.directory = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(GenError::Configuration(msg));

        if !self.backend.api_url.starts_with("http://") && !self.backend.api_url.starts_with("https://") {
            return bad(format!("backend.api_url '{}' is not an http(s) URL", self.backend.api_url));
        }
        if self.backend.timeout_secs == 0 {
            return bad("backend.timeout_secs must be positive".into());
        }
        if self.backend.max_in_flight == 0
            || self.concurrency.max_concurrent_items == 0
            || self.concurrency.post_process_workers == 0
        {
            return bad("concurrency limits must be at least 1".into());
        }
        let g = &self.generation;
        if g.steps == 0 || g.width == 0 || g.height == 0 {
            return bad("generation steps, width and height must be positive".into());
        }
        if self.retry.backoff_factor == 0 {
            return bad("retry.backoff_factor must be at least 1".into());
        }
        if !(1..=100).contains(&self.post_process.jpeg_quality) {
            return bad("post_process.jpeg_quality must be in 1..=100".into());
        }
        if let Some(wm) = &self.post_process.watermark {
            if !(0.0..=1.0).contains(&wm.opacity) {
                return bad("post_process.watermark.opacity must be in 0..=1".into());
            }
        }

        for (category, pool) in &self.pools {
            if *category == ElementCategory::Reference {
                return bad("reference pool is built from reference_images, not pools".into());
            }
            if pool.elements.is_empty() {
                return bad(format!("pool '{category}' has no elements"));
            }
            let weights: Vec<f64> = pool.elements.iter().map(|e| e.weight).collect();
            validate_weights(&weights).map_err(|e| GenError::Configuration(format!("pool '{category}': {e}")))?;
            for element in &pool.elements {
                if let Some(lora) = &element.lora {
                    check_lora(lora)?;
                }
            }
        }

        if self.prompts.genres.is_empty() {
            return bad("prompts.genres is empty".into());
        }
        for (name, genre) in &self.prompts.genres {
            if genre.checkpoint.trim().is_empty() {
                return bad(format!("genre '{name}' has no checkpoint"));
            }
            for category in &genre.required {
                if !category.contributes_text() {
                    return bad(format!("genre '{name}' cannot require '{category}'"));
                }
                let skipped = *category == ElementCategory::Pose && self.pose_mode == PoseMode::Detection;
                if !skipped && !self.pools.contains_key(category) {
                    return bad(format!("genre '{name}' requires '{category}' but no such pool is configured"));
                }
            }
            if let Some((lo, hi)) = genre.age_range {
                if lo > hi {
                    return bad(format!("genre '{name}' age_range {lo}..{hi} is empty"));
                }
            }
            for lora in &genre.loras {
                check_lora(lora)?;
            }
        }

        for name in self.daily.genres.iter().chain(self.daily.distribution.keys()) {
            if !self.prompts.genres.contains_key(name) {
                return bad(format!("daily plan names unknown genre '{name}'"));
            }
        }
        if let Some(r) = self.daily.distribution.values().find(|r| !r.is_finite() || **r < 0.0) {
            return bad(format!("daily distribution ratio {r} is invalid"));
        }

        Ok(())
    }

    /// Register every configured pool with `pools`.
    pub fn register_pools(&self, pools: &PoolManager) -> Result<()> {
        for (category, pool) in &self.pools {
            let (elements, weights) = pool.split();
            pools.register_pool(*category, elements, weights, pool.policy())?;
        }
        Ok(())
    }

    /// Apply `history_file` to every pool registered so far. Call after
    /// the last pool is registered; registering replaces a pool's state.
    pub fn restore_history(&self, pools: &PoolManager) -> Result<usize> {
        let Some(path) = &self.history_file else {
            return Ok(0);
        };
        let Some(history) = PoolHistory::load(path)? else {
            return Ok(0);
        };
        let restored = pools.restore(&history);
        info!(path = %path.display(), restored, "Loaded pool history");
        Ok(restored)
    }
}

fn check_lora(lora: &LoraSpec) -> Result<()> {
    let ok = lora.strength_min.is_finite()
        && lora.strength_max.is_finite()
        && lora.strength_min <= lora.strength_max;
    if ok {
        Ok(())
    } else {
        Err(GenError::Configuration(format!(
            "lora '{}' strength range {}..{} is invalid",
            lora.id, lora.strength_min, lora.strength_max
        )))
    }
}

/// Apply `path`, or the nearest `.env`, to the process environment. A
/// missing file is fine; one that fails to parse is a configuration error.
pub fn load_env_file(path: Option<&Path>) -> Result<()> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    match loaded {
        Ok(()) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(GenError::Configuration(format!(".env: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::random::SecureRandom;

    const MINIMAL: &str = r#"
prompts:
  quality: "masterpiece"
  negative: "lowres"
  genres:
    normal:
      checkpoint: base_xl.safetensors
      prompt: "1girl, {pose}"
      required: [pose, background]
pools:
  pose:
    on_exhausted: reset
    elements:
      - { id: sit, text: sitting }
      - { id: stand, text: standing, weight: 2.0 }
  background:
    repeat: { kind: recent_window, window: 2 }
    on_exhausted: skip
    elements:
      - { id: beach, text: beach }
"#;

    #[test]
    fn test_minimal_config_with_defaults() {
        let config = GeneratorConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.backend.api_url, "http://127.0.0.1:7860");
        assert_eq!(config.concurrency.max_concurrent_items, 2);
        assert_eq!(config.controlnet.units.len(), 2);
        assert_eq!(config.pose_mode, PoseMode::Specification);
        let pose = &config.pools[&ElementCategory::Pose];
        assert_eq!(pose.repeat, RepeatPolicy::NoRepeatPerBatch);
        assert_eq!(pose.on_exhausted, ExhaustionPolicy::Reset);
        assert_eq!(pose.elements[1].weight, 2.0);
    }

    #[test]
    fn test_exhaustion_policy_is_required() {
        let raw = MINIMAL.replace("    on_exhausted: skip\n", "");
        let err = GeneratorConfig::from_yaml_str(&raw).unwrap_err();
        assert!(matches!(err, GenError::Configuration(_)));
        assert!(err.to_string().contains("on_exhausted"));
    }

    #[test]
    fn test_missing_pool_for_required_category() {
        let raw = MINIMAL.replace("[pose, background]", "[pose, background, outfit]");
        assert!(GeneratorConfig::from_yaml_str(&raw).is_err());
    }

    #[test]
    fn test_detection_mode_does_not_need_pose_pool() {
        let mut config = GeneratorConfig::from_yaml_str(MINIMAL).unwrap();
        config.pools.remove(&ElementCategory::Pose);
        assert!(config.validate().is_err());
        config.pose_mode = PoseMode::Detection;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GeneratorConfig::from_yaml_str(MINIMAL).unwrap();
        config.apply_overrides(|key| match key {
            ENV_API_URL => Some("http://gpu-box:7861".to_string()),
            ENV_OUTPUT_DIR => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.backend.api_url, "http://gpu-box:7861");
        assert_eq!(config.output.directory, PathBuf::from("output"));
    }

    #[test]
    fn test_load_from_file_and_register() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generator.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = GeneratorConfig::load(&path).unwrap();

        let pools = PoolManager::new(Arc::new(SecureRandom::new()));
        config.register_pools(&pools).unwrap();
        assert_eq!(pools.remaining(ElementCategory::Pose), Some(2));
        assert!(!pools.has_pool(ElementCategory::Reference));
    }

    #[test]
    fn test_env_file_missing_is_fine_but_malformed_is_not() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_file(Some(&dir.path().join(".env"))).is_ok());

        let bad = dir.path().join("bad.env");
        std::fs::write(&bad, "IG_CORE_TEST BROKEN LINE\n").unwrap();
        let err = load_env_file(Some(&bad)).unwrap_err();
        assert!(matches!(err, GenError::Configuration(_)));
    }

    #[test]
    fn test_webp_is_not_registrable() {
        assert!(OutputFormat::Png.is_registrable());
        assert!(OutputFormat::Jpeg.is_registrable());
        assert!(!OutputFormat::Webp.is_registrable());
    }

    #[test]
    fn test_load_missing_file() {
        let err = GeneratorConfig::load("/nonexistent/generator.yaml").unwrap_err();
        assert!(err.is_fatal());
    }
}
