use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::element::ElementSelection;

/// Identifier of one batch run. Used as the file-name prefix of everything
/// the run persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        RunId(uuid)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Where the pose comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseMode {
    /// Pose text comes from the pose pool; no ControlNet.
    #[default]
    Specification,
    /// Pose is taken from a reference image through ControlNet.
    Detection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerSettings {
    pub sampler_name: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            sampler_name: "DPM++ 2M Karras".to_string(),
            steps: 30,
            cfg_scale: 7.0,
            width: 896,
            height: 1152,
        }
    }
}

/// A LoRA applied to this request with its drawn strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraWeight {
    pub id: String,
    pub strength: f64,
}

impl LoraWeight {
    /// Prompt tag understood by the WebUI, e.g. `<lora:film_grain:0.73>`
    pub fn tag(&self) -> String {
        format!("<lora:{}:{:.2}>", self.id, self.strength)
    }
}

/// One ControlNet unit as configured; the reference image is attached per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetUnit {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub module: String,
    pub model: String,
    #[serde(default = "unit_weight")]
    pub weight: f64,
    #[serde(default)]
    pub guidance_start: f64,
    #[serde(default = "unit_weight")]
    pub guidance_end: f64,
    #[serde(default)]
    pub pixel_perfect: bool,
    #[serde(default = "default_control_mode")]
    pub control_mode: String,
    #[serde(default = "default_resize_mode")]
    pub resize_mode: String,
}

fn enabled() -> bool {
    true
}

fn unit_weight() -> f64 {
    1.0
}

fn default_control_mode() -> String {
    "Balanced".to_string()
}

fn default_resize_mode() -> String {
    "Crop and Resize".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlNetConditioning {
    /// Path or id of the reference the image was loaded from.
    pub reference: String,
    /// Base64 PNG, already resized to the generation resolution.
    pub image_b64: String,
    pub units: Vec<ControlNetUnit>,
}

/// Detail-enhancement pass run by the backend after the main generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ADetailerParams {
    pub model: String,
    #[serde(default = "ad_confidence")]
    pub confidence: f64,
    #[serde(default = "ad_mask_blur")]
    pub mask_blur: u32,
    #[serde(default = "ad_denoising")]
    pub denoising_strength: f64,
    #[serde(default = "enabled")]
    pub inpaint_only_masked: bool,
    #[serde(default = "ad_padding")]
    pub inpaint_only_masked_padding: u32,
    #[serde(default = "ad_inpaint_size")]
    pub inpaint_width: u32,
    #[serde(default = "ad_inpaint_size")]
    pub inpaint_height: u32,
    #[serde(default)]
    pub use_steps: bool,
    #[serde(default = "ad_steps")]
    pub steps: u32,
    #[serde(default)]
    pub use_cfg_scale: bool,
    #[serde(default = "ad_cfg")]
    pub cfg_scale: f64,
}

fn ad_confidence() -> f64 {
    0.3
}
fn ad_mask_blur() -> u32 {
    4
}
fn ad_denoising() -> f64 {
    0.4
}
fn ad_padding() -> u32 {
    32
}
fn ad_inpaint_size() -> u32 {
    1024
}
fn ad_steps() -> u32 {
    28
}
fn ad_cfg() -> f64 {
    7.0
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conditioning {
    pub controlnet: Option<ControlNetConditioning>,
    pub adetailer: Option<ADetailerParams>,
    pub loras: Vec<LoraWeight>,
}

/// Everything the backend needs for one image. Built once per batch item and
/// only read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub run_id: RunId,
    pub sequence: u64,
    pub genre: String,
    pub checkpoint: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub adetailer_negative: String,
    pub sampler: SamplerSettings,
    pub conditioning: Conditioning,
    pub selections: Vec<ElementSelection>,
    pub pose_mode: PoseMode,
}

impl GenerationRequest {
    /// Stable id used in file names and downstream records.
    pub fn image_id(&self) -> String {
        format!("{}_{:04}", self.run_id, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_tag_formatting() {
        let lora = LoraWeight {
            id: "film_grain".into(),
            strength: 0.7300000001,
        };
        assert_eq!(lora.tag(), "<lora:film_grain:0.73>");
    }

    #[test]
    fn test_run_id_display_is_filename_safe() {
        let id = RunId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_controlnet_unit_defaults() {
        let unit: ControlNetUnit =
            serde_yaml::from_str("module: openpose_full\nmodel: control_openpose").unwrap();
        assert!(unit.enabled);
        assert_eq!(unit.weight, 1.0);
        assert_eq!(unit.guidance_end, 1.0);
    }
}
