use serde::{Deserialize, Serialize};

use ig_core::request::{ADetailerParams, ControlNetUnit, GenerationRequest};

/// Body of `POST /sdapi/v1/txt2img`.
#[derive(Debug, Clone, Serialize)]
pub struct Txt2ImgPayload {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub sampler_name: String,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub seed: i64,
    pub override_settings: OverrideSettings,
    pub alwayson_scripts: AlwaysOnScripts,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideSettings {
    pub sd_model_checkpoint: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlwaysOnScripts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controlnet: Option<ScriptArgs<ControlNetArg>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adetailer: Option<ScriptArgs<ADetailerArg>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptArgs<T> {
    pub args: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlNetArg {
    pub input_image: String,
    #[serde(flatten)]
    pub unit: ControlNetUnit,
}

#[derive(Debug, Clone, Serialize)]
pub struct ADetailerArg {
    pub ad_model: String,
    pub ad_prompt: String,
    pub ad_negative_prompt: String,
    pub ad_confidence: f64,
    pub ad_mask_blur: u32,
    pub ad_denoising_strength: f64,
    pub ad_inpaint_only_masked: bool,
    pub ad_inpaint_only_masked_padding: u32,
    pub ad_inpaint_width: u32,
    pub ad_inpaint_height: u32,
    pub ad_use_steps: bool,
    pub ad_steps: u32,
    pub ad_use_cfg_scale: bool,
    pub ad_cfg_scale: f64,
}

impl ADetailerArg {
    fn new(params: &ADetailerParams, prompt: &str, negative: &str) -> Self {
        Self {
            ad_model: params.model.clone(),
            ad_prompt: prompt.to_string(),
            ad_negative_prompt: negative.to_string(),
            ad_confidence: params.confidence,
            ad_mask_blur: params.mask_blur,
            ad_denoising_strength: params.denoising_strength,
            ad_inpaint_only_masked: params.inpaint_only_masked,
            ad_inpaint_only_masked_padding: params.inpaint_only_masked_padding,
            ad_inpaint_width: params.inpaint_width,
            ad_inpaint_height: params.inpaint_height,
            ad_use_steps: params.use_steps,
            ad_steps: params.steps,
            ad_use_cfg_scale: params.use_cfg_scale,
            ad_cfg_scale: params.cfg_scale,
        }
    }
}

impl From<&GenerationRequest> for Txt2ImgPayload {
    fn from(req: &GenerationRequest) -> Self {
        let cond = &req.conditioning;
        let controlnet = cond.controlnet.as_ref().map(|cn| ScriptArgs {
            args: cn
                .units
                .iter()
                .filter(|u| u.enabled)
                .map(|unit| ControlNetArg {
                    input_image: cn.image_b64.clone(),
                    unit: unit.clone(),
                })
                .collect(),
        });
        let adetailer = cond.adetailer.as_ref().map(|params| ScriptArgs {
            args: vec![ADetailerArg::new(params, &req.prompt, &req.adetailer_negative)],
        });

        Self {
            prompt: req.prompt.clone(),
            negative_prompt: req.negative_prompt.clone(),
            steps: req.sampler.steps,
            sampler_name: req.sampler.sampler_name.clone(),
            cfg_scale: req.sampler.cfg_scale,
            width: req.sampler.width,
            height: req.sampler.height,
            batch_size: 1,
            // -1 lets the backend pick; the seed it used comes back in `info`.
            seed: -1,
            override_settings: OverrideSettings {
                sd_model_checkpoint: req.checkpoint.clone(),
            },
            alwayson_scripts: AlwaysOnScripts {
                controlnet,
                adetailer,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Txt2ImgResponse {
    #[serde(default)]
    pub images: Vec<String>,
    /// JSON document encoded as a string.
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Fields of the `info` string we keep.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationInfo {
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub sd_model_name: Option<String>,
    #[serde(default)]
    pub sd_model_hash: Option<String>,
}

impl GenerationInfo {
    /// Missing or unparsable info is treated as empty.
    pub fn parse(info: Option<&str>) -> Self {
        info.and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Subset of `GET /sdapi/v1/options`.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionsResponse {
    #[serde(default)]
    pub sd_model_checkpoint: Option<String>,
}
