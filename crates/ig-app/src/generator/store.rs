//! Local persistence of generated images and their sidecar records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use ig_core::batch::{BatchRun, BatchSummary, PersistedImage};
use ig_core::config::OutputConfig;
use ig_core::element::{ElementCategory, ElementId, ElementSelection};
use ig_core::error::{GenError, Result};
use ig_core::request::{GenerationRequest, LoraWeight, PoseMode, RunId, SamplerSettings};

use crate::generator::postprocess::ProcessedImage;

pub const IMAGE_STATE_UNPROCESSED: &str = "unprocessed";
pub const POSTING_STAGE_NOT_POSTED: &str = "notposted";
/// Only generation path there is. The registration step requires the field.
pub const GENERATION_MODE: &str = "sdxl_unified";

/// Parameters the image was requested with, nested under
/// `sdxl_unified_generation` in the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub model: String,
}

impl GenerationParams {
    fn from_request(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            steps: request.sampler.steps,
            cfg_scale: request.sampler.cfg_scale,
            width: request.sampler.width,
            height: request.sampler.height,
            sampler_name: request.sampler.sampler_name.clone(),
            model: request.checkpoint.clone(),
        }
    }
}

/// Sidecar record written next to every image. The camelCase fields are
/// the ones the registration step keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub image_id: String,
    pub run_id: RunId,
    pub sequence: u64,
    pub genre: String,
    pub generation_mode: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub selections: Vec<ElementSelection>,
    pub loras: Vec<LoraWeight>,
    pub seed: Option<i64>,
    pub model_version: Option<String>,
    pub checkpoint: String,
    pub sampler: SamplerSettings,
    pub pose_mode: PoseMode,
    pub input_image: Option<String>,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub sdxl_unified_generation: GenerationParams,
    #[serde(rename = "s3Key")]
    pub s3_key: String,
    #[serde(rename = "imageState")]
    pub image_state: String,
    #[serde(rename = "postingStage")]
    pub posting_stage: String,
}

/// What the backend reported for a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationFacts {
    pub seed: Option<i64>,
    pub model_version: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryRecord<'a> {
    #[serde(flatten)]
    summary: BatchSummary,
    pool_usage: &'a BTreeMap<ElementCategory, BTreeMap<ElementId, u64>>,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    per_genre_dirs: bool,
}

impl LocalStore {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            root: config.directory.clone(),
            per_genre_dirs: config.per_genre_dirs,
        }
    }

    pub fn dir_for(&self, genre: &str) -> PathBuf {
        if self.per_genre_dirs {
            self.root.join(genre)
        } else {
            self.root.clone()
        }
    }

    /// Write the image and its sidecar. Names derive from run id and
    /// sequence, so concurrent items never collide.
    pub async fn persist(
        &self,
        request: &GenerationRequest,
        image: &ProcessedImage,
        facts: &InvocationFacts,
    ) -> Result<PersistedImage> {
        let dir = self.dir_for(&request.genre);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence(&dir, e))?;

        let image_id = request.image_id();
        let ext = image.format.extension();
        let image_path = dir.join(format!("{image_id}.{ext}"));
        let metadata_path = dir.join(format!("{image_id}_metadata.json"));

        let metadata = ImageMetadata {
            image_id: image_id.clone(),
            run_id: request.run_id,
            sequence: request.sequence,
            genre: request.genre.clone(),
            generation_mode: GENERATION_MODE.to_string(),
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            selections: request.selections.clone(),
            loras: request.conditioning.loras.clone(),
            seed: facts.seed,
            model_version: facts.model_version.clone(),
            checkpoint: request.checkpoint.clone(),
            sampler: request.sampler.clone(),
            pose_mode: request.pose_mode,
            input_image: request
                .conditioning
                .controlnet
                .as_ref()
                .map(|cn| cn.reference.clone()),
            width: image.width,
            height: image.height,
            created_at: Utc::now(),
            attempts: facts.attempts,
            elapsed_ms: facts.elapsed.as_millis() as u64,
            sdxl_unified_generation: GenerationParams::from_request(request),
            s3_key: format!("image-pool/{}/{image_id}.{ext}", request.genre),
            image_state: IMAGE_STATE_UNPROCESSED.to_string(),
            posting_stage: POSTING_STAGE_NOT_POSTED.to_string(),
        };

        let json = serde_json::to_vec_pretty(&metadata)?;
        write_atomic(&image_path, &image.bytes).await?;
        if let Err(e) = write_atomic(&metadata_path, &json).await {
            // Never leave an image without its sidecar.
            if let Err(cleanup) = tokio::fs::remove_file(&image_path).await {
                warn!("Could not remove {} after sidecar failure: {cleanup}", image_path.display());
            }
            return Err(e);
        }

        info!("Saved {} ({} bytes)", image_path.display(), image.bytes.len());
        Ok(PersistedImage {
            image_id,
            image_path,
            metadata_path,
        })
    }

    /// Write `<run_id>_summary.json` for a finalized run.
    pub async fn write_summary(
        &self,
        run: &BatchRun,
        pool_usage: &BTreeMap<ElementCategory, BTreeMap<ElementId, u64>>,
    ) -> Result<PathBuf> {
        let dir = self.dir_for(&run.genre);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence(&dir, e))?;
        let path = dir.join(format!("{}_summary.json", run.id));
        let record = SummaryRecord {
            summary: run.summary(),
            pool_usage,
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?).await?;
        info!("Wrote run summary {}", path.display());
        Ok(path)
    }
}

pub async fn read_metadata(path: impl AsRef<Path>) -> Result<ImageMetadata> {
    let path = path.as_ref();
    let raw = tokio::fs::read(path).await.map_err(|e| persistence(path, e))?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| persistence(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persistence(path, e));
    }
    debug!("Wrote {}", path.display());
    Ok(())
}

fn persistence(path: &Path, e: std::io::Error) -> GenError {
    GenError::Persistence(format!("{}: {e}", path.display()))
}
