#[cfg(any(test, feature = "mock"))]
pub(crate) mod mock;
pub mod schemas;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};

use ig_core::config::BackendConfig;
use ig_core::request::GenerationRequest;

use crate::error::BackendError;
use crate::generator::backend::schemas::{GenerationInfo, OptionsResponse, Txt2ImgPayload, Txt2ImgResponse};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockBackend, MockOutcome};

const OPTIONS_TIMEOUT: Duration = Duration::from_secs(30);

/// Undecoded image plus what the backend reported about producing it.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub bytes: Vec<u8>,
    pub seed: Option<i64>,
    pub model_version: Option<String>,
    pub elapsed: Duration,
}

/// A model-serving backend. One `txt2img` call produces one image.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn txt2img(&self, request: &GenerationRequest) -> Result<RawOutput, BackendError>;

    /// Checkpoint currently loaded, if the backend reports one.
    async fn current_model(&self) -> Result<Option<String>, BackendError>;

    /// Ask the backend to load `checkpoint`. Returns once the request was
    /// accepted, which may be before the load finishes.
    async fn switch_model(&self, checkpoint: &str) -> Result<(), BackendError>;
}

/// Stable Diffusion WebUI over its `/sdapi/v1` HTTP API.
#[derive(Clone)]
pub struct SdWebUiBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl SdWebUiBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl ModelBackend for SdWebUiBackend {
    #[tracing::instrument(skip(self, request), fields(run_id = %request.run_id.short(), sequence = request.sequence))]
    async fn txt2img(&self, request: &GenerationRequest) -> Result<RawOutput, BackendError> {
        let payload = Txt2ImgPayload::from(request);
        let started = Instant::now();

        debug!(
            controlnet = payload.alwayson_scripts.controlnet.is_some(),
            adetailer = payload.alwayson_scripts.adetailer.is_some(),
            "Submitting txt2img"
        );

        let response = self
            .client
            .post(self.url("/sdapi/v1/txt2img"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        let response = Self::check(response).await?;

        let body: Txt2ImgResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        if let Some(error) = body.error {
            return Err(BackendError::ModelCrash(error));
        }
        let first = body.images.first().ok_or(BackendError::EmptyResponse)?;
        let bytes = STANDARD
            .decode(first)
            .map_err(|e| BackendError::Malformed(format!("image is not base64: {e}")))?;

        let info = GenerationInfo::parse(body.info.as_deref());
        let elapsed = started.elapsed();
        debug!(seed = ?info.seed, bytes = bytes.len(), elapsed_ms = elapsed.as_millis() as u64, "txt2img returned");

        Ok(RawOutput {
            bytes,
            seed: info.seed,
            model_version: info.sd_model_name.or(info.sd_model_hash),
            elapsed,
        })
    }

    async fn current_model(&self) -> Result<Option<String>, BackendError> {
        let response = self
            .client
            .get(self.url("/sdapi/v1/options"))
            .timeout(OPTIONS_TIMEOUT)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, OPTIONS_TIMEOUT))?;
        let options: OptionsResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(options.sd_model_checkpoint)
    }

    async fn switch_model(&self, checkpoint: &str) -> Result<(), BackendError> {
        info!(checkpoint, "Requesting checkpoint switch");
        let response = self
            .client
            .post(self.url("/sdapi/v1/options"))
            .json(&serde_json::json!({ "sd_model_checkpoint": checkpoint }))
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        Self::check(response).await?;
        Ok(())
    }
}
