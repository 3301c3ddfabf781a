//! Model invocation: bounded in-flight calls, per-call timeout, retry with
//! backoff, and checkpoint management.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use ig_core::config::{GeneratorConfig, ModelSwitchingConfig};
use ig_core::error::{GenError, Result};
use ig_core::random::RandomSource;
use ig_core::request::GenerationRequest;
use ig_core::retry::{RetryConfig, RetryDecision, RetryState};

use crate::error::BackendError;
use crate::generator::backend::{ModelBackend, RawOutput};

/// Successful invocation and how many attempts it took.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: RawOutput,
    pub attempts: u32,
}

pub struct InvocationEngine {
    backend: Arc<dyn ModelBackend>,
    in_flight: Arc<Semaphore>,
    timeout: Duration,
    retry: RetryConfig,
    switching: ModelSwitchingConfig,
    rng: Arc<dyn RandomSource>,
}

impl InvocationEngine {
    pub fn new(backend: Arc<dyn ModelBackend>, config: &GeneratorConfig, rng: Arc<dyn RandomSource>) -> Self {
        Self {
            backend,
            in_flight: Arc::new(Semaphore::new(config.backend.max_in_flight)),
            timeout: Duration::from_secs(config.backend.timeout_secs),
            retry: config.retry.clone(),
            switching: config.model_switching.clone(),
            rng,
        }
    }

    /// Submit `request`, retrying transient failures. Backoff sleeps do not
    /// hold an in-flight slot.
    #[tracing::instrument(skip(self, request), fields(run_id = %request.run_id.short(), sequence = request.sequence, genre = %request.genre))]
    pub async fn invoke(&self, request: &GenerationRequest) -> Result<Invocation> {
        let mut state = RetryState::new(self.retry.clone());
        loop {
            let attempt = state.begin_attempt();
            let outcome = self.attempt(request).await;

            let err = match outcome {
                Ok(output) => {
                    debug!(attempt, seed = ?output.seed, "Invocation succeeded");
                    return Ok(Invocation {
                        output,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            match state.on_failure(err.is_transient(), self.rng.as_ref())? {
                RetryDecision::RetryAfter(delay) => {
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "Transient backend failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(attempt, error = %err, transient = err.is_transient(), "Giving up on invocation");
                    return Err(GenError::GenerationFailed {
                        attempts: attempt,
                        diagnostic: err.to_string(),
                    });
                }
            }
        }
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<RawOutput, BackendError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        match tokio::time::timeout(self.timeout, self.backend.txt2img(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.timeout.as_secs())),
        }
    }

    /// Make sure `checkpoint` is loaded, switching and verifying if needed.
    /// Failure is fatal for the run.
    pub async fn ensure_model(&self, checkpoint: &str) -> Result<()> {
        if !self.switching.enabled {
            return Ok(());
        }
        let switch_err = |reason: String| GenError::ModelSwitch {
            checkpoint: checkpoint.to_string(),
            reason,
        };

        let current = match self.backend.current_model().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Could not read the loaded checkpoint");
                None
            }
        };
        if current.as_deref().is_some_and(|c| same_checkpoint(c, checkpoint)) {
            debug!(checkpoint, "Checkpoint already loaded");
            return Ok(());
        }

        info!(from = ?current, to = checkpoint, "Switching checkpoint");
        self.backend
            .switch_model(checkpoint)
            .await
            .map_err(|e| switch_err(e.to_string()))?;
        tokio::time::sleep(Duration::from_secs(self.switching.wait_secs)).await;

        for poll in 1..=self.switching.verify_attempts.max(1) {
            match self.backend.current_model().await {
                Ok(Some(now)) if same_checkpoint(&now, checkpoint) => {
                    info!(checkpoint, "Checkpoint switch verified");
                    return Ok(());
                }
                Ok(now) => warn!(poll, loaded = ?now, "Checkpoint not active yet"),
                Err(e) => warn!(poll, error = %e, "Checkpoint verification failed"),
            }
            if poll < self.switching.verify_attempts {
                tokio::time::sleep(Duration::from_secs(self.switching.verify_interval_secs)).await;
            }
        }
        Err(switch_err(format!(
            "not active after {} verification poll(s)",
            self.switching.verify_attempts.max(1)
        )))
    }
}

/// WebUI reports checkpoints as `name.safetensors [hash]`.
fn same_checkpoint(loaded: &str, wanted: &str) -> bool {
    let strip = |s: &str| s.split(" [").next().unwrap_or(s).trim().to_string();
    let (loaded, wanted) = (strip(loaded), strip(wanted));
    loaded == wanted || stem(&loaded) == stem(&wanted)
}

fn stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name)
}
