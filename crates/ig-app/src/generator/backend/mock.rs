use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;

use ig_core::request::GenerationRequest;

use crate::error::BackendError;
use crate::generator::backend::{ModelBackend, RawOutput};

/// What one scripted `txt2img` call does.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Image,
    /// Wait, then return an image.
    Delayed(Duration),
    Fail(BackendError),
    /// Succeed with bytes that are not an image.
    Corrupt,
}

/// In-process backend for tests. Outcomes are taken from a per-sequence
/// override first, then from the call script, and default to an image.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    script: Mutex<VecDeque<MockOutcome>>,
    by_sequence: Mutex<HashMap<u64, MockOutcome>>,
    latency: Mutex<Duration>,
    model: Mutex<Option<String>>,
    ignore_switch: AtomicBool,
    calls: AtomicUsize,
    switch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next unscripted call.
    pub fn push_outcome(&self, outcome: MockOutcome) -> &Self {
        self.inner.script.lock().push_back(outcome);
        self
    }

    /// Every call for `sequence` gets `outcome`.
    pub fn on_sequence(&self, sequence: u64, outcome: MockOutcome) -> &Self {
        self.inner.by_sequence.lock().insert(sequence, outcome);
        self
    }

    /// Added to every call, so concurrent calls overlap.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = latency;
        self
    }

    pub fn with_model(self, checkpoint: impl Into<String>) -> Self {
        *self.inner.model.lock() = Some(checkpoint.into());
        self
    }

    /// Accept switch requests without ever changing the loaded model.
    pub fn ignoring_switches(self) -> Self {
        self.inner.ignore_switch.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn switch_calls(&self) -> usize {
        self.inner.switch_calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `txt2img` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.inner.requests.lock().clone()
    }

    fn next_outcome(&self, sequence: u64) -> MockOutcome {
        if let Some(outcome) = self.inner.by_sequence.lock().get(&sequence) {
            return outcome.clone();
        }
        self.inner
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockOutcome::Image)
    }
}

/// Solid-colour PNG at the requested resolution.
pub(crate) fn solid_png(width: u32, height: u32) -> Result<Vec<u8>, BackendError> {
    let img = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([180, 120, 90]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| BackendError::Malformed(e.to_string()))?;
    Ok(buf.into_inner())
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn txt2img(&self, request: &GenerationRequest) -> Result<RawOutput, BackendError> {
        let inner = &self.inner;
        inner.calls.fetch_add(1, Ordering::SeqCst);
        inner.requests.lock().push(request.clone());

        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&inner.in_flight);

        let latency = *inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.next_outcome(request.sequence) {
            MockOutcome::Fail(err) => Err(err),
            MockOutcome::Corrupt => Ok(RawOutput {
                bytes: b"definitely not a png".to_vec(),
                seed: Some(request.sequence as i64),
                model_version: inner.model.lock().clone(),
                elapsed: latency,
            }),
            MockOutcome::Delayed(wait) => {
                tokio::time::sleep(wait).await;
                Ok(RawOutput {
                    bytes: solid_png(request.sampler.width, request.sampler.height)?,
                    seed: Some(request.sequence as i64),
                    model_version: inner.model.lock().clone(),
                    elapsed: latency + wait,
                })
            }
            MockOutcome::Image => Ok(RawOutput {
                bytes: solid_png(request.sampler.width, request.sampler.height)?,
                seed: Some(request.sequence as i64),
                model_version: inner.model.lock().clone(),
                elapsed: latency,
            }),
        }
    }

    async fn current_model(&self) -> Result<Option<String>, BackendError> {
        Ok(self.inner.model.lock().clone())
    }

    async fn switch_model(&self, checkpoint: &str) -> Result<(), BackendError> {
        self.inner.switch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.inner.ignore_switch.load(Ordering::SeqCst) {
            *self.inner.model.lock() = Some(checkpoint.to_string());
        }
        Ok(())
    }
}
