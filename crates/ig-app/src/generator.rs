pub mod backend;
pub mod engine;
pub mod postprocess;
pub mod reference;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ig_core::batch::{BatchRun, GenerationResult, ItemError, ItemState, PersistedImage};
use ig_core::config::GeneratorConfig;
use ig_core::element::{Element, ElementCategory, ElementSelection, ExhaustionPolicy};
use ig_core::error::{GenError, Result};
use ig_core::pool::PoolManager;
use ig_core::prompt::PromptBuilder;
use ig_core::random::RandomSource;
use ig_core::request::{Conditioning, ControlNetConditioning, GenerationRequest, PoseMode, RunId};

use crate::daily::plan_daily;
use crate::events::{BatchEvent, EventSender, EventSink};
use crate::generator::backend::ModelBackend;
use crate::generator::engine::InvocationEngine;
use crate::generator::postprocess::{PostProcessor, prepare_reference};
use crate::generator::store::{InvocationFacts, LocalStore};

/// Drives batch runs: prompt, invoke, post-process, persist, per item.
pub struct Generator {
    pipeline: Pipeline,
}

#[derive(Clone)]
struct Pipeline {
    config: Arc<GeneratorConfig>,
    pools: Arc<PoolManager>,
    builder: Arc<PromptBuilder>,
    engine: Arc<InvocationEngine>,
    processor: Arc<PostProcessor>,
    store: Arc<LocalStore>,
    post_workers: Arc<Semaphore>,
    events: EventSink,
}

impl Generator {
    /// Validate `config`, register its pools and set up every component.
    pub fn new(
        config: GeneratorConfig,
        backend: Arc<dyn ModelBackend>,
        rng: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pools = Arc::new(PoolManager::new(rng.clone()));
        config.register_pools(&pools)?;
        if config.pose_mode == PoseMode::Detection {
            match &config.reference_images {
                Some(refs) => {
                    reference::register_references(refs, &pools)?;
                }
                None => warn!("Pose detection mode without reference_images, ControlNet disabled"),
            }
        }
        config.restore_history(&pools)?;

        let builder = Arc::new(PromptBuilder::new(pools.clone(), rng.clone(), config.pose_mode));
        let engine = Arc::new(InvocationEngine::new(backend, &config, rng));
        let processor = Arc::new(PostProcessor::new(&config.post_process, &config.generation)?);
        let store = Arc::new(LocalStore::new(&config.output));
        let post_workers = Arc::new(Semaphore::new(config.concurrency.post_process_workers));

        Ok(Self {
            pipeline: Pipeline {
                config,
                pools,
                builder,
                engine,
                processor,
                store,
                post_workers,
                events: EventSink::default(),
            },
        })
    }

    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.pipeline.events = EventSink::new(Some(sender));
        self
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.pipeline.config
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pipeline.pools
    }

    /// Run `count` items of `genre`.
    ///
    /// Per-item errors end up in the returned run. Only setup failures and
    /// fatal errors raised inside an item come back as `Err`; after a fatal
    /// error no further items are dispatched. Cancelling `cancel` stops
    /// dispatch, items already dispatched still finish.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run_batch(&self, genre: &str, count: u64, cancel: CancellationToken) -> Result<BatchRun> {
        let p = &self.pipeline;
        let template = p
            .config
            .prompts
            .genre(genre)
            .map_err(|e| GenError::Configuration(e.to_string()))?;
        p.engine.ensure_model(&template.checkpoint).await?;
        p.pools.begin_batch();

        let mut run = BatchRun::new(RunId::new(), genre, count);
        info!(run_id = %run.id.short(), genre, count, "Starting batch");
        p.events.emit(BatchEvent::RunStarted {
            run_id: run.id,
            genre: genre.to_string(),
            requested: count,
        });

        let dispatch = cancel.child_token();
        let item_permits = Arc::new(Semaphore::new(p.config.concurrency.max_concurrent_items));
        let mut tasks = JoinSet::new();
        let mut sequences = HashMap::new();
        let mut fatal = None;
        let mut dispatched = 0u64;

        for sequence in 0..count {
            let permit = tokio::select! {
                biased;
                _ = dispatch.cancelled() => break,
                permit = item_permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Some(joined) = tasks.try_join_next_with_id() {
                reap(joined, &mut run, &mut sequences, &mut fatal, genre);
            }
            if dispatch.is_cancelled() {
                break;
            }

            p.events.emit(BatchEvent::ItemDispatched {
                run_id: run.id,
                sequence,
            });
            let pipeline = p.clone();
            let token = dispatch.clone();
            let run_id = run.id;
            let genre = genre.to_string();
            let handle = tasks.spawn(async move {
                let outcome = pipeline.run_item(run_id, sequence, genre).await;
                if outcome.fatal.is_some() {
                    token.cancel();
                }
                drop(permit);
                outcome
            });
            sequences.insert(handle.id(), sequence);
            dispatched += 1;
        }

        let aborted = dispatched < count;
        if aborted {
            warn!(run_id = %run.id.short(), dispatched, count, "Dispatch stopped early");
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            reap(joined, &mut run, &mut sequences, &mut fatal, genre);
        }
        run.finalize(aborted);

        info!(
            run_id = %run.id.short(),
            genre,
            succeeded = run.succeeded,
            failed = run.failed,
            skipped = run.skipped,
            aborted,
            "Batch finished"
        );
        if let Err(e) = p.store.write_summary(&run, &p.pools.usage_stats()).await {
            warn!(error = %e, "Could not write run summary");
        }
        if let Err(e) = self.save_history().await {
            warn!(error = %e, "Could not save pool history");
        }
        p.events.emit(BatchEvent::RunFinished {
            run_id: run.id,
            succeeded: run.succeeded,
            failed: run.failed,
            skipped: run.skipped,
            aborted,
        });

        match fatal {
            Some(err) => Err(err),
            None => Ok(run),
        }
    }

    async fn save_history(&self) -> Result<()> {
        let Some(path) = self.pipeline.config.history_file.clone() else {
            return Ok(());
        };
        let history = self.pipeline.pools.history();
        tokio::task::spawn_blocking(move || history.save(&path))
            .await
            .map_err(|e| GenError::Persistence(e.to_string()))?
    }

    /// Run the configured daily plan as consecutive batches.
    pub async fn run_daily(&self, cancel: CancellationToken) -> Result<Vec<BatchRun>> {
        let config = &self.pipeline.config;
        let genres: Vec<String> = if config.daily.genres.is_empty() {
            config.prompts.genres.keys().cloned().collect()
        } else {
            config.daily.genres.clone()
        };
        let plan = plan_daily(config.daily.batch_size, &genres, &config.daily.distribution);
        for (genre, count) in &plan {
            info!(genre, count, "Daily plan");
        }

        let mut runs = Vec::with_capacity(plan.len());
        for (genre, count) in plan {
            if cancel.is_cancelled() {
                warn!(genre, "Daily plan cancelled");
                break;
            }
            runs.push(self.run_batch(&genre, count, cancel.clone()).await?);
        }
        Ok(runs)
    }
}

struct ItemOutcome {
    result: GenerationResult,
    fatal: Option<GenError>,
}

enum Stop {
    Skipped(ElementCategory),
    Failed(GenError),
}

impl From<GenError> for Stop {
    fn from(err: GenError) -> Self {
        Stop::Failed(err)
    }
}

enum Picked<T> {
    Ready(T),
    Exhausted(ElementCategory),
}

/// Walks one item through its states and reports every transition.
struct ItemTracker<'a> {
    events: &'a EventSink,
    run_id: RunId,
    sequence: u64,
    state: ItemState,
}

impl ItemTracker<'_> {
    fn advance(&mut self, to: ItemState) {
        if !self.state.can_transition_to(to) {
            error!(sequence = self.sequence, from = ?self.state, to = ?to, "Illegal item transition");
            return;
        }
        self.events.emit(BatchEvent::ItemTransition {
            run_id: self.run_id,
            sequence: self.sequence,
            from: self.state,
            to,
        });
        self.state = to;
    }
}

impl Pipeline {
    async fn run_item(self, run_id: RunId, sequence: u64, genre: String) -> ItemOutcome {
        let started = Instant::now();
        let mut item = ItemTracker {
            events: &self.events,
            run_id,
            sequence,
            state: ItemState::Pending,
        };
        let mut request = None;
        let mut attempts = 0;

        let outcome = self.drive(&mut item, &genre, &mut request, &mut attempts).await;
        let (output, error, fatal) = match outcome {
            Ok(saved) => {
                item.advance(ItemState::Persisted);
                (Some(saved), None, None)
            }
            Err(Stop::Skipped(category)) => {
                warn!(run_id = %run_id.short(), sequence, genre, %category, "Pool exhausted, skipping item");
                item.advance(ItemState::Skipped);
                let err = GenError::PoolExhausted(category);
                (None, Some(ItemError::from(&err)), None)
            }
            Err(Stop::Failed(err)) => {
                error!(run_id = %run_id.short(), sequence, genre, kind = err.kind(), error = %err, "Item failed");
                item.advance(ItemState::Failed);
                let recorded = ItemError::from(&err);
                (None, Some(recorded), err.is_fatal().then_some(err))
            }
        };
        let state = item.state;
        self.events.emit(BatchEvent::ItemFinished {
            run_id,
            sequence,
            state,
            error: error.clone(),
        });

        ItemOutcome {
            result: GenerationResult {
                run_id,
                sequence,
                genre,
                request,
                state,
                output,
                error,
                attempts,
                timestamp: Utc::now(),
                elapsed: started.elapsed(),
            },
            fatal,
        }
    }

    async fn drive(
        &self,
        item: &mut ItemTracker<'_>,
        genre: &str,
        request_slot: &mut Option<GenerationRequest>,
        attempts: &mut u32,
    ) -> std::result::Result<PersistedImage, Stop> {
        item.advance(ItemState::Prompting);
        let built = match self.with_exhaustion(|| self.builder.build(genre, &self.config.prompts))? {
            Picked::Ready(built) => built,
            Picked::Exhausted(category) => return Err(Stop::Skipped(category)),
        };

        let mut selections = built.selections;
        let reference = match self.pick_reference()? {
            Picked::Ready(reference) => reference,
            Picked::Exhausted(category) => {
                for s in &selections {
                    self.pools.release(s.category, &s.id);
                }
                return Err(Stop::Skipped(category));
            }
        };
        let controlnet = match reference {
            Some(element) => {
                selections.push(ElementSelection::from_element(ElementCategory::Reference, &element));
                Some(self.load_reference(&element).await?)
            }
            None => None,
        };

        let request = request_slot.insert(GenerationRequest {
            run_id: item.run_id,
            sequence: item.sequence,
            genre: built.genre,
            checkpoint: built.checkpoint,
            prompt: built.prompt,
            negative_prompt: built.negative_prompt,
            adetailer_negative: built.adetailer_negative,
            sampler: self.config.generation.clone(),
            conditioning: Conditioning {
                controlnet,
                adetailer: self.config.adetailer.clone(),
                loras: built.loras,
            },
            selections,
            pose_mode: self.config.pose_mode,
        });

        item.advance(ItemState::Invoking);
        let invocation = match self.engine.invoke(request).await {
            Ok(invocation) => invocation,
            Err(err) => {
                if let GenError::GenerationFailed { attempts: made, .. } = &err {
                    *attempts = *made;
                }
                return Err(err.into());
            }
        };
        *attempts = invocation.attempts;

        item.advance(ItemState::Processing);
        let _permit = self
            .post_workers
            .acquire()
            .await
            .map_err(|e| GenError::PostProcess(e.to_string()))?;
        let processor = self.processor.clone();
        let raw = invocation.output.bytes;
        let processed = tokio::task::spawn_blocking(move || processor.process(&raw))
            .await
            .map_err(|e| GenError::PostProcess(e.to_string()))??;

        let facts = InvocationFacts {
            seed: invocation.output.seed,
            model_version: invocation.output.model_version,
            attempts: invocation.attempts,
            elapsed: invocation.output.elapsed,
        };
        Ok(self.store.persist(request, &processed, &facts).await?)
    }

    /// Run a pool-consuming step, applying the exhausted pool's policy:
    /// `reset` clears the category and tries once more, `skip` gives up.
    fn with_exhaustion<T>(&self, op: impl Fn() -> Result<T>) -> Result<Picked<T>> {
        let epochs = self.pools.epochs();
        let category = match op() {
            Ok(value) => return Ok(Picked::Ready(value)),
            Err(GenError::PoolExhausted(category)) => category,
            Err(e) => return Err(e),
        };
        let policy = self.pools.policy(category).map(|p| p.on_exhausted);
        if policy != Some(ExhaustionPolicy::Reset) {
            return Ok(Picked::Exhausted(category));
        }

        let seen = epochs.get(&category).copied().unwrap_or_default();
        if self.pools.reset_if_unchanged(category, seen)? {
            info!(%category, "Pool exhausted, reset");
        }
        match op() {
            Ok(value) => Ok(Picked::Ready(value)),
            Err(GenError::PoolExhausted(category)) => Ok(Picked::Exhausted(category)),
            Err(e) => Err(e),
        }
    }

    fn pick_reference(&self) -> Result<Picked<Option<Element>>> {
        let wanted = self.config.pose_mode == PoseMode::Detection
            && self.config.controlnet.enabled
            && self.pools.has_pool(ElementCategory::Reference);
        if !wanted {
            return Ok(Picked::Ready(None));
        }
        let none = HashSet::new();
        Ok(
            match self.with_exhaustion(|| self.pools.select(ElementCategory::Reference, &none))? {
                Picked::Ready(element) => Picked::Ready(Some(element)),
                Picked::Exhausted(category) => Picked::Exhausted(category),
            },
        )
    }

    async fn load_reference(&self, element: &Element) -> Result<ControlNetConditioning> {
        let bytes = reference::read_reference(element).await?;
        let (width, height) = (self.config.generation.width, self.config.generation.height);
        let image_b64 = tokio::task::spawn_blocking(move || prepare_reference(&bytes, width, height))
            .await
            .map_err(|e| GenError::ReferenceImage(e.to_string()))??;
        Ok(ControlNetConditioning {
            reference: element.id.clone(),
            image_b64,
            units: self.config.controlnet.units.clone(),
        })
    }
}

fn reap(
    joined: std::result::Result<(tokio::task::Id, ItemOutcome), tokio::task::JoinError>,
    run: &mut BatchRun,
    sequences: &mut HashMap<tokio::task::Id, u64>,
    fatal: &mut Option<GenError>,
    genre: &str,
) {
    match joined {
        Ok((id, outcome)) => {
            sequences.remove(&id);
            if let Some(err) = outcome.fatal {
                fatal.get_or_insert(err);
            }
            run.record(outcome.result);
        }
        Err(join_err) => {
            let sequence = sequences.remove(&join_err.id()).unwrap_or_default();
            error!(sequence, error = %join_err, "Item task panicked");
            run.record(GenerationResult {
                run_id: run.id,
                sequence,
                genre: genre.to_string(),
                request: None,
                state: ItemState::Failed,
                output: None,
                error: Some(ItemError {
                    kind: "panic".to_string(),
                    message: join_err.to_string(),
                }),
                attempts: 0,
                timestamp: Utc::now(),
                elapsed: Default::default(),
            });
        }
    }
}
