use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GenError;
use crate::request::{GenerationRequest, RunId};

/// Lifecycle of one batch item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Pending,
    Prompting,
    Invoking,
    Processing,
    Persisted,
    Failed,
    Skipped,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted | Self::Failed | Self::Skipped)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Prompting | Self::Invoking | Self::Processing)
    }

    /// Items only move forward. Any non-terminal state may fail; only
    /// prompting may end in a skip.
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            (Pending, Prompting) => true,
            (Prompting, Invoking) | (Prompting, Skipped) => true,
            (Invoking, Processing) => true,
            (Processing, Persisted) => true,
            (s, Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

/// Error recorded against an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: String,
    pub message: String,
}

impl From<&GenError> for ItemError {
    fn from(err: &GenError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Files written for a successful item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedImage {
    pub image_id: String,
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub run_id: RunId,
    pub sequence: u64,
    pub genre: String,
    /// `None` when the item ended before a request could be built.
    pub request: Option<GenerationRequest>,
    pub state: ItemState,
    pub output: Option<PersistedImage>,
    pub error: Option<ItemError>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    pub elapsed: Duration,
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        self.state == ItemState::Persisted
    }
}

/// One invocation of the orchestrator. Results are kept in sequence order.
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub id: RunId,
    pub genre: String,
    pub requested: u64,
    pub results: Vec<GenerationResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Set when cancellation stopped dispatch before every item ran.
    pub aborted: bool,
    closed: bool,
}

impl BatchRun {
    pub fn new(id: RunId, genre: impl Into<String>, requested: u64) -> Self {
        Self {
            id,
            genre: genre.into(),
            requested,
            results: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            aborted: false,
            closed: false,
        }
    }

    /// Add a terminal result. Ignored once the run is closed.
    pub fn record(&mut self, result: GenerationResult) {
        if self.closed {
            return;
        }
        match result.state {
            ItemState::Persisted => self.succeeded += 1,
            ItemState::Skipped => self.skipped += 1,
            _ => self.failed += 1,
        }
        let pos = self
            .results
            .partition_point(|r| r.sequence < result.sequence);
        self.results.insert(pos, result);
    }

    pub fn finalize(&mut self, aborted: bool) {
        self.aborted = aborted;
        self.finished_at = Some(Utc::now());
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            run_id: self.id,
            genre: self.genre.clone(),
            requested: self.requested,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            aborted: self.aborted,
            started_at: self.started_at,
            finished_at: self.finished_at,
            items: self
                .results
                .iter()
                .map(|r| ItemSummary {
                    sequence: r.sequence,
                    state: r.state,
                    image_id: r.output.as_ref().map(|o| o.image_id.clone()),
                    attempts: r.attempts,
                    error: r.error.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSummary {
    pub sequence: u64,
    pub state: ItemState,
    pub image_id: Option<String>,
    pub attempts: u32,
    pub error: Option<ItemError>,
}

/// Persisted at the end of a run next to the images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub run_id: RunId,
    pub genre: String,
    pub requested: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub aborted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items: Vec<ItemSummary>,
}
