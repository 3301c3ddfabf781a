use tokio::sync::mpsc::UnboundedSender;

use ig_core::batch::{ItemError, ItemState};
use ig_core::request::RunId;

pub type EventSender = UnboundedSender<BatchEvent>;

/// Progress notifications emitted while a batch runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    RunStarted {
        run_id: RunId,
        genre: String,
        requested: u64,
    },
    ItemDispatched {
        run_id: RunId,
        sequence: u64,
    },
    ItemTransition {
        run_id: RunId,
        sequence: u64,
        from: ItemState,
        to: ItemState,
    },
    ItemFinished {
        run_id: RunId,
        sequence: u64,
        state: ItemState,
        error: Option<ItemError>,
    },
    RunFinished {
        run_id: RunId,
        succeeded: u64,
        failed: u64,
        skipped: u64,
        aborted: bool,
    },
}

/// Sends to an optional listener. A dropped receiver is not an error.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<EventSender>);

impl EventSink {
    pub fn new(sender: Option<EventSender>) -> Self {
        Self(sender)
    }

    pub fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
