use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use ulid::Ulid;

use crate::model::{BatchOutcome, BatchState, Showtime};

const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notification for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchEvent {
    Processing { batch_id: Ulid },
    Complete { batch_id: Ulid, showtimes: Vec<Showtime> },
    Fail { batch_id: Ulid, conflicts: Vec<Showtime> },
    Error { batch_id: Ulid, message: String },
}

impl BatchEvent {
    pub fn from_outcome(batch_id: Ulid, outcome: BatchOutcome) -> Self {
        match outcome {
            BatchOutcome::Complete { showtimes } => BatchEvent::Complete { batch_id, showtimes },
            BatchOutcome::Fail { conflicts } => BatchEvent::Fail { batch_id, conflicts },
            BatchOutcome::Error { message } => BatchEvent::Error { batch_id, message },
        }
    }

    /// The terminal outcome this event carries, if any.
    pub fn into_outcome(self) -> Option<BatchOutcome> {
        match self {
            BatchEvent::Processing { .. } => None,
            BatchEvent::Complete { showtimes, .. } => Some(BatchOutcome::Complete { showtimes }),
            BatchEvent::Fail { conflicts, .. } => Some(BatchOutcome::Fail { conflicts }),
            BatchEvent::Error { message, .. } => Some(BatchOutcome::Error { message }),
        }
    }

    pub fn batch_id(&self) -> Ulid {
        match self {
            BatchEvent::Processing { batch_id }
            | BatchEvent::Complete { batch_id, .. }
            | BatchEvent::Fail { batch_id, .. }
            | BatchEvent::Error { batch_id, .. } => *batch_id,
        }
    }

    pub fn state(&self) -> BatchState {
        match self {
            BatchEvent::Processing { .. } => BatchState::Processing,
            BatchEvent::Complete { .. } => BatchState::Complete,
            BatchEvent::Fail { .. } => BatchState::Fail,
            BatchEvent::Error { .. } => BatchState::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Broadcast hub for batch lifecycle events: one channel per batch plus a
/// firehose carrying every event.
pub struct EventBus {
    channels: DashMap<Ulid, broadcast::Sender<BatchEvent>>,
    all: broadcast::Sender<BatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY * 4).0,
        }
    }

    /// Subscribe to one batch. Creates the channel if needed.
    pub fn subscribe(&self, batch_id: Ulid) -> broadcast::Receiver<BatchEvent> {
        self.channels
            .entry(batch_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BatchEvent> {
        self.all.subscribe()
    }

    /// Deliver to the batch's subscribers and the firehose. No-op if nobody
    /// is listening.
    pub fn publish(&self, event: &BatchEvent) {
        let batch_id = event.batch_id();
        debug!("publish {} for batch {batch_id}", event.state().as_str());
        if let Some(sender) = self.channels.get(&batch_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop a batch channel once it has no receivers left.
    pub fn release(&self, batch_id: &Ulid) {
        self.channels
            .remove_if(batch_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Per-listener filter that lets each (batch, kind) pair through once, so
/// redelivered events are harmless.
#[derive(Debug, Default)]
pub struct DeliveryFilter {
    seen: HashSet<(Ulid, BatchState)>,
}

impl DeliveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time this (batch, kind) is offered.
    pub fn admit(&mut self, event: &BatchEvent) -> bool {
        self.seen.insert((event.batch_id(), event.state()))
    }
}
