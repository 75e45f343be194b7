//! Update broadcaster — per-viewer coalescing of canvas updates.
//!
//! DESIGN
//! ======
//! Updates are never sent inline. Each viewer has at most one pending batch,
//! stamped with the time its first update arrived. A background task ticks
//! every `update_flush_interval` and flushes every batch strictly older than
//! `update_max_age` as a single `canvas:update` frame; younger batches keep
//! accumulating. Delivery latency is therefore bounded by max age plus one
//! tick, and a burst inside one window collapses into one frame.
//!
//! Routing: a rendered-tile update goes to the viewers of that tile, an action
//! update to every viewer whose window intersects the action's region.
//! Delivery uses `try_send`. A full session channel puts the batch back at
//! the front of the viewer's queue with its original age, so the next tick
//! retries it ahead of anything newer. A closed or missing session is logged
//! and the batch is dropped for that viewer only.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::frame::{Data, Frame};
use crate::model::{Update, ViewerId};
use crate::state::{AppState, ViewState};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("viewer {0} is not connected")]
    Disconnected(ViewerId),
    #[error("outbound queue full for viewer {0}")]
    QueueFull(ViewerId),
    #[error("failed to encode update batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl crate::frame::ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Disconnected(_) => "E_DISCONNECTED",
            Self::QueueFull(_) => "E_QUEUE_FULL",
            Self::Encode(_) => "E_ENCODE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::QueueFull(_))
    }
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Debug)]
struct PendingBatch {
    created_at: Instant,
    updates: Vec<Update>,
}

/// Pending update batches keyed by viewer.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: HashMap<ViewerId, PendingBatch>,
}

impl UpdateQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, viewer_id: ViewerId, update: Update) {
        self.enqueue_at(viewer_id, update, Instant::now());
    }

    /// Append to the viewer's batch, opening it at `now` if none is pending.
    pub fn enqueue_at(&mut self, viewer_id: ViewerId, update: Update, now: Instant) {
        self.pending
            .entry(viewer_id)
            .or_insert_with(|| PendingBatch { created_at: now, updates: Vec::new() })
            .updates
            .push(update);
    }

    /// Remove and return every batch strictly older than `max_age` at `now`.
    pub fn take_due_at(&mut self, max_age: Duration, now: Instant) -> Vec<(ViewerId, Vec<Update>)> {
        self.take_due_batches(max_age, now)
            .into_iter()
            .map(|(viewer_id, batch)| (viewer_id, batch.updates))
            .collect()
    }

    fn take_due_batches(&mut self, max_age: Duration, now: Instant) -> Vec<(ViewerId, PendingBatch)> {
        self.pending
            .extract_if(|_, batch| now.saturating_duration_since(batch.created_at) > max_age)
            .collect()
    }

    /// Put undelivered `updates` back ahead of anything queued since, keeping
    /// the age they had when first queued.
    pub fn restore(&mut self, viewer_id: ViewerId, mut updates: Vec<Update>, created_at: Instant) {
        match self.pending.get_mut(&viewer_id) {
            Some(batch) => {
                updates.append(&mut batch.updates);
                batch.updates = updates;
                batch.created_at = batch.created_at.min(created_at);
            }
            None => {
                self.pending.insert(viewer_id, PendingBatch { created_at, updates });
            }
        }
    }

    /// Drop a viewer's pending batch without delivering it.
    pub fn discard(&mut self, viewer_id: ViewerId) {
        self.pending.remove(&viewer_id);
    }

    /// Number of updates waiting for `viewer_id`.
    #[must_use]
    pub fn pending_for(&self, viewer_id: ViewerId) -> usize {
        self.pending.get(&viewer_id).map_or(0, |batch| batch.updates.len())
    }

    /// Number of viewers with a pending batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// =============================================================================
// ROUTING
// =============================================================================

/// Queue `update` for every viewer it concerns.
pub fn enqueue_update(state: &AppState, update: Update) {
    let mut views = state.lock_views();
    let ViewState { tree, updates, .. } = &mut *views;
    let viewers = match &update {
        Update::Rendered { location, .. } => tree.viewers_at(location),
        Update::Action { region, .. } => tree.viewers_in_region(region),
    };
    for viewer_id in viewers {
        updates.enqueue(viewer_id, update.clone());
    }
}

/// Queue `batch` for one viewer, provided it still has a window.
pub fn enqueue_for_viewer(state: &AppState, viewer_id: ViewerId, batch: Vec<Update>) {
    let mut views = state.lock_views();
    if !views.windows.contains_key(&viewer_id) {
        return;
    }
    for update in batch {
        views.updates.enqueue(viewer_id, update);
    }
}

// =============================================================================
// FLUSH
// =============================================================================

/// Spawn the background flush task. Returns a handle for shutdown.
pub fn spawn_flush_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.update_flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            flush_due(&state).await;
        }
    })
}

/// Deliver every due batch. Returns the number of batches handed to sessions.
pub async fn flush_due(state: &AppState) -> usize {
    let due = state.lock_views().updates.take_due_batches(state.config.update_max_age, Instant::now());
    if due.is_empty() {
        return 0;
    }

    let mut delivered = 0;
    for (viewer_id, batch) in due {
        let count = batch.updates.len();
        match deliver(state, viewer_id, &batch.updates).await {
            Ok(()) => {
                delivered += 1;
                debug!(%viewer_id, count, "update batch delivered");
            }
            Err(TransportError::QueueFull(_)) => {
                let mut views = state.lock_views();
                // A viewer that lost its window meanwhile must not be re-queued.
                if views.windows.contains_key(&viewer_id) {
                    views.updates.restore(viewer_id, batch.updates, batch.created_at);
                    debug!(%viewer_id, count, "session queue full; batch kept for next tick");
                }
            }
            Err(e) => warn!(%viewer_id, count, error = %e, "update batch not delivered"),
        }
    }
    delivered
}

async fn deliver(state: &AppState, viewer_id: ViewerId, updates: &[Update]) -> Result<(), TransportError> {
    let mut data = Data::new();
    data.insert("updates".into(), serde_json::to_value(updates)?);
    let frame = Frame::request("canvas:update", data);

    let sessions = state.sessions.read().await;
    let session = sessions.get(&viewer_id).ok_or(TransportError::Disconnected(viewer_id))?;
    session.tx.try_send(frame).map_err(|e| match e {
        TrySendError::Full(_) => TransportError::QueueFull(viewer_id),
        TrySendError::Closed(_) => TransportError::Disconnected(viewer_id),
    })
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
