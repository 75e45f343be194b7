//! Render job loop — drains each tile's pending revisions into images.
//!
//! DESIGN
//! ======
//! `schedule` starts at most one loop per tile, using the job registry as the
//! only mutual exclusion. Each iteration takes the tile lock afresh, renders
//! the head of the pending tail onto the rendered base, stores the image and
//! queues a rendered-tile update. Other requests may interleave between
//! iterations.
//!
//! A loop ends only when it observes an empty tail, and it deregisters while
//! still holding the tile lock. History writers hold the same lock until they
//! have scheduled their tiles, so a revision can never be queued behind a loop
//! that has already decided to stop.
//!
//! FAILURES
//! ========
//! A failed iteration is logged and retried forever; the tile stays
//! registered. Consecutive failures back off exponentially from
//! `render_retry_base` up to `render_retry_max`, and the backoff resets after
//! the next successful iteration.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::CanvasConfig;
use crate::frame::ErrorCode;
use crate::geometry::{Region, TileLocation};
use crate::model::{RevisionId, Update};
use crate::services::broadcast;
use crate::services::delta::DeltaError;
use crate::services::lock::LockSet;
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
}

impl ErrorCode for RenderError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Delta(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Rendered(RevisionId),
    /// Nothing left to render; the tile was deregistered.
    Drained,
}

/// Start a render loop for `location` unless one already owns it.
/// Returns whether a new loop was started.
pub fn schedule(state: &AppState, location: &TileLocation) -> bool {
    if !state.lock_jobs().try_start(location) {
        return false;
    }
    let state = state.clone();
    let location = location.clone();
    tokio::spawn(async move { run_job(state, location).await });
    true
}

pub fn schedule_region(state: &AppState, region: &Region) {
    for location in region {
        schedule(state, location);
    }
}

async fn run_job(state: AppState, location: TileLocation) {
    debug!(%location, "render job started");
    let mut failures: u32 = 0;
    loop {
        match render_step(&state, &location).await {
            Ok(Step::Rendered(revision_id)) => {
                failures = 0;
                trace!(%location, %revision_id, "revision rendered");
            }
            Ok(Step::Drained) => break,
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = retry_delay(&state.config, failures);
                warn!(%location, error = %e, attempt = failures, ?delay, "render step failed; retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
    debug!(%location, "render job stopped");
}

/// Delay before retrying after `failures` consecutive failures (at least 1).
#[must_use]
pub fn retry_delay(config: &CanvasConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    config.render_retry_base.saturating_mul(1 << exponent).min(config.render_retry_max)
}

/// Render the oldest pending revision of `location`, or deregister the tile
/// if there is none.
///
/// # Errors
///
/// Returns `RenderError` if a store read or write fails or the delta engine
/// rejects the action. The tile stays registered.
pub async fn render_step(state: &AppState, location: &TileLocation) -> Result<Step, RenderError> {
    let mut locks = LockSet::new(&state.locks);
    locks.tile(location).await;

    let history = state.store.tile_history(location).await?;
    let Some(head) = history.tail.first().copied() else {
        state.lock_jobs().stop(location);
        return Ok(Step::Drained);
    };

    let base = match history.base_revision_id {
        Some(revision_id) => state.store.revision_image(location, revision_id).await?,
        None => None,
    };
    let record = state.store.get_action(head.action_id).await?;
    let delta = state.deltas.tile_delta(record.id, &record.action, location)?;
    let image = state.deltas.apply(base.as_ref(), &delta)?;
    state.store.set_revision_image(location, head.revision_id, image).await?;

    broadcast::enqueue_update(state, Update::Rendered { location: location.clone(), revision_id: head.revision_id });
    Ok(Step::Rendered(head.revision_id))
}

#[cfg(test)]
#[path = "render_test.rs"]
mod tests;
