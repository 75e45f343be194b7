//! Viewport — session lifecycle and viewer windows.
//!
//! DESIGN
//! ======
//! A session becomes a viewer on connect and sees nothing until it sets a
//! window. Setting a window swaps the viewer's spatial index entry under the
//! canvas lock, schedules a render job for every tile of the new region, then
//! locks the region and queues the current state of those tiles to the viewer
//! (rendered bases first, then every still-pending action once). If that read
//! fails the previous window is put back.
//!
//! Disconnect clears the window, the index entry and any pending batch in one
//! critical section before the session itself is dropped.

use num_bigint::BigInt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::frame::{ErrorCode, Frame};
use crate::geometry::{GeometryError, Window, bigint_string};
use crate::model::{UserId, ViewerId};
use crate::services::lock::LockSet;
use crate::services::{broadcast, render};
use crate::state::{AppState, Session, ViewState};
use crate::store::{StoreError, region_updates};

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("window exceeds {max} pixels per side")]
    TooLarge { max: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for WindowError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Geometry(_) => "E_INVALID_WINDOW",
            Self::TooLarge { .. } => "E_WINDOW_TOO_LARGE",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.retryable())
    }
}

/// `canvas:window` payload. Coordinates are decimal strings or integers.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowRequest {
    #[serde(with = "bigint_string")]
    pub x: BigInt,
    #[serde(with = "bigint_string")]
    pub y: BigInt,
    #[serde(with = "bigint_string")]
    pub width: BigInt,
    #[serde(with = "bigint_string")]
    pub height: BigInt,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Register a new session and return its viewer id and resolved user.
///
/// # Errors
///
/// Returns a store error if the user cannot be looked up or created.
pub async fn connect(
    state: &AppState,
    requested: Option<UserId>,
    tx: mpsc::Sender<Frame>,
) -> Result<(ViewerId, UserId), StoreError> {
    let user_id = resolve_user(state, requested).await?;
    let viewer_id = ViewerId::new_v4();
    state.sessions.write().await.insert(viewer_id, Session { user_id, tx });
    info!(%viewer_id, %user_id, "viewer connected");
    Ok((viewer_id, user_id))
}

/// Return `requested` if that user exists, otherwise create a new user.
///
/// # Errors
///
/// Returns a store error other than "user not found".
pub async fn resolve_user(state: &AppState, requested: Option<UserId>) -> Result<UserId, StoreError> {
    if let Some(user_id) = requested {
        match state.store.get_user(user_id).await {
            Ok(user) => return Ok(user.id),
            Err(StoreError::UserNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    state.store.create_user().await
}

pub async fn disconnect(state: &AppState, viewer_id: ViewerId) {
    {
        let mut views = state.lock_views();
        let ViewState { tree, windows, updates } = &mut *views;
        if let Some(window) = windows.remove(&viewer_id) {
            tree.remove_window(window.region(), viewer_id);
        }
        updates.discard(viewer_id);
    }
    state.sessions.write().await.remove(&viewer_id);
    info!(%viewer_id, "viewer disconnected");
}

// =============================================================================
// WINDOW
// =============================================================================

/// Replace the viewer's window and queue the current state of its tiles.
///
/// # Errors
///
/// Returns `WindowError` for an empty or oversized window, or if the tile
/// state cannot be read.
pub async fn set_window(state: &AppState, viewer_id: ViewerId, request: WindowRequest) -> Result<(), WindowError> {
    let max = BigInt::from(state.config.max_window_size);
    if request.width > max || request.height > max {
        return Err(WindowError::TooLarge { max: state.config.max_window_size });
    }
    let window = Window::new(request.x, request.y, request.width, request.height, state.config.tile_size)?;
    let region = window.region().clone();

    let mut locks = LockSet::new(&state.locks);
    locks.canvas().await;
    let previous = {
        let mut views = state.lock_views();
        let ViewState { tree, windows, .. } = &mut *views;
        let previous = windows.insert(viewer_id, window);
        if let Some(old) = &previous {
            tree.remove_window(old.region(), viewer_id);
        }
        tree.add_window(&region, viewer_id);
        previous
    };

    render::schedule_region(state, &region);
    locks.region(&region).await;
    let updates = match region_updates(state.store.as_ref(), &region).await {
        Ok(updates) => updates,
        Err(e) => {
            restore_window(state, viewer_id, previous);
            return Err(e.into());
        }
    };
    broadcast::enqueue_for_viewer(state, viewer_id, updates);
    Ok(())
}

/// Put back the window that a failed `set_window` replaced. A viewer that
/// disconnected meanwhile stays without one.
fn restore_window(state: &AppState, viewer_id: ViewerId, previous: Option<Window>) {
    let mut views = state.lock_views();
    let ViewState { tree, windows, .. } = &mut *views;
    let Some(current) = windows.remove(&viewer_id) else {
        return;
    };
    tree.remove_window(current.region(), viewer_id);
    if let Some(old) = previous {
        tree.add_window(old.region(), viewer_id);
        windows.insert(viewer_id, old);
    }
}

#[cfg(test)]
#[path = "viewport_test.rs"]
mod tests;
