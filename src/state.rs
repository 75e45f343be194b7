//! Shared application state — the process-scoped canvas coordinator.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! cloned into background tasks. It owns everything that used to be global:
//! the session map, the spatial index with each viewer's window and pending
//! update batch, the render job registry and the lock manager, plus the store
//! and delta engine collaborators.
//!
//! `ViewState` groups the spatial index, window map and update queue under
//! one short-lived std mutex. Clearing a viewer's window and discarding its
//! batch happen in one critical section, so nothing can be queued for a
//! viewer after its window is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{RwLock, mpsc};

use crate::config::CanvasConfig;
use crate::frame::Frame;
use crate::geometry::Window;
use crate::model::{UserId, ViewerId};
use crate::services::broadcast::UpdateQueue;
use crate::services::delta::DeltaEngine;
use crate::services::jobs::JobRegistry;
use crate::services::lock::LockManager;
use crate::services::window_tree::WindowTree;
use crate::store::CanvasStore;

// =============================================================================
// SESSIONS
// =============================================================================

/// One connected websocket client.
pub struct Session {
    pub user_id: UserId,
    /// Outbound frames for this client's socket.
    pub tx: mpsc::Sender<Frame>,
}

// =============================================================================
// VIEW STATE
// =============================================================================

#[derive(Debug, Default)]
pub struct ViewState {
    pub tree: WindowTree,
    /// Current window per viewer. A viewer without a window sees nothing.
    pub windows: HashMap<ViewerId, Window>,
    pub updates: UpdateQueue,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub config: CanvasConfig,
    pub store: Arc<dyn CanvasStore>,
    pub deltas: Arc<dyn DeltaEngine>,
    pub locks: LockManager,
    pub sessions: Arc<RwLock<HashMap<ViewerId, Session>>>,
    pub views: Arc<Mutex<ViewState>>,
    pub jobs: Arc<Mutex<JobRegistry>>,
}

impl AppState {
    #[must_use]
    pub fn new(config: CanvasConfig, store: Arc<dyn CanvasStore>, deltas: Arc<dyn DeltaEngine>) -> Self {
        Self {
            config,
            store,
            deltas,
            locks: LockManager::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            views: Arc::new(Mutex::new(ViewState::default())),
            jobs: Arc::new(Mutex::new(JobRegistry::new())),
        }
    }

    /// Never hold the returned guard across an await.
    pub fn lock_views(&self) -> MutexGuard<'_, ViewState> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never hold the returned guard across an await.
    pub fn lock_jobs(&self) -> MutexGuard<'_, JobRegistry> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub mod test_helpers {
    use std::time::Duration;

    use super::*;
    use crate::services::delta::VectorDeltas;
    use crate::services::viewport::{self, WindowRequest};
    use crate::store::MemoryStore;

    /// Config with short timers so broadcast and retry paths finish quickly.
    #[must_use]
    pub fn test_config() -> CanvasConfig {
        CanvasConfig {
            update_flush_interval: Duration::from_millis(10),
            update_max_age: Duration::from_millis(20),
            render_retry_base: Duration::from_millis(5),
            render_retry_max: Duration::from_millis(20),
            session_queue_capacity: 64,
            ..CanvasConfig::default()
        }
    }

    /// Create a test `AppState` over a fresh in-memory store.
    #[must_use]
    pub fn test_app_state() -> AppState {
        test_app_state_with_store(MemoryStore::new())
    }

    /// Create a test `AppState` over `store`, so tests can inject faults.
    #[must_use]
    pub fn test_app_state_with_store(store: MemoryStore) -> AppState {
        let config = test_config();
        AppState::new(config, Arc::new(store), Arc::new(VectorDeltas::new(config.tile_size)))
    }

    pub fn window_request(x: i64, y: i64, width: i64, height: i64) -> WindowRequest {
        WindowRequest { x: x.into(), y: y.into(), width: width.into(), height: height.into() }
    }

    /// Connect a viewer with a fresh user and return its outbound receiver.
    pub async fn connect_viewer(state: &AppState) -> (ViewerId, UserId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(state.config.session_queue_capacity);
        let (viewer_id, user_id) = viewport::connect(state, None, tx).await.expect("connect should succeed");
        (viewer_id, user_id, rx)
    }

    /// Connect a viewer and give it a window.
    pub async fn connect_viewer_with_window(
        state: &AppState,
        request: WindowRequest,
    ) -> (ViewerId, UserId, mpsc::Receiver<Frame>) {
        let (viewer_id, user_id, rx) = connect_viewer(state).await;
        viewport::set_window(state, viewer_id, request).await.expect("set_window should succeed");
        (viewer_id, user_id, rx)
    }

    /// Wait until no render job is registered, or panic after `limit`.
    pub async fn wait_for_idle_renders(state: &AppState, limit: Duration) {
        tokio::time::timeout(limit, async {
            while !state.lock_jobs().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("render jobs should drain");
    }
}
