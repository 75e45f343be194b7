//! In-memory store — the default engine, and the one tests run against.
//!
//! DESIGN
//! ======
//! All state sits behind one std `Mutex`, never held across an await.
//! Transactions write through immediately and keep an undo log of every
//! record they touch (first-touch snapshot). Rollback, or dropping the
//! transaction without committing, restores those snapshots. Callers hold the
//! matching entity locks for the lifetime of a transaction, so no other writer
//! can touch the snapshotted records in between.
//!
//! Id counters are not rolled back; a rolled-back transaction burns its ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{CanvasStore, ChainEntry, StoreError, StoreTransaction, plan_rebuild, split_chain};
use crate::geometry::{Region, TileLocation};
use crate::model::{
    ActionId, ActionKind, ActionRecord, RevisionId, TileHistory, TileImage, Update, User, UserId,
};

// =============================================================================
// FAULT INJECTION
// =============================================================================

/// Store operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    GetAction,
    TileHistory,
    RevisionImage,
    SetRevisionImage,
    CreateAction,
    AppendAction,
    UpdateHistory,
    Commit,
}

impl FaultPoint {
    fn as_str(self) -> &'static str {
        match self {
            Self::GetAction => "get_action",
            Self::TileHistory => "tile_history",
            Self::RevisionImage => "revision_image",
            Self::SetRevisionImage => "set_revision_image",
            Self::CreateAction => "create_action",
            Self::AppendAction => "append_action",
            Self::UpdateHistory => "update_history_for_region",
            Self::Commit => "commit",
        }
    }
}

type Faults = Arc<Mutex<HashMap<FaultPoint, u32>>>;

fn check(faults: &Faults, point: FaultPoint) -> Result<(), StoreError> {
    let mut faults = faults.lock().unwrap_or_else(PoisonError::into_inner);
    match faults.get_mut(&point) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            Err(StoreError::Injected(point.as_str()))
        }
        _ => Ok(()),
    }
}

// =============================================================================
// DATA
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RevisionRecord {
    id: RevisionId,
    action_id: Option<ActionId>,
}

#[derive(Debug, Clone, Default)]
struct TileRecord {
    /// Every action that touched the tile, in application order.
    actions: Vec<ActionId>,
    /// Live revision chain, blank base first.
    chain: Vec<RevisionRecord>,
    /// Images of rendered chain revisions only.
    images: HashMap<RevisionId, TileImage>,
}

impl TileRecord {
    fn entries(&self) -> Vec<ChainEntry> {
        self.chain
            .iter()
            .map(|r| ChainEntry { revision_id: r.id, action_id: r.action_id, rendered: self.images.contains_key(&r.id) })
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    users: HashMap<UserId, User>,
    actions: HashMap<ActionId, ActionRecord>,
    tiles: HashMap<TileLocation, TileRecord>,
    next_action_id: i64,
    next_revision_id: i64,
}

fn lock(data: &Mutex<MemoryData>) -> MutexGuard<'_, MemoryData> {
    data.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_revision(counter: &mut i64) -> RevisionId {
    *counter += 1;
    RevisionId(*counter)
}

/// Retire every revision of `tile` produced at or after `action_id` and queue
/// one pending revision per not-undone action from that point on. Retired
/// images are dropped. Returns the surviving base when a rendered revision
/// was retired.
fn rebuild_tile(
    tile: &mut TileRecord,
    location: &TileLocation,
    action_id: ActionId,
    actions: &HashMap<ActionId, ActionRecord>,
    revision_counter: &mut i64,
) -> Result<Option<RevisionId>, StoreError> {
    let plan = plan_rebuild(location, &tile.entries(), &tile.actions, action_id)?;
    for retired in tile.chain.drain(plan.keep..) {
        tile.images.remove(&retired.id);
    }

    for id in &tile.actions[plan.start..] {
        let record = actions.get(id).ok_or(StoreError::ActionNotFound(*id))?;
        if !record.undone {
            tile.chain.push(RevisionRecord { id: next_revision(revision_counter), action_id: Some(*id) });
        }
    }
    Ok(plan.moved_back)
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<MemoryData>>,
    faults: Faults,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls through `point` fail with `StoreError::Injected`.
    pub fn fail_next(&self, point: FaultPoint, times: u32) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        *faults.entry(point).or_default() += times;
    }
}

#[async_trait]
impl CanvasStore for MemoryStore {
    async fn create_user(&self) -> Result<UserId, StoreError> {
        let id = UserId::new_v4();
        lock(&self.data).users.insert(id, User::new(id));
        Ok(id)
    }

    async fn get_user(&self, user_id: UserId) -> Result<User, StoreError> {
        lock(&self.data).users.get(&user_id).cloned().ok_or(StoreError::UserNotFound(user_id))
    }

    async fn new_action_id(&self) -> Result<ActionId, StoreError> {
        let mut data = lock(&self.data);
        data.next_action_id += 1;
        Ok(ActionId(data.next_action_id))
    }

    async fn get_action(&self, action_id: ActionId) -> Result<ActionRecord, StoreError> {
        check(&self.faults, FaultPoint::GetAction)?;
        lock(&self.data).actions.get(&action_id).cloned().ok_or(StoreError::ActionNotFound(action_id))
    }

    async fn tile_history(&self, location: &TileLocation) -> Result<TileHistory, StoreError> {
        check(&self.faults, FaultPoint::TileHistory)?;
        let data = lock(&self.data);
        match data.tiles.get(location) {
            Some(tile) => split_chain(&tile.entries()),
            None => Ok(TileHistory::default()),
        }
    }

    async fn revision_image(
        &self,
        location: &TileLocation,
        revision_id: RevisionId,
    ) -> Result<Option<TileImage>, StoreError> {
        check(&self.faults, FaultPoint::RevisionImage)?;
        let data = lock(&self.data);
        Ok(data.tiles.get(location).and_then(|tile| tile.images.get(&revision_id)).cloned())
    }

    async fn set_revision_image(
        &self,
        location: &TileLocation,
        revision_id: RevisionId,
        image: TileImage,
    ) -> Result<(), StoreError> {
        check(&self.faults, FaultPoint::SetRevisionImage)?;
        let mut data = lock(&self.data);
        let tile = data
            .tiles
            .get_mut(location)
            .filter(|tile| tile.chain.iter().any(|r| r.id == revision_id))
            .ok_or_else(|| StoreError::RevisionNotFound { location: location.clone(), revision_id })?;
        tile.images.insert(revision_id, image);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            data: Arc::clone(&self.data),
            faults: Arc::clone(&self.faults),
            undo: UndoLog::default(),
            finished: false,
        }))
    }
}

// =============================================================================
// TRANSACTION
// =============================================================================

/// First-touch snapshots. `None` means the record did not exist.
#[derive(Default)]
struct UndoLog {
    users: HashMap<UserId, Option<User>>,
    actions: HashMap<ActionId, Option<ActionRecord>>,
    tiles: HashMap<TileLocation, Option<TileRecord>>,
}

impl UndoLog {
    fn user(&mut self, data: &MemoryData, id: UserId) {
        self.users.entry(id).or_insert_with(|| data.users.get(&id).cloned());
    }

    fn action(&mut self, data: &MemoryData, id: ActionId) {
        self.actions.entry(id).or_insert_with(|| data.actions.get(&id).cloned());
    }

    fn tile(&mut self, data: &MemoryData, location: &TileLocation) {
        if !self.tiles.contains_key(location) {
            self.tiles.insert(location.clone(), data.tiles.get(location).cloned());
        }
    }

    fn restore(self, data: &mut MemoryData) {
        for (id, saved) in self.users {
            match saved {
                Some(user) => data.users.insert(id, user),
                None => data.users.remove(&id),
            };
        }
        for (id, saved) in self.actions {
            match saved {
                Some(record) => data.actions.insert(id, record),
                None => data.actions.remove(&id),
            };
        }
        for (location, saved) in self.tiles {
            match saved {
                Some(tile) => data.tiles.insert(location, tile),
                None => data.tiles.remove(&location),
            };
        }
    }
}

struct MemoryTransaction {
    data: Arc<Mutex<MemoryData>>,
    faults: Faults,
    undo: UndoLog,
    finished: bool,
}

impl MemoryTransaction {
    fn rollback_now(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let undo = std::mem::take(&mut self.undo);
        undo.restore(&mut lock(&self.data));
        debug!("memory transaction rolled back");
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.rollback_now();
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn create_action(&mut self, record: &ActionRecord) -> Result<(), StoreError> {
        check(&self.faults, FaultPoint::CreateAction)?;
        let mut data = lock(&self.data);
        self.undo.action(&data, record.id);
        data.actions.insert(record.id, record.clone());
        Ok(())
    }

    async fn set_next_action_id(&mut self, action_id: ActionId, next: ActionId) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        self.undo.action(&data, action_id);
        let record = data.actions.get_mut(&action_id).ok_or(StoreError::ActionNotFound(action_id))?;
        record.next_action_id = Some(next);
        Ok(())
    }

    async fn set_undone(&mut self, action_id: ActionId, undone: bool) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        self.undo.action(&data, action_id);
        let record = data.actions.get_mut(&action_id).ok_or(StoreError::ActionNotFound(action_id))?;
        record.undone = undone;
        Ok(())
    }

    async fn set_first_action_id(&mut self, user_id: UserId, action_id: ActionId) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        self.undo.user(&data, user_id);
        let user = data.users.get_mut(&user_id).ok_or(StoreError::UserNotFound(user_id))?;
        user.first_action_id = Some(action_id);
        Ok(())
    }

    async fn set_last_action_id(&mut self, user_id: UserId, action_id: Option<ActionId>) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        self.undo.user(&data, user_id);
        let user = data.users.get_mut(&user_id).ok_or(StoreError::UserNotFound(user_id))?;
        user.last_action_id = action_id;
        Ok(())
    }

    async fn increment_usage(&mut self, user_id: UserId, kind: ActionKind) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        self.undo.user(&data, user_id);
        let user = data.users.get_mut(&user_id).ok_or(StoreError::UserNotFound(user_id))?;
        user.usage.record(kind);
        Ok(())
    }

    async fn append_action(&mut self, region: &Region, action_id: ActionId) -> Result<(), StoreError> {
        check(&self.faults, FaultPoint::AppendAction)?;
        let mut data = lock(&self.data);
        for location in region {
            self.undo.tile(&data, location);
            let MemoryData { tiles, next_revision_id, .. } = &mut *data;
            let tile = tiles.entry(location.clone()).or_insert_with(|| {
                let base = next_revision(next_revision_id);
                TileRecord {
                    actions: Vec::new(),
                    chain: vec![RevisionRecord { id: base, action_id: None }],
                    images: HashMap::from([(base, TileImage::default())]),
                }
            });
            tile.actions.push(action_id);
        }
        Ok(())
    }

    async fn update_history_for_region(
        &mut self,
        region: &Region,
        action_id: ActionId,
    ) -> Result<Vec<Update>, StoreError> {
        check(&self.faults, FaultPoint::UpdateHistory)?;
        let mut data = lock(&self.data);
        let mut updates = Vec::new();
        for location in region {
            self.undo.tile(&data, location);
            let MemoryData { actions, tiles, next_revision_id, .. } = &mut *data;
            let tile = tiles
                .get_mut(location)
                .ok_or_else(|| StoreError::Corrupt(format!("no history at tile {location}")))?;
            if let Some(revision_id) = rebuild_tile(tile, location, action_id, actions, next_revision_id)? {
                updates.push(Update::Rendered { location: location.clone(), revision_id });
            }
        }
        Ok(updates)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        check(&self.faults, FaultPoint::Commit)?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.rollback_now();
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
