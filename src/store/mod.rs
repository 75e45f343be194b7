//! Store — durable users, actions, tile histories and revision images.
//!
//! ARCHITECTURE
//! ============
//! The coordination core only talks to `CanvasStore`. Reads go straight to
//! the store; every history mutation goes through a `StoreTransaction` that
//! either commits as a whole or rolls back as a whole. Two engines ship:
//! `MemoryStore` (default, and the one tests run against) and `PgStore`.
//!
//! TILE HISTORY MODEL
//! ==================
//! Each tile keeps the ordered list of actions that touched it and a live
//! chain of revisions, one blank base followed by one revision per not-undone
//! action in order. Rendered revisions always form a prefix of the chain; the
//! rest is the pending tail the render loop drains.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::geometry::{Region, TileLocation};
use crate::model::{
    ActionId, ActionKind, ActionRecord, PendingRevision, RevisionId, TileHistory, TileImage, Update, User, UserId,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user not found: {0}")]
    UserNotFound(UserId),
    #[error("action not found: {0}")]
    ActionNotFound(ActionId),
    #[error("revision {revision_id} not found at tile {location}")]
    RevisionNotFound { location: TileLocation, revision_id: RevisionId },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("injected fault at {0}")]
    Injected(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::ActionNotFound(_) => "E_ACTION_NOT_FOUND",
            Self::RevisionNotFound { .. } => "E_REVISION_NOT_FOUND",
            Self::Corrupt(_) => "E_CORRUPT",
            Self::Injected(_) | Self::Database(_) => "E_DATABASE",
            Self::Codec(_) => "E_CODEC",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Injected(_) | Self::Database(_))
    }
}

// =============================================================================
// CONTRACT
// =============================================================================

#[async_trait]
pub trait CanvasStore: Send + Sync {
    async fn create_user(&self) -> Result<UserId, StoreError>;

    async fn get_user(&self, user_id: UserId) -> Result<User, StoreError>;

    /// Allocate a fresh action id, strictly greater than every earlier one.
    async fn new_action_id(&self) -> Result<ActionId, StoreError>;

    async fn get_action(&self, action_id: ActionId) -> Result<ActionRecord, StoreError>;

    /// Rendered base and pending tail of one tile. Unknown tiles are empty.
    async fn tile_history(&self, location: &TileLocation) -> Result<TileHistory, StoreError>;

    /// Image of a rendered revision, `None` if unknown or still pending.
    async fn revision_image(
        &self,
        location: &TileLocation,
        revision_id: RevisionId,
    ) -> Result<Option<TileImage>, StoreError>;

    /// Store the rendered image of a pending revision.
    async fn set_revision_image(
        &self,
        location: &TileLocation,
        revision_id: RevisionId,
        image: TileImage,
    ) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Atomic unit of history mutation. Dropping without `commit` rolls back.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn create_action(&mut self, record: &ActionRecord) -> Result<(), StoreError>;

    async fn set_next_action_id(&mut self, action_id: ActionId, next: ActionId) -> Result<(), StoreError>;

    async fn set_undone(&mut self, action_id: ActionId, undone: bool) -> Result<(), StoreError>;

    async fn set_first_action_id(&mut self, user_id: UserId, action_id: ActionId) -> Result<(), StoreError>;

    async fn set_last_action_id(&mut self, user_id: UserId, action_id: Option<ActionId>) -> Result<(), StoreError>;

    async fn increment_usage(&mut self, user_id: UserId, kind: ActionKind) -> Result<(), StoreError>;

    /// Record `action_id` at the end of every tile's action list, creating
    /// tiles (with a blank rendered base) on first touch.
    async fn append_action(&mut self, region: &Region, action_id: ActionId) -> Result<(), StoreError>;

    /// Rebuild each tile's chain from `action_id` onward: revisions at or
    /// after it are retired and one pending revision is queued per not-undone
    /// action from that point. Returns a `Rendered` update for every tile
    /// whose rendered base moved back.
    async fn update_history_for_region(
        &mut self,
        region: &Region,
        action_id: ActionId,
    ) -> Result<Vec<Update>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

// =============================================================================
// SHARED HELPERS
// =============================================================================

/// One revision of a tile's live chain, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainEntry {
    pub revision_id: RevisionId,
    pub action_id: Option<ActionId>,
    pub rendered: bool,
}

/// Split a live chain into its rendered base and pending tail.
pub(crate) fn split_chain(chain: &[ChainEntry]) -> Result<TileHistory, StoreError> {
    let rendered = chain.iter().take_while(|entry| entry.rendered).count();
    let base_revision_id = rendered.checked_sub(1).map(|i| chain[i].revision_id);

    let mut tail = Vec::with_capacity(chain.len() - rendered);
    for entry in &chain[rendered..] {
        let Some(action_id) = entry.action_id else {
            return Err(StoreError::Corrupt(format!("pending revision {} has no action", entry.revision_id)));
        };
        tail.push(PendingRevision { revision_id: entry.revision_id, action_id });
    }
    Ok(TileHistory { base_revision_id, tail })
}

/// How to rebuild one tile's chain from a given action onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rebuild {
    /// Chain entries to keep; everything after is retired.
    pub keep: usize,
    /// Index into the tile's action list from which revisions are requeued.
    pub start: usize,
    /// Surviving base, set only when a rendered revision was retired.
    pub moved_back: Option<RevisionId>,
}

/// Plan the rebuild of a tile whose chain is `chain` and whose action list is
/// `actions`, starting at `action_id`.
pub(crate) fn plan_rebuild(
    location: &TileLocation,
    chain: &[ChainEntry],
    actions: &[ActionId],
    action_id: ActionId,
) -> Result<Rebuild, StoreError> {
    let Some(start) = actions.iter().position(|id| *id == action_id) else {
        return Err(StoreError::Corrupt(format!("action {action_id} is not recorded at tile {location}")));
    };

    // The chain's actions are a subsequence of `actions` in the same order,
    // so one forward cursor decides which entries predate `start`.
    let mut cursor = 0;
    let keep = chain
        .iter()
        .take_while(|entry| match entry.action_id {
            None => true,
            Some(id) => {
                while cursor < start && actions[cursor] != id {
                    cursor += 1;
                }
                cursor < start
            }
        })
        .count();
    let moved_back = if chain[keep..].iter().any(|entry| entry.rendered) {
        keep.checked_sub(1).map(|i| chain[i].revision_id)
    } else {
        None
    };
    Ok(Rebuild { keep, start, moved_back })
}

/// Everything a freshly positioned viewer needs for `region`: the current base
/// revision of every known tile, then every still-pending action once.
pub async fn region_updates(store: &dyn CanvasStore, region: &Region) -> Result<Vec<Update>, StoreError> {
    let mut rendered = Vec::new();
    let mut pending: Vec<ActionId> = Vec::new();

    for location in region {
        let history = store.tile_history(location).await?;
        if let Some(revision_id) = history.base_revision_id {
            rendered.push(Update::Rendered { location: location.clone(), revision_id });
        }
        for revision in history.tail {
            if !pending.contains(&revision.action_id) {
                pending.push(revision.action_id);
            }
        }
    }

    pending.sort_unstable();
    let mut updates = rendered;
    for action_id in pending {
        let record = store.get_action(action_id).await?;
        updates.push(Update::Action {
            action_id: record.id,
            action: record.action,
            user_id: record.user_id,
            region: record.region,
        });
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, action: Option<i64>, rendered: bool) -> ChainEntry {
        ChainEntry { revision_id: RevisionId(id), action_id: action.map(ActionId), rendered }
    }

    #[test]
    fn split_chain_separates_rendered_prefix() {
        let chain = [entry(1, None, true), entry(2, Some(10), true), entry(3, Some(11), false), entry(4, Some(12), false)];
        let history = split_chain(&chain).unwrap();
        assert_eq!(history.base_revision_id, Some(RevisionId(2)));
        assert_eq!(
            history.tail,
            vec![
                PendingRevision { revision_id: RevisionId(3), action_id: ActionId(11) },
                PendingRevision { revision_id: RevisionId(4), action_id: ActionId(12) },
            ]
        );
    }

    #[test]
    fn split_chain_of_unknown_tile_is_empty() {
        let history = split_chain(&[]).unwrap();
        assert_eq!(history, TileHistory::default());
    }

    #[test]
    fn rebuild_from_middle_keeps_earlier_revisions() {
        let location = TileLocation::new(0, 0);
        let chain = [entry(1, None, true), entry(2, Some(10), true), entry(3, Some(11), true), entry(4, Some(12), false)];
        let actions = [ActionId(10), ActionId(11), ActionId(12)];

        let plan = plan_rebuild(&location, &chain, &actions, ActionId(11)).unwrap();
        assert_eq!(plan, Rebuild { keep: 2, start: 1, moved_back: Some(RevisionId(2)) });
    }

    #[test]
    fn rebuild_of_unrendered_suffix_does_not_move_base() {
        let location = TileLocation::new(0, 0);
        let chain = [entry(1, None, true), entry(2, Some(10), false)];
        let plan = plan_rebuild(&location, &chain, &[ActionId(10)], ActionId(10)).unwrap();
        assert_eq!(plan, Rebuild { keep: 1, start: 0, moved_back: None });
    }

    #[test]
    fn rebuild_skips_undone_actions_missing_from_chain() {
        // Action 10 is undone, so it has no revision; 11 still follows it.
        let location = TileLocation::new(0, 0);
        let chain = [entry(1, None, true), entry(2, Some(11), false)];
        let actions = [ActionId(10), ActionId(11)];
        let plan = plan_rebuild(&location, &chain, &actions, ActionId(10)).unwrap();
        assert_eq!(plan.keep, 1);
        assert_eq!(plan.start, 0);
    }

    #[test]
    fn rebuild_walks_long_histories_in_one_pass() {
        let location = TileLocation::new(0, 0);
        let n: i64 = 20_000;
        let actions: Vec<ActionId> = (1..=n).map(ActionId).collect();
        let mut chain = vec![entry(0, None, true)];
        chain.extend((1..=n).map(|id| entry(id, Some(id), true)));

        let plan = plan_rebuild(&location, &chain, &actions, ActionId(n)).unwrap();
        assert_eq!(plan.keep, chain.len() - 1);
        assert_eq!(plan.moved_back, Some(RevisionId(n - 1)));

        let plan = plan_rebuild(&location, &chain, &actions, ActionId(1)).unwrap();
        assert_eq!(plan, Rebuild { keep: 1, start: 0, moved_back: Some(RevisionId(0)) });
    }

    #[test]
    fn rebuild_keeps_revisions_across_undone_gaps() {
        // Actions 11 and 13 are undone; rebuilding from 14 keeps 10 and 12.
        let location = TileLocation::new(0, 0);
        let chain = [entry(1, None, true), entry(2, Some(10), true), entry(3, Some(12), true), entry(4, Some(14), false)];
        let actions = [ActionId(10), ActionId(11), ActionId(12), ActionId(13), ActionId(14)];
        let plan = plan_rebuild(&location, &chain, &actions, ActionId(14)).unwrap();
        assert_eq!(plan, Rebuild { keep: 3, start: 4, moved_back: None });
    }

    #[test]
    fn rebuild_of_unknown_action_is_corrupt() {
        let location = TileLocation::new(0, 0);
        let err = plan_rebuild(&location, &[entry(1, None, true)], &[], ActionId(5)).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn pending_revision_without_action_is_corrupt() {
        let chain = [entry(1, None, false)];
        assert!(matches!(split_chain(&chain), Err(StoreError::Corrupt(_))));
    }
}
