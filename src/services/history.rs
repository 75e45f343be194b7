//! Action history — apply, undo and redo over each user's linked timeline.
//!
//! DESIGN
//! ======
//! Every user owns a doubly linked list of actions. `last_action_id` marks the
//! current position; undo walks it back and flags the action undone, redo
//! walks it forward over undone actions, and a fresh apply truncates the redo
//! branch by relinking the current position to the new action.
//!
//! A request runs as one task: validate (no locks), then lock canvas, user,
//! action(s) oldest first, then the affected tile region, then transact. The
//! `LockSet` guard releases everything in reverse order on every exit path.
//!
//! FAILURE CLASSES
//! ===============
//! - Validation: rejected before any lock is taken.
//! - State: rejected after locking, before the transaction starts.
//! - Transaction: any store failure rolls back; nothing is broadcast.
//!
//! Side effects (action update, rebuilt-tile updates, render scheduling) run
//! only after a successful commit, while the region locks are still held.

use num_bigint::BigInt;
use tracing::{error, info, warn};

use crate::config::CanvasConfig;
use crate::frame::ErrorCode;
use crate::geometry::{BoundingBox, Region};
use crate::model::{Action, ActionId, ActionKind, ActionRecord, Stroke, Update, User, UserId};
use crate::services::lock::LockSet;
use crate::services::{broadcast, render};
use crate::state::AppState;
use crate::store::{StoreError, StoreTransaction};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("stroke has no points")]
    EmptyStroke,
    #[error("stroke width must be at least 1")]
    InvalidWidth,
    #[error("stroke opacity must be within 0..=1 (got {0})")]
    InvalidOpacity(f64),
    #[error("stroke is too big: {width}x{height} exceeds {max}")]
    StrokeTooLarge { width: BigInt, height: BigInt, max: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("action {0} is already undone")]
    AlreadyUndone(ActionId),
    #[error("nothing to redo")]
    NothingToRedo,
    #[error("action {0} is not undone")]
    NotUndone(ActionId),
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("transaction failed: {0}")]
    Transaction(#[from] StoreError),
}

impl ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyStroke => "E_EMPTY_STROKE",
            Self::InvalidWidth => "E_INVALID_WIDTH",
            Self::InvalidOpacity(_) => "E_INVALID_OPACITY",
            Self::StrokeTooLarge { .. } => "E_STROKE_TOO_LARGE",
        }
    }
}

impl ErrorCode for StateError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NothingToUndo => "E_NOTHING_TO_UNDO",
            Self::AlreadyUndone(_) => "E_ALREADY_UNDONE",
            Self::NothingToRedo => "E_NOTHING_TO_REDO",
            Self::NotUndone(_) => "E_NOT_UNDONE",
        }
    }
}

impl ErrorCode for ActionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.error_code(),
            Self::State(e) => e.error_code(),
            Self::Transaction(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::State(_) => false,
            Self::Transaction(e) => e.retryable(),
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Check a stroke and return the tiles it touches.
///
/// The bounding box of the points is grown by half the stroke width (rounded
/// up) on every side; its inclusive extent may not exceed `max_stroke_size`
/// on either axis.
///
/// # Errors
///
/// Returns the first `ValidationError` found.
pub fn validate_stroke(stroke: &Stroke, config: &CanvasConfig) -> Result<Region, ValidationError> {
    let mut bounds = BoundingBox::from_points(&stroke.points).ok_or(ValidationError::EmptyStroke)?;
    if stroke.width == 0 {
        return Err(ValidationError::InvalidWidth);
    }
    if !(0.0..=1.0).contains(&stroke.opacity) {
        return Err(ValidationError::InvalidOpacity(stroke.opacity));
    }

    bounds.extend(&BigInt::from(stroke.width.div_ceil(2)));
    let (width, height) = (bounds.width(), bounds.height());
    let max = BigInt::from(config.max_stroke_size);
    if width > max || height > max {
        return Err(ValidationError::StrokeTooLarge { width, height, max: config.max_stroke_size });
    }
    Ok(bounds.region(config.tile_size))
}

// =============================================================================
// SEND ACTION
// =============================================================================

enum Transition {
    Apply(Region),
    Undo,
    Redo,
}

/// Map an action to its transition, validating stroke edits up front.
fn plan(action: &Action, config: &CanvasConfig) -> Result<Transition, ValidationError> {
    match action {
        Action::Brush(stroke) | Action::Eraser(stroke) => Ok(Transition::Apply(validate_stroke(stroke, config)?)),
        Action::Undo => Ok(Transition::Undo),
        Action::Redo => Ok(Transition::Redo),
    }
}

/// What a committed transition changed.
struct Committed {
    action_id: ActionId,
    region: Region,
    updates: Vec<Update>,
}

/// Apply, undo or redo on behalf of `user_id`. Returns the id of the action
/// that was created, undone or redone.
///
/// # Errors
///
/// See the failure classes in the module docs.
pub async fn send_action(state: &AppState, user_id: UserId, action: Action) -> Result<ActionId, ActionError> {
    let kind = action.kind();
    let result = perform(state, user_id, &action).await;
    match &result {
        Ok(action_id) => info!(%user_id, %action_id, kind = kind.as_str(), "action committed"),
        Err(e) => warn!(%user_id, kind = kind.as_str(), error = %e, "action rejected"),
    }
    result
}

async fn perform(state: &AppState, user_id: UserId, action: &Action) -> Result<ActionId, ActionError> {
    let transition = plan(action, &state.config)?;

    let mut locks = LockSet::new(&state.locks);
    locks.canvas().await;
    locks.user(user_id).await;
    let user = state.store.get_user(user_id).await?;

    let committed = match transition {
        Transition::Apply(region) => apply(state, &mut locks, &user, action, region).await?,
        Transition::Undo => undo(state, &mut locks, &user).await?,
        Transition::Redo => redo(state, &mut locks, &user).await?,
    };

    publish(state, user_id, action, &committed);
    drop(locks);
    Ok(committed.action_id)
}

async fn apply(
    state: &AppState,
    locks: &mut LockSet,
    user: &User,
    action: &Action,
    region: Region,
) -> Result<Committed, ActionError> {
    let action_id = state.store.new_action_id().await?;
    let previous = user.last_action_id;
    if let Some(previous) = previous {
        locks.action(previous).await;
    }
    locks.action(action_id).await;
    locks.region(&region).await;

    let record = ActionRecord {
        id: action_id,
        user_id: user.id,
        action: action.clone(),
        previous_action_id: previous,
        next_action_id: None,
        undone: false,
        region: region.clone(),
    };

    let mut tx = state.store.begin().await?;
    let result: Result<Vec<Update>, StoreError> = async {
        tx.create_action(&record).await?;
        tx.set_last_action_id(user.id, Some(action_id)).await?;
        tx.append_action(&region, action_id).await?;
        let updates = tx.update_history_for_region(&region, action_id).await?;
        tx.increment_usage(user.id, action.kind()).await?;
        match previous {
            Some(previous) => tx.set_next_action_id(previous, action_id).await?,
            None => tx.set_first_action_id(user.id, action_id).await?,
        }
        Ok(updates)
    }
    .await;

    let updates = settle(tx, result).await?;
    Ok(Committed { action_id, region, updates })
}

async fn undo(state: &AppState, locks: &mut LockSet, user: &User) -> Result<Committed, ActionError> {
    let action_id = user.last_action_id.ok_or(StateError::NothingToUndo)?;
    locks.action(action_id).await;
    let target = state.store.get_action(action_id).await?;
    if target.undone {
        return Err(StateError::AlreadyUndone(action_id).into());
    }
    locks.region(&target.region).await;

    let mut tx = state.store.begin().await?;
    let result: Result<Vec<Update>, StoreError> = async {
        tx.set_undone(action_id, true).await?;
        tx.set_last_action_id(user.id, target.previous_action_id).await?;
        let updates = tx.update_history_for_region(&target.region, action_id).await?;
        tx.increment_usage(user.id, ActionKind::Undo).await?;
        Ok(updates)
    }
    .await;

    let updates = settle(tx, result).await?;
    Ok(Committed { action_id, region: target.region, updates })
}

async fn redo(state: &AppState, locks: &mut LockSet, user: &User) -> Result<Committed, ActionError> {
    let action_id = match user.last_action_id {
        Some(last) => {
            locks.action(last).await;
            let current = state.store.get_action(last).await?;
            current.next_action_id.ok_or(StateError::NothingToRedo)?
        }
        None => user.first_action_id.ok_or(StateError::NothingToRedo)?,
    };
    locks.action(action_id).await;
    let target = state.store.get_action(action_id).await?;
    if !target.undone {
        return Err(StateError::NotUndone(action_id).into());
    }
    locks.region(&target.region).await;

    let mut tx = state.store.begin().await?;
    let result: Result<Vec<Update>, StoreError> = async {
        tx.set_undone(action_id, false).await?;
        tx.set_last_action_id(user.id, Some(action_id)).await?;
        let updates = tx.update_history_for_region(&target.region, action_id).await?;
        tx.increment_usage(user.id, ActionKind::Redo).await?;
        Ok(updates)
    }
    .await;

    let updates = settle(tx, result).await?;
    Ok(Committed { action_id, region: target.region, updates })
}

/// Commit on success, roll back on failure.
async fn settle(
    tx: Box<dyn StoreTransaction>,
    result: Result<Vec<Update>, StoreError>,
) -> Result<Vec<Update>, StoreError> {
    match result {
        Ok(updates) => {
            tx.commit().await?;
            Ok(updates)
        }
        Err(e) => {
            warn!(error = %e, "transaction failed; rolling back");
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

fn publish(state: &AppState, user_id: UserId, action: &Action, committed: &Committed) {
    broadcast::enqueue_update(
        state,
        Update::Action {
            action_id: committed.action_id,
            action: action.clone(),
            user_id,
            region: committed.region.clone(),
        },
    );
    for update in &committed.updates {
        broadcast::enqueue_update(state, update.clone());
    }
    render::schedule_region(state, &committed.region);
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
