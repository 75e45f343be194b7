use super::*;
use crate::geometry::Point;
use crate::model::{Action, PendingRevision, Stroke};
use crate::store::region_updates;

fn brush() -> Action {
    Action::Brush(Stroke { points: vec![Point::new(1, 1)], width: 2, opacity: 1.0, color: None })
}

fn region(tiles: &[(i64, i64)]) -> Region {
    tiles.iter().map(|&(c, r)| TileLocation::new(c, r)).collect()
}

/// Record a new action over `region` the way an apply commits it.
async fn apply(store: &MemoryStore, user_id: UserId, region: &Region) -> ActionId {
    let id = store.new_action_id().await.unwrap();
    let previous = store.get_user(user_id).await.unwrap().last_action_id;
    let record = ActionRecord {
        id,
        user_id,
        action: brush(),
        previous_action_id: previous,
        next_action_id: None,
        undone: false,
        region: region.clone(),
    };

    let mut tx = store.begin().await.unwrap();
    tx.create_action(&record).await.unwrap();
    tx.set_last_action_id(user_id, Some(id)).await.unwrap();
    tx.append_action(region, id).await.unwrap();
    tx.update_history_for_region(region, id).await.unwrap();
    tx.increment_usage(user_id, ActionKind::Brush).await.unwrap();
    match previous {
        Some(prev) => tx.set_next_action_id(prev, id).await.unwrap(),
        None => tx.set_first_action_id(user_id, id).await.unwrap(),
    }
    tx.commit().await.unwrap();
    id
}

/// Render every pending revision of `location` with a marker image.
async fn render_all(store: &MemoryStore, location: &TileLocation) {
    let history = store.tile_history(location).await.unwrap();
    for revision in history.tail {
        store.set_revision_image(location, revision.revision_id, TileImage(vec![1])).await.unwrap();
    }
}

#[tokio::test]
async fn users_start_with_empty_history() {
    let store = MemoryStore::new();
    let id = store.create_user().await.unwrap();
    let user = store.get_user(id).await.unwrap();
    assert_eq!(user, User::new(id));

    let missing = store.get_user(UserId::new_v4()).await;
    assert!(matches!(missing, Err(StoreError::UserNotFound(_))));
}

#[tokio::test]
async fn action_ids_strictly_increase() {
    let store = MemoryStore::new();
    let a = store.new_action_id().await.unwrap();
    let b = store.new_action_id().await.unwrap();
    assert!(a < b);
}

#[tokio::test]
async fn first_touch_creates_blank_rendered_base() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let tile = TileLocation::new(0, 0);
    let action = apply(&store, user, &region(&[(0, 0)])).await;

    let history = store.tile_history(&tile).await.unwrap();
    let base = history.base_revision_id.expect("blank base is rendered");
    assert_eq!(store.revision_image(&tile, base).await.unwrap(), Some(TileImage::default()));
    assert_eq!(history.tail.len(), 1);
    assert_eq!(history.tail[0].action_id, action);
    assert!(history.tail[0].revision_id > base);
}

#[tokio::test]
async fn unknown_tile_has_no_history() {
    let store = MemoryStore::new();
    let history = store.tile_history(&TileLocation::new(9, 9)).await.unwrap();
    assert_eq!(history, TileHistory::default());
}

#[tokio::test]
async fn apply_links_user_history() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let r = region(&[(0, 0)]);
    let a = apply(&store, user, &r).await;
    let b = apply(&store, user, &r).await;

    let u = store.get_user(user).await.unwrap();
    assert_eq!(u.first_action_id, Some(a));
    assert_eq!(u.last_action_id, Some(b));
    assert_eq!(u.usage.brush, 2);

    let first = store.get_action(a).await.unwrap();
    assert_eq!(first.next_action_id, Some(b));
    let second = store.get_action(b).await.unwrap();
    assert_eq!(second.previous_action_id, Some(a));
}

#[tokio::test]
async fn undo_rebuild_retires_rendered_revisions_and_requeues_later_actions() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let tile = TileLocation::new(0, 0);
    let r = region(&[(0, 0)]);

    let before = store.tile_history(&tile).await.unwrap();
    assert!(before.base_revision_id.is_none());

    let a = apply(&store, user, &r).await;
    let blank = store.tile_history(&tile).await.unwrap().base_revision_id.unwrap();
    let b = apply(&store, user, &r).await;
    render_all(&store, &tile).await;
    let rendered = store.tile_history(&tile).await.unwrap();
    assert!(rendered.tail.is_empty());
    let superseded = rendered.base_revision_id.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.set_undone(a, true).await.unwrap();
    let updates = tx.update_history_for_region(&r, a).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(updates, vec![Update::Rendered { location: tile.clone(), revision_id: blank }]);
    let history = store.tile_history(&tile).await.unwrap();
    assert_eq!(history.base_revision_id, Some(blank));
    assert_eq!(history.tail.len(), 1);
    assert_eq!(history.tail[0].action_id, b);

    assert_eq!(store.revision_image(&tile, superseded).await.unwrap(), None);
    assert_eq!(store.revision_image(&tile, blank).await.unwrap(), Some(TileImage::default()));
    let data = lock(&store.data);
    assert_eq!(data.tiles[&tile].images.len(), 1, "only the blank base keeps an image");
}

#[tokio::test]
async fn rebuild_without_rendered_losses_reports_nothing() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let tile = TileLocation::new(2, 2);
    let r = region(&[(2, 2)]);
    let a = apply(&store, user, &r).await;
    let b = apply(&store, user, &r).await;

    let mut tx = store.begin().await.unwrap();
    tx.set_undone(b, true).await.unwrap();
    let updates = tx.update_history_for_region(&r, b).await.unwrap();
    tx.commit().await.unwrap();

    assert!(updates.is_empty());
    let history = store.tile_history(&tile).await.unwrap();
    assert_eq!(history.tail.iter().map(|p| p.action_id).collect::<Vec<_>>(), vec![a]);
}

#[tokio::test]
async fn dropping_transaction_rolls_back_every_write() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let tile = TileLocation::new(0, 0);
    let r = region(&[(0, 0)]);
    let id = store.new_action_id().await.unwrap();

    {
        let mut tx = store.begin().await.unwrap();
        tx.set_last_action_id(user, Some(id)).await.unwrap();
        tx.set_first_action_id(user, id).await.unwrap();
        tx.increment_usage(user, ActionKind::Brush).await.unwrap();
        tx.append_action(&r, id).await.unwrap();
    }

    assert_eq!(store.get_user(user).await.unwrap(), User::new(user));
    assert_eq!(store.tile_history(&tile).await.unwrap(), TileHistory::default());
}

#[tokio::test]
async fn explicit_rollback_restores_previous_records() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let r = region(&[(0, 0)]);
    let a = apply(&store, user, &r).await;

    let mut tx = store.begin().await.unwrap();
    tx.set_undone(a, true).await.unwrap();
    tx.set_last_action_id(user, None).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(!store.get_action(a).await.unwrap().undone);
    assert_eq!(store.get_user(user).await.unwrap().last_action_id, Some(a));
}

#[tokio::test]
async fn injected_commit_failure_rolls_back() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let r = region(&[(0, 0)]);
    let id = store.new_action_id().await.unwrap();
    store.fail_next(FaultPoint::Commit, 1);

    let mut tx = store.begin().await.unwrap();
    tx.append_action(&r, id).await.unwrap();
    tx.set_last_action_id(user, Some(id)).await.unwrap();
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, StoreError::Injected("commit")));
    assert_eq!(store.get_user(user).await.unwrap().last_action_id, None);
    assert_eq!(store.tile_history(&TileLocation::new(0, 0)).await.unwrap(), TileHistory::default());
}

#[tokio::test]
async fn faults_fire_the_requested_number_of_times() {
    let store = MemoryStore::new();
    store.fail_next(FaultPoint::TileHistory, 2);
    let tile = TileLocation::new(0, 0);

    assert!(store.tile_history(&tile).await.is_err());
    assert!(store.tile_history(&tile).await.is_err());
    assert!(store.tile_history(&tile).await.is_ok());
}

#[tokio::test]
async fn set_revision_image_rejects_retired_revisions() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let tile = TileLocation::new(0, 0);
    let r = region(&[(0, 0)]);
    let a = apply(&store, user, &r).await;
    let pending = store.tile_history(&tile).await.unwrap().tail[0];

    let mut tx = store.begin().await.unwrap();
    tx.set_undone(a, true).await.unwrap();
    tx.update_history_for_region(&r, a).await.unwrap();
    tx.commit().await.unwrap();

    let err = store.set_revision_image(&tile, pending.revision_id, TileImage(vec![1])).await.unwrap_err();
    assert!(matches!(err, StoreError::RevisionNotFound { .. }));
}

#[tokio::test]
async fn region_updates_lists_bases_then_pending_actions_once() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let wide = region(&[(0, 0), (1, 0)]);
    let a = apply(&store, user, &wide).await;

    let updates = region_updates(&store, &wide).await.unwrap();
    assert_eq!(updates.len(), 3);
    assert!(matches!(updates[0], Update::Rendered { .. }));
    assert!(matches!(updates[1], Update::Rendered { .. }));
    match &updates[2] {
        Update::Action { action_id, user_id, region, .. } => {
            assert_eq!(*action_id, a);
            assert_eq!(*user_id, user);
            assert_eq!(region, &wide);
        }
        other => panic!("expected action update, got {other:?}"),
    }
}

#[tokio::test]
async fn pending_tail_is_in_chain_order() {
    let store = MemoryStore::new();
    let user = store.create_user().await.unwrap();
    let tile = TileLocation::new(0, 0);
    let r = region(&[(0, 0)]);
    let a = apply(&store, user, &r).await;
    let b = apply(&store, user, &r).await;

    let tail: Vec<PendingRevision> = store.tile_history(&tile).await.unwrap().tail;
    assert_eq!(tail.iter().map(|p| p.action_id).collect::<Vec<_>>(), vec![a, b]);
    assert!(tail[0].revision_id < tail[1].revision_id);
}
