use super::*;
use crate::geometry::Window;

const TILE: u32 = 256;

fn window(x: i64, y: i64, width: i64, height: i64) -> Window {
    Window::new(x.into(), y.into(), width.into(), height.into(), TILE).expect("valid window")
}

#[test]
fn viewers_at_lists_every_covering_window() {
    let mut tree = WindowTree::new();
    let a = ViewerId::new_v4();
    let b = ViewerId::new_v4();

    tree.add_window(window(0, 0, 300, 300).region(), a);
    tree.add_window(window(200, 200, 100, 100).region(), b);

    let at_origin = tree.viewers_at(&TileLocation::new(0, 0));
    assert_eq!(at_origin, HashSet::from([a, b]));

    let at_corner = tree.viewers_at(&TileLocation::new(1, 1));
    assert_eq!(at_corner, HashSet::from([a, b]));

    assert!(tree.viewers_at(&TileLocation::new(5, 5)).is_empty());
}

#[test]
fn viewers_in_region_matches_intersecting_windows_only() {
    let mut tree = WindowTree::new();
    let left = ViewerId::new_v4();
    let right = ViewerId::new_v4();
    let far = ViewerId::new_v4();

    tree.add_window(window(-600, 0, 500, 100).region(), left);
    tree.add_window(window(0, 0, 500, 100).region(), right);
    tree.add_window(window(100_000, 100_000, 10, 10).region(), far);

    let query = window(-10, 0, 20, 20);
    let found = tree.viewers_in_region(query.region());
    assert_eq!(found, HashSet::from([left, right]));

    let disjoint = window(-5_000, -5_000, 10, 10);
    assert!(tree.viewers_in_region(disjoint.region()).is_empty());
}

#[test]
fn replacing_a_window_leaves_no_stale_tiles() {
    let mut tree = WindowTree::new();
    let viewer = ViewerId::new_v4();
    let old = window(0, 0, 1024, 1024);
    let new = window(4096, 4096, 256, 256);

    tree.add_window(old.region(), viewer);
    tree.remove_window(old.region(), viewer);
    tree.add_window(new.region(), viewer);

    for location in old.region() {
        assert!(!tree.viewers_at(location).contains(&viewer), "stale entry at {location}");
    }
    assert_eq!(tree.tile_count(), 1);
    assert!(tree.viewers_at(&TileLocation::new(16, 16)).contains(&viewer));
}

#[test]
fn removing_last_viewer_drops_tile_entry() {
    let mut tree = WindowTree::new();
    let a = ViewerId::new_v4();
    let b = ViewerId::new_v4();
    let w = window(0, 0, 10, 10);

    tree.add_window(w.region(), a);
    tree.add_window(w.region(), b);
    assert_eq!(tree.tile_count(), 1);

    tree.remove_window(w.region(), a);
    assert_eq!(tree.tile_count(), 1);

    tree.remove_window(w.region(), b);
    assert_eq!(tree.tile_count(), 0);
}

#[test]
fn add_and_remove_are_idempotent() {
    let mut tree = WindowTree::new();
    let viewer = ViewerId::new_v4();
    let w = window(0, 0, 600, 10);

    tree.add_window(w.region(), viewer);
    tree.add_window(w.region(), viewer);
    assert_eq!(tree.viewers_in_region(w.region()).len(), 1);

    tree.remove_window(w.region(), viewer);
    tree.remove_window(w.region(), viewer);
    assert_eq!(tree.tile_count(), 0);
}
