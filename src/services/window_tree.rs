//! Window tree — spatial index from tile location to interested viewers.
//!
//! DESIGN
//! ======
//! A viewer appears under every tile of its current window's region and
//! nowhere else. Tiles with no viewers are removed so transient windows do
//! not grow the map. All operations are pure in-memory updates; the caller
//! owns synchronization.

use std::collections::{HashMap, HashSet};

use crate::geometry::{Region, TileLocation};
use crate::model::ViewerId;

#[derive(Debug, Default)]
pub struct WindowTree {
    tiles: HashMap<TileLocation, HashSet<ViewerId>>,
}

impl WindowTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_window(&mut self, region: &Region, viewer: ViewerId) {
        for location in region {
            self.tiles.entry(location.clone()).or_default().insert(viewer);
        }
    }

    pub fn remove_window(&mut self, region: &Region, viewer: ViewerId) {
        for location in region {
            let Some(viewers) = self.tiles.get_mut(location) else {
                continue;
            };
            viewers.remove(&viewer);
            if viewers.is_empty() {
                self.tiles.remove(location);
            }
        }
    }

    #[must_use]
    pub fn viewers_at(&self, location: &TileLocation) -> HashSet<ViewerId> {
        self.tiles.get(location).cloned().unwrap_or_default()
    }

    /// Union of `viewers_at` over every tile of `region`.
    #[must_use]
    pub fn viewers_in_region(&self, region: &Region) -> HashSet<ViewerId> {
        region
            .iter()
            .filter_map(|location| self.tiles.get(location))
            .flatten()
            .copied()
            .collect()
    }

    /// Number of tiles with at least one viewer.
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }
}

#[cfg(test)]
#[path = "window_tree_test.rs"]
mod tests;
