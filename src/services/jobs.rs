//! Job registry — tiles that currently own a render loop.
//!
//! Membership is the only mutual exclusion for starting loops: `try_start`
//! succeeds once per tile until the owning loop calls `stop`. Nothing is
//! queued here; the pending work lives in the tile's revision tail.

use std::collections::HashSet;

use crate::geometry::TileLocation;

#[derive(Debug, Default)]
pub struct JobRegistry {
    active: HashSet<TileLocation>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `location`. Returns `false` if a loop already owns it.
    pub fn try_start(&mut self, location: &TileLocation) -> bool {
        self.active.insert(location.clone())
    }

    /// Deregister `location` once its loop found nothing left to render.
    pub fn stop(&mut self, location: &TileLocation) {
        self.active.remove(location);
    }

    #[must_use]
    pub fn is_active(&self, location: &TileLocation) -> bool {
        self.active.contains(location)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
