//! Domain model — identifiers, actions, users, tile history and updates.
//!
//! DESIGN
//! ======
//! `Action` is a closed tagged variant. Stroke edits (`brush`, `eraser`) carry
//! geometry; `undo` and `redo` are payload-free meta operations whose target
//! is derived from the user's history pointers. Absent history pointers are
//! `None` rather than a sentinel id.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{Point, Region, TileLocation};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Durable user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

/// One connected websocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(pub Uuid);

/// Action ids are allocated in increasing order, so a smaller id is older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub i64);

impl UserId {
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl ViewerId {
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Geometry and style of one freehand stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    /// Stroke width in pixels.
    pub width: u32,
    /// 0.0 (transparent) ..= 1.0 (opaque).
    pub opacity: f64,
    /// CSS colour. Ignored by the eraser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Brush(Stroke),
    Eraser(Stroke),
    Undo,
    Redo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Brush,
    Eraser,
    Undo,
    Redo,
}

impl Action {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Brush(_) => ActionKind::Brush,
            Self::Eraser(_) => ActionKind::Eraser,
            Self::Undo => ActionKind::Undo,
            Self::Redo => ActionKind::Redo,
        }
    }

    /// Stroke payload for edit actions, `None` for undo/redo.
    #[must_use]
    pub fn stroke(&self) -> Option<&Stroke> {
        match self {
            Self::Brush(stroke) | Self::Eraser(stroke) => Some(stroke),
            Self::Undo | Self::Redo => None,
        }
    }
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Brush => "brush",
            Self::Eraser => "eraser",
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

/// A persisted stroke action and its place in the owner's linked history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub user_id: UserId,
    pub action: Action,
    pub previous_action_id: Option<ActionId>,
    pub next_action_id: Option<ActionId>,
    pub undone: bool,
    pub region: Region,
}

// =============================================================================
// USERS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub brush: u64,
    pub eraser: u64,
    pub undo: u64,
    pub redo: u64,
}

impl Usage {
    pub fn record(&mut self, kind: ActionKind) {
        let counter = match kind {
            ActionKind::Brush => &mut self.brush,
            ActionKind::Eraser => &mut self.eraser,
            ActionKind::Undo => &mut self.undo,
            ActionKind::Redo => &mut self.redo,
        };
        *counter += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Earliest action ever created by the user; the redo entry point when
    /// `last_action_id` is `None`.
    pub first_action_id: Option<ActionId>,
    /// Most recently applied action that has not been rewound by undo.
    pub last_action_id: Option<ActionId>,
    pub usage: Usage,
}

impl User {
    #[must_use]
    pub fn new(id: UserId) -> Self {
        Self { id, first_action_id: None, last_action_id: None, usage: Usage::default() }
    }
}

// =============================================================================
// TILE HISTORY
// =============================================================================

/// Opaque encoded tile image. An empty image is a blank tile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileImage(pub Vec<u8>);

/// A revision queued for rendering, tagged with the action that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRevision {
    pub revision_id: RevisionId,
    pub action_id: ActionId,
}

/// Latest rendered revision of a tile plus its pending tail, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileHistory {
    pub base_revision_id: Option<RevisionId>,
    pub tail: Vec<PendingRevision>,
}

// =============================================================================
// UPDATES
// =============================================================================

/// One entry in a viewer's outbound update batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Update {
    /// A tile revision finished rendering (or became the tile's base again).
    Rendered { location: TileLocation, revision_id: RevisionId },
    /// An action was applied, undone or redone.
    Action { action_id: ActionId, action: Action, user_id: UserId, region: Region },
}
