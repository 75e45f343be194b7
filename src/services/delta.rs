//! Delta engine — per-tile image changes produced by one stroke action.
//!
//! DESIGN
//! ======
//! Compositing raster images is outside this server; the render loop only
//! needs two calls: cut a tile-scoped delta out of an action, and apply a
//! delta onto a base image. `DeltaEngine` is that seam.
//!
//! The bundled `VectorDeltas` engine keeps a tile image as an ordered JSON
//! list of stroke layers in tile-local coordinates. Applying a delta appends
//! one layer. Clients replay the layers to draw the tile. An empty image
//! decodes as a tile with no layers.

use serde::{Deserialize, Serialize};

use crate::geometry::TileLocation;
use crate::model::{Action, ActionId, ActionKind, TileImage};

#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("action {0} has no stroke to render")]
    NotAStroke(ActionId),
    #[error("stroke point outside the renderable range of tile {0}")]
    OutOfRange(TileLocation),
    #[error("tile image codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl crate::frame::ErrorCode for DeltaError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAStroke(_) => "E_NOT_A_STROKE",
            Self::OutOfRange(_) => "E_OUT_OF_RANGE",
            Self::Codec(_) => "E_CODEC",
        }
    }
}

/// Engine-encoded change to one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDelta(pub Vec<u8>);

pub trait DeltaEngine: Send + Sync {
    /// Restrict `action` to the tile at `location`.
    ///
    /// # Errors
    ///
    /// Fails if the action carries no stroke or cannot be expressed in tile space.
    fn tile_delta(&self, action_id: ActionId, action: &Action, location: &TileLocation)
    -> Result<TileDelta, DeltaError>;

    /// Composite `delta` onto `base`. A missing base is a blank tile.
    ///
    /// # Errors
    ///
    /// Fails if either input cannot be decoded.
    fn apply(&self, base: Option<&TileImage>, delta: &TileDelta) -> Result<TileImage, DeltaError>;

    /// MIME type of the images this engine produces.
    fn content_type(&self) -> &'static str;
}

// =============================================================================
// VECTOR LAYERS
// =============================================================================

/// One stroke, translated into the pixel space of a single tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub action_id: ActionId,
    pub tool: ActionKind,
    pub points: Vec<[i64; 2]>,
    pub width: u32,
    pub opacity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct VectorDeltas {
    tile_size: u32,
}

impl VectorDeltas {
    #[must_use]
    pub fn new(tile_size: u32) -> Self {
        Self { tile_size }
    }

    /// Decode a tile image into its layers.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the bytes are not a layer list.
    pub fn layers(image: &TileImage) -> Result<Vec<Layer>, DeltaError> {
        if image.0.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&image.0)?)
    }
}

impl DeltaEngine for VectorDeltas {
    fn tile_delta(
        &self,
        action_id: ActionId,
        action: &Action,
        location: &TileLocation,
    ) -> Result<TileDelta, DeltaError> {
        let stroke = action.stroke().ok_or(DeltaError::NotAStroke(action_id))?;
        let origin = location.origin(self.tile_size);

        let mut points = Vec::with_capacity(stroke.points.len());
        for point in &stroke.points {
            let x = i64::try_from(&point.x - &origin.x).map_err(|_| DeltaError::OutOfRange(location.clone()))?;
            let y = i64::try_from(&point.y - &origin.y).map_err(|_| DeltaError::OutOfRange(location.clone()))?;
            points.push([x, y]);
        }

        let layer = Layer {
            action_id,
            tool: action.kind(),
            points,
            width: stroke.width,
            opacity: stroke.opacity,
            color: stroke.color.clone(),
        };
        Ok(TileDelta(serde_json::to_vec(&layer)?))
    }

    fn apply(&self, base: Option<&TileImage>, delta: &TileDelta) -> Result<TileImage, DeltaError> {
        let mut layers = match base {
            Some(image) => Self::layers(image)?,
            None => Vec::new(),
        };
        layers.push(serde_json::from_slice(&delta.0)?);
        Ok(TileImage(serde_json::to_vec(&layers)?))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
