//! Geometry — pixel points, tile addresses, windows and regions.
//!
//! DESIGN
//! ======
//! The plane is unbounded, so every coordinate is a `BigInt`. Tile addressing
//! uses floored division: pixel `-1` belongs to tile `-1`, not tile `0`, which
//! keeps tiles contiguous across the origin.
//!
//! On the wire every big integer is a decimal string. Plain JSON integers are
//! also accepted on input for convenience.

use std::fmt;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, Zero};
use serde::{Deserialize, Serialize};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    #[error("window must be at least 1x1 pixels (got {width}x{height})")]
    EmptyWindow { width: BigInt, height: BigInt },
    #[error("tile size must be positive")]
    ZeroTileSize,
}

// =============================================================================
// POINT / TILE LOCATION
// =============================================================================

/// A pixel coordinate on the infinite plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    #[serde(with = "bigint_string")]
    pub x: BigInt,
    #[serde(with = "bigint_string")]
    pub y: BigInt,
}

impl Point {
    pub fn new(x: impl Into<BigInt>, y: impl Into<BigInt>) -> Self {
        Self { x: x.into(), y: y.into() }
    }

    /// Tile containing this point.
    #[must_use]
    pub fn to_tile(&self, tile_size: u32) -> TileLocation {
        point_to_tile(self, tile_size)
    }
}

/// Address of one fixed-size tile. Ordered column-major, which is the
/// canonical order for region locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileLocation {
    #[serde(with = "bigint_string")]
    pub column: BigInt,
    #[serde(with = "bigint_string")]
    pub row: BigInt,
}

impl TileLocation {
    pub fn new(column: impl Into<BigInt>, row: impl Into<BigInt>) -> Self {
        Self { column: column.into(), row: row.into() }
    }

    /// Top-left pixel owned by this tile.
    #[must_use]
    pub fn origin(&self, tile_size: u32) -> Point {
        let size = BigInt::from(tile_size);
        Point { x: &self.column * &size, y: &self.row * &size }
    }
}

impl fmt::Display for TileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.column, self.row)
    }
}

/// Map a pixel to its tile, flooring toward negative infinity on each axis.
///
/// # Panics
///
/// Panics if `tile_size` is zero. Configuration rejects a zero tile size at load time.
#[must_use]
pub fn point_to_tile(point: &Point, tile_size: u32) -> TileLocation {
    assert!(tile_size > 0, "tile size must be positive");
    let size = BigInt::from(tile_size);
    TileLocation { column: floor_div(&point.x, &size), row: floor_div(&point.y, &size) }
}

fn floor_div(value: &BigInt, size: &BigInt) -> BigInt {
    if !value.is_negative() {
        return value / size;
    }
    let (quotient, remainder) = value.div_rem(size);
    if remainder.is_zero() { quotient } else { quotient - 1 }
}

// =============================================================================
// REGION
// =============================================================================

/// Ordered set of tile locations, column-major. Never contains duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(Vec<TileLocation>);

impl Region {
    /// All tiles intersecting the inclusive pixel rectangle `start..=end`.
    fn covering(start: &Point, end: &Point, tile_size: u32) -> Self {
        let first = point_to_tile(start, tile_size);
        let last = point_to_tile(end, tile_size);

        let mut tiles = Vec::new();
        let mut column = first.column.clone();
        while column <= last.column {
            let mut row = first.row.clone();
            while row <= last.row {
                tiles.push(TileLocation { column: column.clone(), row: row.clone() });
                row += 1;
            }
            column += 1;
        }
        Self(tiles)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TileLocation> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, location: &TileLocation) -> bool {
        self.0.contains(location)
    }
}

impl<'a> IntoIterator for &'a Region {
    type Item = &'a TileLocation;
    type IntoIter = std::slice::Iter<'a, TileLocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<TileLocation> for Region {
    fn from_iter<I: IntoIterator<Item = TileLocation>>(iter: I) -> Self {
        let mut tiles: Vec<TileLocation> = iter.into_iter().collect();
        tiles.sort();
        tiles.dedup();
        Self(tiles)
    }
}

// =============================================================================
// WINDOW
// =============================================================================

/// A viewer's visible rectangle. The region is computed once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub x: BigInt,
    pub y: BigInt,
    pub width: BigInt,
    pub height: BigInt,
    region: Region,
}

impl Window {
    /// Build a window and its covering region.
    ///
    /// # Errors
    ///
    /// Returns `EmptyWindow` if either dimension is below one pixel, or
    /// `ZeroTileSize` if `tile_size` is zero.
    pub fn new(x: BigInt, y: BigInt, width: BigInt, height: BigInt, tile_size: u32) -> Result<Self, GeometryError> {
        if tile_size == 0 {
            return Err(GeometryError::ZeroTileSize);
        }
        if width < BigInt::one() || height < BigInt::one() {
            return Err(GeometryError::EmptyWindow { width, height });
        }

        let start = Point { x: x.clone(), y: y.clone() };
        let end = Point { x: &x + &width - 1, y: &y + &height - 1 };
        let region = Region::covering(&start, &end, tile_size);
        Ok(Self { x, y, width, height, region })
    }

    #[must_use]
    pub fn region(&self) -> &Region {
        &self.region
    }
}

// =============================================================================
// BOUNDING BOX
// =============================================================================

/// Inclusive pixel bounds of a set of points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    /// Smallest box containing every point, or `None` for an empty set.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let mut bb = Self { min: first.clone(), max: first.clone() };
        for p in points {
            if p.x < bb.min.x {
                bb.min.x.clone_from(&p.x);
            }
            if p.y < bb.min.y {
                bb.min.y.clone_from(&p.y);
            }
            if p.x > bb.max.x {
                bb.max.x.clone_from(&p.x);
            }
            if p.y > bb.max.y {
                bb.max.y.clone_from(&p.y);
            }
        }
        Some(bb)
    }

    /// Grow the box by `margin` pixels on every side.
    pub fn extend(&mut self, margin: &BigInt) {
        self.min.x -= margin;
        self.min.y -= margin;
        self.max.x += margin;
        self.max.y += margin;
    }

    /// Width in pixels, both edges inclusive.
    #[must_use]
    pub fn width(&self) -> BigInt {
        &self.max.x - &self.min.x + 1
    }

    /// Height in pixels, both edges inclusive.
    #[must_use]
    pub fn height(&self) -> BigInt {
        &self.max.y - &self.min.y + 1
    }

    /// Tiles touched by this box.
    #[must_use]
    pub fn region(&self, tile_size: u32) -> Region {
        Region::covering(&self.min, &self.max, tile_size)
    }
}

// =============================================================================
// SERDE
// =============================================================================

/// Serialize `BigInt` as a decimal string; accept strings or JSON integers.
pub mod bigint_string {
    use std::fmt;

    use num_bigint::BigInt;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        deserializer.deserialize_any(BigIntVisitor)
    }

    struct BigIntVisitor;

    impl Visitor<'_> for BigIntVisitor {
        type Value = BigInt;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer or a decimal integer string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<BigInt, E> {
            Ok(BigInt::from(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<BigInt, E> {
            Ok(BigInt::from(v))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<BigInt, E> {
            v.trim()
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

#[cfg(test)]
#[path = "geometry_test.rs"]
mod tests;
