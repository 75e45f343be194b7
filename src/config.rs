//! Canvas configuration parsed from environment variables.
//!
//! Every knob has a default so the server starts with an empty environment.
//! Unparseable values fall back to the default rather than aborting start-up.

use std::time::Duration;

pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_MAX_STROKE_SIZE: u64 = 4096;
pub const DEFAULT_MAX_WINDOW_SIZE: u64 = 8192;
pub const DEFAULT_UPDATE_FLUSH_INTERVAL_MS: u64 = 200;
pub const DEFAULT_UPDATE_MAX_AGE_MS: u64 = 500;
pub const DEFAULT_RENDER_RETRY_BASE_MS: u64 = 50;
pub const DEFAULT_RENDER_RETRY_MAX_MS: u64 = 5000;
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasConfig {
    /// Tile edge length in pixels.
    pub tile_size: u32,
    /// Maximum extent, per axis, of a stroke's expanded bounding box.
    pub max_stroke_size: u64,
    /// Maximum width or height accepted for a viewer window.
    pub max_window_size: u64,
    /// How often the update broadcaster scans pending batches.
    pub update_flush_interval: Duration,
    /// A batch is flushed once it is strictly older than this.
    pub update_max_age: Duration,
    /// First delay after a failed render step; doubles per consecutive failure.
    pub render_retry_base: Duration,
    /// Ceiling for the render retry delay.
    pub render_retry_max: Duration,
    /// Outbound frame channel capacity per websocket session.
    pub session_queue_capacity: usize,
}

impl CanvasConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `TILE_SIZE`: default 256 (zero is replaced by the default)
    /// - `ACTION_MAX_STROKE_SIZE`: default 4096
    /// - `WINDOW_MAX_SIZE`: default 8192
    /// - `UPDATE_FLUSH_INTERVAL_MS`: default 200
    /// - `UPDATE_MAX_AGE_MS`: default 500
    /// - `RENDER_RETRY_BASE_MS`: default 50
    /// - `RENDER_RETRY_MAX_MS`: default 5000
    /// - `SESSION_QUEUE_CAPACITY`: default 256
    #[must_use]
    pub fn from_env() -> Self {
        let tile_size = match env_parse("TILE_SIZE", DEFAULT_TILE_SIZE) {
            0 => DEFAULT_TILE_SIZE,
            size => size,
        };
        Self {
            tile_size,
            max_stroke_size: env_parse("ACTION_MAX_STROKE_SIZE", DEFAULT_MAX_STROKE_SIZE),
            max_window_size: env_parse("WINDOW_MAX_SIZE", DEFAULT_MAX_WINDOW_SIZE),
            update_flush_interval: Duration::from_millis(env_parse(
                "UPDATE_FLUSH_INTERVAL_MS",
                DEFAULT_UPDATE_FLUSH_INTERVAL_MS,
            )),
            update_max_age: Duration::from_millis(env_parse("UPDATE_MAX_AGE_MS", DEFAULT_UPDATE_MAX_AGE_MS)),
            render_retry_base: Duration::from_millis(env_parse("RENDER_RETRY_BASE_MS", DEFAULT_RENDER_RETRY_BASE_MS)),
            render_retry_max: Duration::from_millis(env_parse("RENDER_RETRY_MAX_MS", DEFAULT_RENDER_RETRY_MAX_MS)),
            session_queue_capacity: env_parse("SESSION_QUEUE_CAPACITY", DEFAULT_SESSION_QUEUE_CAPACITY).max(1),
        }
    }
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            max_stroke_size: DEFAULT_MAX_STROKE_SIZE,
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
            update_flush_interval: Duration::from_millis(DEFAULT_UPDATE_FLUSH_INTERVAL_MS),
            update_max_age: Duration::from_millis(DEFAULT_UPDATE_MAX_AGE_MS),
            render_retry_base: Duration::from_millis(DEFAULT_RENDER_RETRY_BASE_MS),
            render_retry_max: Duration::from_millis(DEFAULT_RENDER_RETRY_MAX_MS),
            session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_missing_returns_default() {
        let val: u64 = env_parse("__BIGCANVAS_TEST_MISSING__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn env_parse_present_valid() {
        unsafe { std::env::set_var("__BIGCANVAS_TEST_VALID__", "99") };
        let val: usize = env_parse("__BIGCANVAS_TEST_VALID__", 0);
        assert_eq!(val, 99);
        unsafe { std::env::remove_var("__BIGCANVAS_TEST_VALID__") };
    }

    #[test]
    fn env_parse_present_invalid_returns_default() {
        unsafe { std::env::set_var("__BIGCANVAS_TEST_INVALID__", "lots") };
        let val: u32 = env_parse("__BIGCANVAS_TEST_INVALID__", 7);
        assert_eq!(val, 7);
        unsafe { std::env::remove_var("__BIGCANVAS_TEST_INVALID__") };
    }

    #[test]
    fn defaults_match_constants() {
        let config = CanvasConfig::default();
        assert_eq!(config.tile_size, DEFAULT_TILE_SIZE);
        assert_eq!(config.max_stroke_size, DEFAULT_MAX_STROKE_SIZE);
        assert_eq!(config.update_flush_interval, Duration::from_millis(200));
        assert_eq!(config.update_max_age, Duration::from_millis(500));
    }
}
