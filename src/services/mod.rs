//! Coordination services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own canvas semantics (history, rendering, broadcast and
//! the structures behind them) so route handlers stay focused on protocol
//! translation.

pub mod broadcast;
pub mod delta;
pub mod history;
pub mod jobs;
pub mod lock;
pub mod render;
pub mod viewport;
pub mod window_tree;
