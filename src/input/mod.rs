//! Input injection: protocol parsing, X11 key/mouse/cursor, and clipboard
//! bridging.

pub mod clipboard;
pub mod cursor;
pub mod router;
