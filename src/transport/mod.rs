//! Wire framing for the reduced WebSocket transport mode.

pub mod ws_framer;
pub mod ws_session;
