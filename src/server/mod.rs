//! Connection gateway module
//!
//! Owns the WebSocket listener, the per-connection context, and the
//! tagged-JSON message protocol.

mod connection;
mod protocol;
mod websocket;

pub use connection::*;
pub use protocol::*;
pub use websocket::*;
