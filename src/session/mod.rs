//! Session orchestration module
//!
//! Owns session and request state and drives streamed responses from the
//! engine to the connection gateway.

mod orchestrator;
mod request;

pub use orchestrator::*;
pub use request::*;
