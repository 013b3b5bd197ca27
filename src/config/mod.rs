//! Configuration module
//!
//! Handles loading the manager configuration from a TOML file with CLI
//! overrides applied in `main`.

mod manager;

pub use manager::*;
