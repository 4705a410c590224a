//! Infrastructure layer for Switchyard.
//!
//! Implements the ports defined in `switchyard-core`: SQLite-backed
//! checkpoint and run stores, the `code` step with its two sandbox
//! strategies (in-process WASM and an out-of-process interpreter), an
//! environment-backed variable resolver and the TOML config loader.

pub mod config;
pub mod sandbox;
pub mod sqlite;
pub mod variables;
