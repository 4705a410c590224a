//! Shared domain types for Switchyard.
//!
//! Graphs, items, run state, step errors, checkpoints, trigger events and
//! engine configuration. Everything here is plain serde data.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod graph;
pub mod item;
pub mod run;
pub mod trigger;
