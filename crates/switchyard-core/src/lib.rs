//! Execution engine for Switchyard graphs.
//!
//! This crate holds the engine logic and the storage "ports" (traits) that
//! `switchyard-infra` implements. It depends only on `switchyard-types`,
//! never on a database or process crate.
//!
//! - `graph` -- validation and topology (Kahn order, loop regions)
//! - `step` -- step runtime protocol, registry, execution context, built-in steps
//! - `scheduler` -- work-queue execution of one run
//! - `checkpoint` / `run_store` -- storage ports with in-memory adapters
//! - `recovery` -- failure analysis and resume
//! - `engine` -- trigger activation facade (`start_run`, `cancel_run`)
//! - `active` -- registry of executing runs shared by engine and recovery

pub mod active;
pub mod checkpoint;
pub mod deadline;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod recovery;
pub mod retry;
pub mod run_store;
pub mod scheduler;
pub mod step;
pub mod variables;
