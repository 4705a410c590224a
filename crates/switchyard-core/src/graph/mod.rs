//! Graph validation and execution topology.
//!
//! - `validate` -- structural checks run once per trigger before scheduling
//! - `topology` -- Kahn ordering, forward/back-edge split, loop regions

pub mod topology;
pub mod validate;

pub use topology::Topology;
pub use validate::{ValidationResult, validate};
