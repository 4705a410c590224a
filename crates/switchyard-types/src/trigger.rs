//! Trigger events: what an external transport hands the engine to start a run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::Item;

/// Which transport produced the event. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Manual,
    Webhook,
    Schedule,
    Polling,
}

/// Seed data and routing for a new run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub run_id: Uuid,
    #[serde(default)]
    pub seed_items: Vec<Item>,
    /// Begin from this step only; steps not reachable from it are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step_id: Option<String>,
    pub mode: TriggerMode,
}

impl TriggerEvent {
    pub fn new(mode: TriggerMode, seed_items: Vec<Item>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            seed_items,
            start_step_id: None,
            mode,
        }
    }

    pub fn manual(seed_items: Vec<Item>) -> Self {
        Self::new(TriggerMode::Manual, seed_items)
    }

    pub fn starting_at(mut self, step_id: impl Into<String>) -> Self {
        self.start_step_id = Some(step_id.into());
        self
    }
}
