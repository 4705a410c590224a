//! Registry of executing runs and their cancellation tokens.
//!
//! Shared by [`Engine`](crate::engine::Engine) and
//! [`RecoveryManager`](crate::recovery::RecoveryManager) so a run can be
//! cancelled by id whether it was started fresh or resumed.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `run_id` with a fresh token. `None` when the run is already
    /// executing.
    pub fn claim(&self, run_id: Uuid) -> Option<ActiveRun> {
        match self.tokens.entry(run_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(ActiveRun {
                    run_id,
                    token,
                    tokens: Arc::clone(&self.tokens),
                })
            }
        }
    }

    /// Fire the token of an executing run. Returns `false` if none is registered.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, run_id: Uuid) -> bool {
        self.tokens.contains_key(&run_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Registration of one executing run. Dropping it unregisters the run.
#[derive(Debug)]
pub struct ActiveRun {
    run_id: Uuid,
    token: CancellationToken,
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl ActiveRun {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.tokens.remove(&self.run_id);
    }
}
