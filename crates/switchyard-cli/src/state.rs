//! Wiring of the engine to its concrete stores.
//!
//! AppState pins the core engine to the SQLite stores, the environment
//! variable resolver and a registry holding the built-in steps plus the
//! sandboxed `code` step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use switchyard_core::checkpoint::CheckpointManager;
use switchyard_core::engine::Engine;
use switchyard_core::scheduler::{Scheduler, SchedulerLimits};
use switchyard_core::step::StepRegistry;
use switchyard_infra::config::load_config;
use switchyard_infra::sandbox::register_code_step;
use switchyard_infra::sqlite::pool::{database_url, default_database_path};
use switchyard_infra::sqlite::{DatabasePool, SqliteCheckpointStore, SqliteRunStore};
use switchyard_infra::variables::EnvVariables;
use switchyard_types::config::EngineConfig;

/// Built-in steps plus the `code` step configured from `config`.
pub fn build_registry(config: &EngineConfig) -> anyhow::Result<StepRegistry> {
    let mut registry = StepRegistry::with_builtins();
    register_code_step(&mut registry, &config.sandbox).context("failed to set up code sandbox")?;
    Ok(registry)
}

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub engine: Engine,
    pub database_path: PathBuf,
}

impl AppState {
    /// Load config, open the database and wire the engine.
    pub async fn init(config_path: &Path) -> anyhow::Result<Self> {
        let config = load_config(config_path).await;

        let database_path = config
            .storage
            .database_path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path);
        if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let db_url = database_url(&database_path.display().to_string());
        let pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {}", database_path.display()))?;
        tracing::debug!(path = %database_path.display(), "database ready");

        let registry = build_registry(&config)?;
        let checkpoints = CheckpointManager::new(Arc::new(SqliteCheckpointStore::new(pool.clone())));
        let scheduler = Scheduler::new(Arc::new(registry), checkpoints, Arc::new(EnvVariables::new()))
            .with_limits(SchedulerLimits::from_config(&config));
        let engine = Engine::new(scheduler, Arc::new(SqliteRunStore::new(pool)));

        Ok(Self {
            config,
            engine,
            database_path,
        })
    }
}
