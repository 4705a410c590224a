//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `switchyard.toml`. All fields have
//! defaults so a partial (or absent) file still yields a usable config.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of steps executing concurrently within one run.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Per-loop re-entry ceiling.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Step timeout when a step does not set its own.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_max_loop_iterations() -> u32 {
    1000
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_loop_iterations: default_max_loop_iterations(),
            default_step_timeout_ms: default_step_timeout_ms(),
            sandbox: SandboxConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Limits applied to user-authored code steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock timeout for a code step when it does not set its own.
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,

    /// Cap on captured subprocess stdout and on WASM output.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Interpreter used for out-of-process code steps.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Linear memory ceiling for in-process modules.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
}

fn default_sandbox_timeout_ms() -> u64 {
    10_000
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            interpreter: default_interpreter(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

/// Where run snapshots and checkpoints are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. In-memory stores are used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}
