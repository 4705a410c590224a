//! Engine configuration loader.
//!
//! Reads `switchyard.toml` into [`EngineConfig`]. A missing file is normal
//! and yields defaults; an unreadable or malformed one also yields defaults
//! but is logged at `warn`.

use std::path::Path;

use switchyard_types::config::EngineConfig;

pub const DEFAULT_CONFIG_FILE: &str = "switchyard.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub async fn load_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

pub async fn save_config(path: &Path, config: &EngineConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigError::Io {
                path: parent.display().to_string(),
                source,
            })?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join(DEFAULT_CONFIG_FILE)).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn partial_file_is_merged_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        tokio::fs::write(
            &path,
            r#"
max_in_flight = 3

[sandbox]
interpreter = "python3.12"

[storage]
database_path = "/var/lib/switchyard/runs.db"
"#,
        )
        .await
        .unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.max_in_flight, 3);
        assert_eq!(config.max_loop_iterations, 1000);
        assert_eq!(config.sandbox.interpreter, "python3.12");
        assert_eq!(config.sandbox.timeout_ms, 10_000);
        assert_eq!(
            config.storage.database_path.as_deref(),
            Some("/var/lib/switchyard/runs.db")
        );
    }

    #[tokio::test]
    async fn malformed_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        tokio::fs::write(&path, "max_in_flight = [not valid").await.unwrap();
        assert_eq!(load_config(&path).await, EngineConfig::default());
    }

    #[tokio::test]
    async fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join(DEFAULT_CONFIG_FILE);
        let mut config = EngineConfig::default();
        config.max_in_flight = 16;
        config.sandbox.timeout_ms = 2_500;

        save_config(&path, &config).await.unwrap();
        assert_eq!(load_config(&path).await, config);
    }
}
