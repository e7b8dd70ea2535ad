use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Configuration for the daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Pipeline description to load
    pub pipeline: PathBuf,
    /// Stop after this long; run until Ctrl-C when absent
    pub run_duration_ms: Option<u64>,
    /// Output capacity of built-in producing stages without an explicit one
    pub default_capacity: usize,
    /// Tracing filter used when `RUST_LOG` is not set
    pub log_filter: String,
    /// Where `csv_sink` records when its `path` param is absent
    pub recordings_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pipeline: PathBuf::from("pipelines/default.yaml"),
            run_duration_ms: None,
            default_capacity: slotline::DEFAULT_CAPACITY,
            log_filter: "slotline=info,slotline_daemon=info".to_string(),
            recordings_dir: PathBuf::from("./recordings"),
        }
    }
}

/// Outcome of [`load_config`], so the caller can log it once tracing is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Defaults,
}

/// Load daemon configuration from file or fall back to defaults if not found
pub fn load_config(path: &Path) -> Result<(DaemonConfig, ConfigSource)> {
    if !path.exists() {
        return Ok((DaemonConfig::default(), ConfigSource::Defaults));
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read configuration file at '{}'", path.display()))?;
    let config: DaemonConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Could not parse configuration file at '{}'", path.display()))?;
    config.validate()?;
    Ok((config, ConfigSource::File))
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 {
            anyhow::bail!("default_capacity must be at least 1");
        }
        Ok(())
    }

    pub fn log_source(&self, source: ConfigSource, path: &Path) {
        match source {
            ConfigSource::File => info!("Loaded configuration from {}", path.display()),
            ConfigSource::Defaults => info!(
                "No configuration at {}, using defaults",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, source) = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(source, ConfigSource::Defaults);
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "run_duration_ms": 250, "default_capacity": 4 }"#).unwrap();

        let (config, source) = load_config(&path).unwrap();
        assert_eq!(source, ConfigSource::File);
        assert_eq!(config.run_duration_ms, Some(250));
        assert_eq!(config.default_capacity, 4);
        assert_eq!(config.pipeline, DaemonConfig::default().pipeline);
    }

    #[test]
    fn test_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Could not parse"), "{:#}", err);

        std::fs::write(&path, r#"{ "batch_size": 32 }"#).unwrap();
        assert!(load_config(&path).is_err());

        std::fs::write(&path, r#"{ "default_capacity": 0 }"#).unwrap();
        assert!(load_config(&path).is_err());
    }
}
