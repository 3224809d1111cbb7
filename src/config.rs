use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Runtime configuration, one field per key enumerated in the external
/// interfaces section. `Config::default()` reproduces the documented
/// defaults; `Config::load` overlays a YAML file onto those defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_file_path: String,
    pub blobs_directory: String,
    pub archivelog_directory: String,
    pub block_size: u32,
    pub cache_capacity: usize,
    pub max_redo_log_entries: usize,
    pub max_extents_per_segment: usize,
    pub extent_growth_table: f64,
    pub extent_growth_index: f64,
    pub extent_growth_transaction: f64,
    pub extent_growth_temp: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_file_path: "data.db".to_string(),
            blobs_directory: "blobs".to_string(),
            archivelog_directory: "archivelog".to_string(),
            block_size: 64 * 1024,
            cache_capacity: 256,
            max_redo_log_entries: 256,
            max_extents_per_segment: 16,
            extent_growth_table: 1.5,
            extent_growth_index: 1.5,
            extent_growth_transaction: 1.2,
            extent_growth_temp: 1.0,
        }
    }
}

/// Mirror of `Config` with every field optional, the shape a YAML file is
/// deserialized into before being overlaid onto the defaults. A config file
/// only needs to name the keys it wants to override.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    database_file_path: Option<String>,
    blobs_directory: Option<String>,
    archivelog_directory: Option<String>,
    block_size: Option<u32>,
    cache_capacity: Option<usize>,
    max_redo_log_entries: Option<usize>,
    max_extents_per_segment: Option<usize>,
    extent_growth_table: Option<f64>,
    extent_growth_index: Option<f64>,
    extent_growth_transaction: Option<f64>,
    extent_growth_temp: Option<f64>,
}

impl Config {
    /// Loads configuration from a YAML file at `path`, overlaying any keys
    /// present onto `Config::default()`. A missing file is not an error —
    /// the defaults are returned unchanged. An existing file that fails to
    /// parse is `Error::InvalidArgument`.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = Config::default();

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                return Ok(config);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let file: ConfigFile = serde_yaml::from_str(&text)
            .map_err(|e| Error::InvalidArgument(format!("malformed config at {}: {}", path.display(), e)))?;

        if let Some(v) = file.database_file_path { config.database_file_path = v; }
        if let Some(v) = file.blobs_directory { config.blobs_directory = v; }
        if let Some(v) = file.archivelog_directory { config.archivelog_directory = v; }
        if let Some(v) = file.block_size { config.block_size = v; }
        if let Some(v) = file.cache_capacity { config.cache_capacity = v; }
        if let Some(v) = file.max_redo_log_entries { config.max_redo_log_entries = v; }
        if let Some(v) = file.max_extents_per_segment { config.max_extents_per_segment = v; }
        if let Some(v) = file.extent_growth_table { config.extent_growth_table = v; }
        if let Some(v) = file.extent_growth_index { config.extent_growth_index = v; }
        if let Some(v) = file.extent_growth_transaction { config.extent_growth_transaction = v; }
        if let Some(v) = file.extent_growth_temp { config.extent_growth_temp = v; }

        tracing::debug!(path = %path.display(), "loaded config overrides");
        Ok(config)
    }

    pub fn growth_factor(&self, kind: crate::storage::extent::SegmentKind) -> f64 {
        use crate::storage::extent::SegmentKind::*;
        match kind {
            SystemTable | Table => self.extent_growth_table,
            Index => self.extent_growth_index,
            Transaction => self.extent_growth_transaction,
            Temp => self.extent_growth_temp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let config = Config::default();
        assert_eq!(config.database_file_path, "data.db");
        assert_eq!(config.block_size, 64 * 1024);
        assert_eq!(config.cache_capacity, 256);
        assert_eq!(config.max_redo_log_entries, 256);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("flintbase-config-test-missing.yaml");
        let _ = std::fs::remove_file(&path);
        let config = Config::load(&path).expect("missing file is not an error");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn present_file_overlays_defaults() {
        let path = std::env::temp_dir().join("flintbase-config-test-present.yaml");
        std::fs::write(&path, "cache_capacity: 64\nblock_size: 8192\n").unwrap();
        let config = Config::load(&path).expect("valid yaml should load");
        assert_eq!(config.cache_capacity, 64);
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.database_file_path, "data.db");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_file_is_invalid_argument() {
        let path = std::env::temp_dir().join("flintbase-config-test-malformed.yaml");
        std::fs::write(&path, "cache_capacity: [this is not a number\n").unwrap();
        let result = Config::load(&path);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let _ = std::fs::remove_file(&path);
    }
}
