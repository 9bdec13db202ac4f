//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Named databases the LMDB binding needs: the catalog, the commits table
/// with its two secondary orderings, and the snapshots table.
pub const MIN_LMDB_TABLES: u32 = 5;

/// Which storage binding backs the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-local, non-durable storage
    Memory,
    /// Memory-mapped LMDB environment on local disk
    Lmdb {
        path: PathBuf,
        map_size_mb: usize,
        #[serde(default = "default_max_tables")]
        max_tables: u32,
    },
}

fn default_max_tables() -> u32 {
    16
}

/// Master configuration for an event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Table holding commits
    pub commits_table: String,
    /// Table holding snapshots
    pub snapshots_table: String,
    /// Items requested per backend query while iterating commits
    pub page_size: usize,
    pub backend: BackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            commits_table: "commits".to_string(),
            snapshots_table: "snapshots".to_string(),
            page_size: 100,
            backend: BackendConfig::Memory,
        }
    }
}

impl StoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&source)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("commits_table", &self.commits_table),
            ("snapshots_table", &self.snapshots_table),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.clone(),
                    reason: "table name must not be empty".to_string(),
                });
            }
        }

        if self.commits_table == self.snapshots_table {
            return Err(ConfigError::InvalidValue {
                field: "snapshots_table".to_string(),
                value: self.snapshots_table.clone(),
                reason: "must differ from commits_table".to_string(),
            });
        }

        if self.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "page_size".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if let BackendConfig::Lmdb {
            map_size_mb,
            max_tables,
            ..
        } = &self.backend
        {
            if *map_size_mb == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "backend.map_size_mb".to_string(),
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            if map_size_mb.checked_mul(1024 * 1024).is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "backend.map_size_mb".to_string(),
                    value: map_size_mb.to_string(),
                    reason: "exceeds the addressable map size".to_string(),
                });
            }
            if *max_tables < MIN_LMDB_TABLES {
                return Err(ConfigError::InvalidValue {
                    field: "backend.max_tables".to_string(),
                    value: max_tables.to_string(),
                    reason: format!("must be at least {}", MIN_LMDB_TABLES),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.commits_table, "commits");
        assert_eq!(config.backend, BackendConfig::Memory);
    }

    #[test]
    fn test_parse_lmdb_config() {
        let config = StoreConfig::from_toml_str(
            r#"
            commits_table = "orders_commits"
            snapshots_table = "orders_snapshots"
            page_size = 25

            [backend]
            kind = "lmdb"
            path = "/var/lib/keel"
            map_size_mb = 256
            "#,
        )
        .unwrap();

        assert_eq!(config.page_size, 25);
        assert_eq!(
            config.backend,
            BackendConfig::Lmdb {
                path: PathBuf::from("/var/lib/keel"),
                map_size_mb: 256,
                max_tables: 16,
            }
        );
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let config = StoreConfig::from_toml_str("page_size = 10").unwrap();
        assert_eq!(config.commits_table, "commits");
        assert_eq!(config.snapshots_table, "snapshots");
        assert_eq!(config.page_size, 10);
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let err = StoreConfig::from_toml_str("page_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "page_size"));
    }

    #[test]
    fn test_rejects_shared_table_name() {
        let config = StoreConfig {
            snapshots_table: "commits".to_string(),
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_overflowing_map_size() {
        let config = StoreConfig {
            backend: BackendConfig::Lmdb {
                path: PathBuf::from("/tmp/keel"),
                map_size_mb: usize::MAX,
                max_tables: 8,
            },
            ..StoreConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "backend.map_size_mb")
        );
    }

    #[test]
    fn test_rejects_too_few_lmdb_tables() {
        let config = StoreConfig {
            backend: BackendConfig::Lmdb {
                path: PathBuf::from("/tmp/keel"),
                map_size_mb: 64,
                max_tables: 2,
            },
            ..StoreConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_tables"));
    }

    #[test]
    fn test_parse_error() {
        let err = StoreConfig::from_toml_str("page_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "commits_table = \"c\"\nsnapshots_table = \"s\"").unwrap();
        let config = StoreConfig::from_path(file.path()).unwrap();
        assert_eq!(config.commits_table, "c");

        let err = StoreConfig::from_path("/nonexistent/keel.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
