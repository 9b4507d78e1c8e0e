//! Connection configuration for source and destination databases.
//!
//! Each database is described by a TOML file merged with environment-variable
//! overrides (prefix chosen per database, e.g. `AEGIS_SOURCE_HOST`). The
//! engine kind is a closed enum: a file naming an unknown engine fails to
//! deserialize, so there is no silent default.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Database engine family, selecting the logical-clock query dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Plain PostgreSQL: wall-clock-derived positions.
    Postgres,
    /// CockroachDB: cluster logical timestamp positions.
    Cockroach,
}

/// Connection settings for one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Engine family (`postgres` or `cockroach`).
    pub kind: EngineKind,
    /// Host name or address.
    pub host: String,
    /// TCP port (default: 5432).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password (optional; omit for trust/cert auth).
    #[serde(default)]
    pub password: Option<String>,
    /// Database name.
    pub database: String,
    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    4
}

impl StoreConfig {
    /// Loads a config from a TOML file, overlaid with `PREFIX_*` environment
    /// variables (e.g. `AEGIS_SOURCE_PASSWORD`).
    pub fn load(path: &Path, env_prefix: &str) -> Result<Self> {
        let merged = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix(env_prefix).try_parsing(true))
            .build()
            .map_err(|source| StoreError::ConfigLoad {
                path: path.to_path_buf(),
                source,
            })?;

        let cfg: Self = merged
            .try_deserialize()
            .map_err(|source| StoreError::ConfigLoad {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate(path)?;
        Ok(cfg)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.host.is_empty() || self.database.is_empty() || self.user.is_empty() {
            return Err(StoreError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: "host, user and database must be non-empty".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(StoreError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: "max_connections must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Stable identity string used to key mirror bookkeeping by destination.
    pub fn identity(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let file = write_config(
            r#"
            kind = "postgres"
            host = "db.example.com"
            user = "mirror"
            database = "aegis"
            "#,
        );

        let cfg = StoreConfig::load(file.path(), "AEGIS_TEST_NONE").unwrap();
        assert_eq!(cfg.kind, EngineKind::Postgres);
        assert_eq!(cfg.port, 5432);
        assert_eq!(cfg.max_connections, 4);
        assert_eq!(cfg.identity(), "db.example.com:5432/aegis");
    }

    #[test]
    fn unknown_engine_kind_is_fatal() {
        let file = write_config(
            r#"
            kind = "oracle"
            host = "db"
            user = "mirror"
            database = "aegis"
            "#,
        );

        let err = StoreConfig::load(file.path(), "AEGIS_TEST_NONE").unwrap_err();
        assert!(matches!(err, StoreError::ConfigLoad { .. }));
    }

    #[test]
    fn empty_host_is_rejected() {
        let file = write_config(
            r#"
            kind = "cockroach"
            host = ""
            user = "mirror"
            database = "aegis"
            "#,
        );

        let err = StoreConfig::load(file.path(), "AEGIS_TEST_NONE").unwrap_err();
        assert!(matches!(err, StoreError::ConfigInvalid { .. }));
    }
}
