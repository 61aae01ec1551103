use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use preagg_core::{PreaggError, PreaggResult};

const DEFAULT_CONFIG_NAME: &str = "preagg.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreaggConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    /// A computation counts as alive while its last heartbeat is at most
    /// this many seconds old.
    pub liveness_window_secs: Option<u64>,
}

impl PreaggConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            liveness_window_secs: None,
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> PreaggResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| PreaggError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| PreaggError::storage(format!("read config: {err}")))?;
            let config: PreaggConfig = serde_json::from_str(&raw)
                .map_err(|err| PreaggError::configuration(err.to_string()))?;
            return Ok(config);
        }
        let default = PreaggConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| PreaggError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| PreaggError::storage(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> PreaggResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| "preagg.sqlite".to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(PreaggError::configuration("config is not sqlite backend")),
        }
    }

    pub fn connection_url(&self) -> Option<&str> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => None,
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Some(url.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PreaggConfig;

    #[test]
    fn sqlite_config_resolves_relative_paths() {
        let config = PreaggConfig::default_sqlite("jobs.sqlite");
        let resolved = config.sqlite_path(std::path::Path::new("/data")).unwrap();
        assert_eq!(resolved, std::path::PathBuf::from("/data/jobs.sqlite"));
    }

    #[test]
    fn non_sqlite_config_has_a_url() {
        let raw = r#"{"database":{"backend":"postgres","url":"postgres://db/preagg"},"pool":null,"liveness_window_secs":30}"#;
        let config: PreaggConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.connection_url(), Some("postgres://db/preagg"));
        assert!(config.sqlite_path(std::path::Path::new("/")).is_err());
    }
}
