use anyhow::{Context, anyhow};
use folio_postgres::{DEFAULT_ADMIN_SCHEMA, PostgresStoreConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolioConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_admin_schema")]
    pub admin_schema: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub log_sql_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            admin_schema: default_admin_schema(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            statement_timeout_ms: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_sql_queries: false,
        }
    }
}

impl FolioConfig {
    /// Load from YAML, or TOML when the file ends in `.toml`
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("FOLIO_DATABASE_URL") {
            self.database.url = Some(val);
        }

        if let Ok(val) = std::env::var("FOLIO_ADMIN_SCHEMA") {
            self.database.admin_schema = val;
        }

        if let Ok(val) = std::env::var("FOLIO_MAX_CONNECTIONS") {
            match val.parse::<u32>() {
                Ok(max) => self.database.max_connections = max,
                Err(_) => eprintln!("Warning: Invalid FOLIO_MAX_CONNECTIONS '{}', ignoring", val),
            }
        }

        if let Ok(val) = std::env::var("FOLIO_STATEMENT_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.database.statement_timeout_ms = Some(ms),
                Err(_) => {
                    eprintln!("Warning: Invalid FOLIO_STATEMENT_TIMEOUT_MS '{}', ignoring", val)
                }
            }
        }

        if let Ok(val) = std::env::var("FOLIO_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("FOLIO_LOG_SQL") {
            if let Ok(enabled) = val.parse::<bool>() {
                self.logging.log_sql_queries = enabled;
            }
        }
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database.url.as_deref().ok_or_else(|| {
            anyhow!("No database URL configured: set database.url, FOLIO_DATABASE_URL or --database-url")
        })
    }

    pub fn store_config(&self) -> PostgresStoreConfig {
        let db = &self.database;
        let config = PostgresStoreConfig::default()
            .with_admin_schema(db.admin_schema.clone())
            .with_max_connections(db.max_connections)
            .with_min_connections(db.min_connections.min(db.max_connections))
            .with_acquire_timeout(Duration::from_secs(db.acquire_timeout_secs));

        match db.statement_timeout_ms {
            Some(ms) if ms > 0 => config.with_statement_timeout(Duration::from_millis(ms)),
            _ => config,
        }
    }
}

fn default_admin_schema() -> String {
    DEFAULT_ADMIN_SCHEMA.to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_VARS: &[&str] = &[
        "FOLIO_DATABASE_URL",
        "FOLIO_ADMIN_SCHEMA",
        "FOLIO_MAX_CONNECTIONS",
        "FOLIO_STATEMENT_TIMEOUT_MS",
        "FOLIO_LOG_LEVEL",
        "FOLIO_LOG_SQL",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            // SAFETY: env-mutating tests are serialized with #[serial]
            unsafe { std::env::remove_var(var) };
        }
    }

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = FolioConfig::default();
        assert!(config.database.url.is_none());
        assert_eq!(config.database.admin_schema, "folio_admin");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.log_sql_queries);
        assert!(config.database_url().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let file = write_config(
            ".yaml",
            "database:\n  url: postgres://localhost/folio\n  max_connections: 4\nlogging:\n  level: debug\n",
        );
        let config = FolioConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_url().unwrap(), "postgres://localhost/folio");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.admin_schema, "folio_admin");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_toml_file() {
        let file = write_config(
            ".toml",
            "[database]\nurl = \"postgres://db/folio\"\nadmin_schema = \"registry\"\nstatement_timeout_ms = 2500\n",
        );
        let config = FolioConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.admin_schema, "registry");

        let store = config.store_config();
        assert_eq!(store.admin_schema, "registry");
        assert_eq!(store.statement_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let file = write_config(".toml", "[database\n");
        let err = FolioConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    #[serial]
    fn test_merge_env_overrides_file_values() {
        clear_env();
        let mut config = FolioConfig::default();
        config.database.url = Some("postgres://file/folio".to_string());

        unsafe {
            std::env::set_var("FOLIO_DATABASE_URL", "postgres://env/folio");
            std::env::set_var("FOLIO_MAX_CONNECTIONS", "32");
            std::env::set_var("FOLIO_STATEMENT_TIMEOUT_MS", "1000");
            std::env::set_var("FOLIO_LOG_SQL", "true");
        }
        config.merge_env();
        clear_env();

        assert_eq!(config.database_url().unwrap(), "postgres://env/folio");
        assert_eq!(config.database.max_connections, 32);
        assert_eq!(config.database.statement_timeout_ms, Some(1000));
        assert!(config.logging.log_sql_queries);
    }

    #[test]
    #[serial]
    fn test_merge_env_ignores_unparseable_numbers() {
        clear_env();
        let mut config = FolioConfig::default();

        unsafe { std::env::set_var("FOLIO_MAX_CONNECTIONS", "many") };
        config.merge_env();
        clear_env();

        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn test_store_config_clamps_min_connections() {
        let mut config = FolioConfig::default();
        config.database.max_connections = 1;
        config.database.min_connections = 5;
        config.database.statement_timeout_ms = Some(0);

        let store = config.store_config();
        assert_eq!(store.min_connections, 1);
        assert!(store.statement_timeout.is_none());
        assert!(store.validate().is_ok());
    }
}
