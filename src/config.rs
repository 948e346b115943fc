use crate::constants::{
    CONFIG_PATH_ENV, DATABASE_PATH_ENV, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_CONFIG_PATH,
    DEFAULT_DATABASE_PATH, DEFAULT_LOG_DIR, LOG_DIR_ENV, METRICS_ADDR_ENV,
};
use crate::error::{IndexError, Result};
use crate::models::SourceDefinition;
use crate::registry::validate_definition;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

impl Config {
    /// Load `config.toml` (or the file named by `OCI_CONFIG`) and apply
    /// environment overrides. A missing default file yields the defaults; a
    /// missing file that was asked for explicitly is an error.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_with(explicit.as_deref(), |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with the config path and the environment
    /// supplied by the caller. Validation runs once, after overrides.
    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = explicit.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut config = if explicit.is_none() && !path.exists() {
            Config::default()
        } else {
            Self::parse_file(path)?
        };
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            IndexError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(DATABASE_PATH_ENV) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(addr) = lookup(METRICS_ADDR_ENV) {
            self.metrics.listen_addr = Some(addr);
        }
        if let Some(dir) = lookup(LOG_DIR_ENV) {
            self.logging.dir = PathBuf::from(dir);
        }
    }

    /// Source definitions are checked here, when configuration is loaded,
    /// rather than when a fetch is admitted.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for source in &self.sources {
            validate_definition(source)?;
            if !names.insert(source.name.as_str()) {
                return Err(IndexError::Config(format!(
                    "data source '{}' is defined more than once",
                    source.name
                )));
            }
        }
        self.metrics_addr()?;
        Ok(())
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics
            .listen_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>().map_err(|e| {
                    IndexError::Config(format!("invalid metrics listen_addr '{}': {}", addr, e))
                })
            })
            .transpose()
    }
}
