/// Names of the data sources shipped with the default configuration.
pub const TMDB_SOURCE: &str = "tmdb";
pub const WIKIDATA_SOURCE: &str = "wikidata";

// Environment overrides
pub const CONFIG_PATH_ENV: &str = "OCI_CONFIG";
pub const DATABASE_PATH_ENV: &str = "OCI_DATABASE_PATH";
pub const METRICS_ADDR_ENV: &str = "OCI_METRICS_ADDR";
pub const LOG_DIR_ENV: &str = "OCI_LOG_DIR";

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_DATABASE_PATH: &str = "data/open_cinema_index.db";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Longest trailing window a rate limit may declare (one leap year).
pub const MAX_WINDOW_SECONDS: i64 = 366 * 24 * 60 * 60;

/// Retry hints applied to the built-in sources' rate limits.
pub const DEFAULT_MAX_RETRIES: i64 = 3;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

