use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub type SourceId = i64;
pub type RunId = i64;

/// A configured external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: SourceId,
    pub name: String,
    pub kind: Option<String>,
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub enabled: bool,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An authentication token owned by one data source.
///
/// The secret never leaves the process through `Debug` or `Serialize`; use
/// [`Credential::fingerprint`] to identify it in logs.
#[derive(Clone, PartialEq, Serialize)]
pub struct Credential {
    pub id: i64,
    pub data_source_id: SourceId,
    pub kind: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// A credential without an expiry never expires; otherwise it is expired
    /// from its expiry instant onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("data_source_id", &self.data_source_id)
            .field("kind", &self.kind)
            .field("fingerprint", &self.fingerprint())
            .field("expires_at", &self.expires_at)
            .field("rotated_at", &self.rotated_at)
            .finish()
    }
}

/// Short SHA-256 prefix of a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}

/// A trailing-window call quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub id: i64,
    pub data_source_id: SourceId,
    pub window_seconds: i64,
    pub max_calls: i64,
    // Hints for the transport layer; admission ignores them.
    pub burst: Option<i64>,
    pub retry_delay_seconds: Option<i64>,
    pub max_retries: Option<i64>,
    pub backoff_multiplier: Option<f64>,
}

impl RateLimit {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }

    /// Earliest start instant that still falls inside the window ending at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window()
    }

    pub fn is_exhausted_by(&self, started_in_window: u64) -> bool {
        let max_calls = u64::try_from(self.max_calls).unwrap_or(0);
        started_in_window >= max_calls
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshPolicy {
    pub id: i64,
    pub data_source_id: SourceId,
    pub default_refresh_interval_minutes: Option<i64>,
    pub max_record_age_days: Option<i64>,
    pub incremental_cursor_field: Option<String>,
    pub supports_webhook: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: i64,
    pub data_source_id: SourceId,
    pub capability: String,
    pub endpoint_path: Option<String>,
    pub payload_mapping: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Started)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown run status '{0}'")]
pub struct ParseRunStatusError(String);

impl FromStr for RunStatus {
    type Err = ParseRunStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ParseRunStatusError(other.to_string())),
        }
    }
}

/// One admitted fetch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub data_source_id: SourceId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub items_fetched: Option<i64>,
    pub items_processed: Option<i64>,
}

impl Run {
    pub fn duration(&self) -> Duration {
        match self.completed_at {
            Some(completed_at) => completed_at - self.started_at,
            None => Duration::zero(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == RunStatus::Started
    }
}

/// Terminal result reported by the transport layer for an open run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
    pub items_fetched: Option<i64>,
    pub items_processed: Option<i64>,
}

impl RunOutcome {
    pub fn success(
        completed_at: DateTime<Utc>,
        items_fetched: Option<i64>,
        items_processed: Option<i64>,
    ) -> Self {
        Self {
            status: RunStatus::Success,
            completed_at,
            error: None,
            items_fetched,
            items_processed,
        }
    }

    pub fn failed(completed_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            completed_at,
            error: Some(error.into()),
            items_fetched: None,
            items_processed: None,
        }
    }
}

// Configuration-shaped definitions, as read from `[[sources]]` in config.toml.

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limits: Vec<NewRateLimit>,
    #[serde(default)]
    pub credentials: Vec<NewCredential>,
    #[serde(default)]
    pub refresh_policy: Option<NewRefreshPolicy>,
    #[serde(default)]
    pub capabilities: Vec<NewCapability>,
}

impl SourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            base_url: None,
            user_agent: None,
            enabled: true,
            rate_limits: Vec::new(),
            credentials: Vec::new(),
            refresh_policy: None,
            capabilities: Vec::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_rate_limit(mut self, window_seconds: i64, max_calls: i64) -> Self {
        self.rate_limits.push(NewRateLimit::new(window_seconds, max_calls));
        self
    }

    pub fn with_credential(mut self, credential: NewCredential) -> Self {
        self.credentials.push(credential);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewRateLimit {
    pub window_seconds: i64,
    pub max_calls: i64,
    #[serde(default)]
    pub burst: Option<i64>,
    #[serde(default)]
    pub retry_delay_seconds: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
}

impl NewRateLimit {
    pub fn new(window_seconds: i64, max_calls: i64) -> Self {
        Self {
            window_seconds,
            max_calls,
            burst: None,
            retry_delay_seconds: None,
            max_retries: None,
            backoff_multiplier: None,
        }
    }
}

#[derive(Clone, PartialEq, Deserialize)]
pub struct NewCredential {
    pub kind: String,
    pub token: String,
    #[serde(default, deserialize_with = "deserialize_utc_opt")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_utc_opt")]
    pub rotated_at: Option<DateTime<Utc>>,
}

impl NewCredential {
    pub fn new(kind: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            token: token.into(),
            expires_at: None,
            rotated_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

impl fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredential")
            .field("kind", &self.kind)
            .field("fingerprint", &fingerprint(&self.token))
            .field("expires_at", &self.expires_at)
            .field("rotated_at", &self.rotated_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct NewRefreshPolicy {
    #[serde(default)]
    pub default_refresh_interval_minutes: Option<i64>,
    #[serde(default)]
    pub max_record_age_days: Option<i64>,
    #[serde(default)]
    pub incremental_cursor_field: Option<String>,
    #[serde(default)]
    pub supports_webhook: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewCapability {
    pub capability: String,
    #[serde(default)]
    pub endpoint_path: Option<String>,
    #[serde(default)]
    pub payload_mapping: Option<serde_json::Value>,
}

impl NewCapability {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            endpoint_path: None,
            payload_mapping: None,
        }
    }
}

/// Parses an instant from configuration. Values without an offset are taken as UTC.
pub fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_utc_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(value) => parse_utc(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", value))),
    }
}
