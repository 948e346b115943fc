//! Collaborator contracts the admission core reads from and writes to.
//!
//! Each leaf component (source registry, credential store, rate-limit policy
//! set, run ledger) is its own trait so callers can depend on the narrowest
//! surface. [`AdmissionStore`] bundles all four for the orchestrator.

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{
    Capability, Credential, DataSource, NewCredential, NewRateLimit, RateLimit, RefreshPolicy,
    Run, RunId, RunOutcome, SourceDefinition, SourceId,
};
use chrono::{DateTime, Utc};

/// Durable catalog of configured data sources.
pub trait SourceRegistry: Send + Sync {
    fn find_source(&self, name: &str) -> Result<Option<DataSource>>;
    fn list_sources(&self) -> Result<Vec<DataSource>>;

    /// Insert a source and everything it owns in one step. Fails with
    /// `Constraint` if the name is taken.
    fn install_source(&self, definition: &SourceDefinition) -> Result<DataSource>;
    fn set_source_enabled(&self, name: &str, enabled: bool) -> Result<DataSource>;
    /// Removes the source together with its limits, credentials, policy,
    /// capabilities and runs.
    fn delete_source(&self, source_id: SourceId) -> Result<()>;

    fn refresh_policy_for(&self, source_id: SourceId) -> Result<Option<RefreshPolicy>>;
    fn capabilities_for(&self, source_id: SourceId) -> Result<Vec<Capability>>;
}

/// Per-source authentication tokens. Read-only to admission; rotation tooling
/// adds and removes entries.
pub trait CredentialStore: Send + Sync {
    fn credentials_for(&self, source_id: SourceId) -> Result<Vec<Credential>>;
    fn add_credential(&self, source_id: SourceId, credential: &NewCredential) -> Result<Credential>;
    fn remove_credential(&self, credential_id: i64) -> Result<()>;
}

pub trait RateLimitPolicies: Send + Sync {
    fn rate_limits_for(&self, source_id: SourceId) -> Result<Vec<RateLimit>>;
    fn add_rate_limit(&self, source_id: SourceId, limit: &NewRateLimit) -> Result<RateLimit>;
}

/// Append-mostly history of fetch attempts.
pub trait RunLedger: Send + Sync {
    /// Number of runs for the source whose start instant is at or after `since`.
    fn count_runs_since(&self, source_id: SourceId, since: DateTime<Utc>) -> Result<u64>;

    /// Record a new `started` run and stamp the source's last-run start.
    fn open_run(&self, source_id: SourceId, started_at: DateTime<Utc>) -> Result<Run>;

    /// Count every window and open a run only if none is exhausted, as one
    /// atomic step against the ledger. Other handles on the same ledger see
    /// either all of it or none of it.
    fn open_run_within_limits(
        &self,
        source_id: SourceId,
        limits: &[RateLimit],
        started_at: DateTime<Utc>,
    ) -> Result<RunAdmission>;

    /// Move an open run to its terminal status. Used by the transport layer.
    fn complete_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<Run>;

    fn get_run(&self, run_id: RunId) -> Result<Option<Run>>;
    /// Most recent first.
    fn recent_runs(&self, source_id: SourceId, limit: usize) -> Result<Vec<Run>>;
}

/// Result of [`RunLedger::open_run_within_limits`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunAdmission {
    Opened(Run),
    /// The first window (shortest first) with no room left. Nothing was written.
    Exhausted { limit: RateLimit, observed: u64 },
}

/// First limit whose window already holds `max_calls` runs, if any.
pub(crate) fn first_exhausted<F>(
    limits: &[RateLimit],
    started_at: DateTime<Utc>,
    mut count_since: F,
) -> Result<Option<(RateLimit, u64)>>
where
    F: FnMut(DateTime<Utc>) -> Result<u64>,
{
    for limit in limits {
        let observed = count_since(limit.window_start(started_at))?;
        if limit.is_exhausted_by(observed) {
            return Ok(Some((limit.clone(), observed)));
        }
    }
    Ok(None)
}

pub trait AdmissionStore: SourceRegistry + CredentialStore + RateLimitPolicies + RunLedger {}

impl<T> AdmissionStore for T where
    T: SourceRegistry + CredentialStore + RateLimitPolicies + RunLedger + ?Sized
{
}

/// Checks shared by every store before a run leaves `started`.
pub(crate) fn check_completion(run: &Run, outcome: &RunOutcome) -> Result<()> {
    use crate::error::IndexError;

    if run.status.is_terminal() {
        return Err(IndexError::InvalidRun(format!(
            "run {} is already {}",
            run.id, run.status
        )));
    }
    if !outcome.status.is_terminal() {
        return Err(IndexError::InvalidRun(format!(
            "run {} cannot be completed with status {}",
            run.id, outcome.status
        )));
    }
    if outcome.completed_at < run.started_at {
        return Err(IndexError::InvalidRun(format!(
            "run {} cannot complete at {} before it started at {}",
            run.id, outcome.completed_at, run.started_at
        )));
    }
    Ok(())
}
