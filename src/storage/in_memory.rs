use super::{
    check_completion, first_exhausted, CredentialStore, RateLimitPolicies, RunAdmission, RunLedger,
    SourceRegistry,
};
use crate::error::{IndexError, Result};
use crate::models::{
    Capability, Credential, DataSource, NewCapability, NewCredential, NewRateLimit, RateLimit,
    RefreshPolicy, Run, RunId, RunOutcome, RunStatus, SourceDefinition, SourceId,
};
use crate::registry::{validate_credential, validate_definition, validate_rate_limit};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// In-memory storage implementation for development/testing.
///
/// Enforces the same uniqueness and ownership rules as the SQLite schema.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    sources: Vec<DataSource>,
    credentials: Vec<Credential>,
    rate_limits: Vec<RateLimit>,
    refresh_policies: Vec<RefreshPolicy>,
    capabilities: Vec<Capability>,
    runs: Vec<Run>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn source_mut(&mut self, source_id: SourceId) -> Result<&mut DataSource> {
        self.sources
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or_else(|| IndexError::Constraint(format!("data source {} does not exist", source_id)))
    }

    fn count_runs_since(&self, source_id: SourceId, since: DateTime<Utc>) -> u64 {
        self.runs
            .iter()
            .filter(|r| r.data_source_id == source_id && r.started_at >= since)
            .count() as u64
    }

    fn push_run(&mut self, source_id: SourceId, started_at: DateTime<Utc>) -> Result<Run> {
        let source = self.source_mut(source_id)?;
        source.last_run_started_at = Some(started_at);
        source.updated_at = Utc::now();

        let run = Run {
            id: self.allocate_id(),
            data_source_id: source_id,
            started_at,
            completed_at: None,
            status: RunStatus::Started,
            error: None,
            items_fetched: None,
            items_processed: None,
        };
        self.runs.push(run.clone());
        Ok(run)
    }

    fn push_rate_limit(&mut self, source_id: SourceId, limit: &NewRateLimit) -> Result<RateLimit> {
        self.source_mut(source_id)?;
        if self
            .rate_limits
            .iter()
            .any(|l| l.data_source_id == source_id && l.window_seconds == limit.window_seconds)
        {
            return Err(IndexError::Constraint(format!(
                "source {} already has a {}s window",
                source_id, limit.window_seconds
            )));
        }
        let limit = RateLimit {
            id: self.allocate_id(),
            data_source_id: source_id,
            window_seconds: limit.window_seconds,
            max_calls: limit.max_calls,
            burst: limit.burst,
            retry_delay_seconds: limit.retry_delay_seconds,
            max_retries: limit.max_retries,
            backoff_multiplier: limit.backoff_multiplier,
        };
        self.rate_limits.push(limit.clone());
        Ok(limit)
    }

    fn push_credential(&mut self, source_id: SourceId, credential: &NewCredential) -> Result<Credential> {
        self.source_mut(source_id)?;
        if self.credentials.iter().any(|c| {
            c.data_source_id == source_id && c.kind == credential.kind && c.token == credential.token
        }) {
            return Err(IndexError::Constraint(format!(
                "source {} already has this {} credential",
                source_id, credential.kind
            )));
        }
        let now = Utc::now();
        let credential = Credential {
            id: self.allocate_id(),
            data_source_id: source_id,
            kind: credential.kind.clone(),
            token: credential.token.clone(),
            expires_at: credential.expires_at,
            rotated_at: credential.rotated_at,
            created_at: now,
            updated_at: now,
        };
        self.credentials.push(credential.clone());
        Ok(credential)
    }

    fn push_capability(&mut self, source_id: SourceId, capability: &NewCapability) -> Result<()> {
        if self
            .capabilities
            .iter()
            .any(|c| c.data_source_id == source_id && c.capability == capability.capability)
        {
            return Err(IndexError::Constraint(format!(
                "source {} already declares '{}'",
                source_id, capability.capability
            )));
        }
        let capability = Capability {
            id: self.allocate_id(),
            data_source_id: source_id,
            capability: capability.capability.clone(),
            endpoint_path: capability.endpoint_path.clone(),
            payload_mapping: capability.payload_mapping.clone(),
        };
        self.capabilities.push(capability);
        Ok(())
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SourceRegistry for InMemoryStore {
    fn find_source(&self, name: &str) -> Result<Option<DataSource>> {
        let state = self.state();
        Ok(state.sources.iter().find(|s| s.name == name).cloned())
    }

    fn list_sources(&self) -> Result<Vec<DataSource>> {
        let mut sources = self.state().sources.clone();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    fn install_source(&self, definition: &SourceDefinition) -> Result<DataSource> {
        validate_definition(definition)?;

        let mut state = self.state();
        if state.sources.iter().any(|s| s.name == definition.name) {
            return Err(IndexError::Constraint(format!(
                "data source '{}' already exists",
                definition.name
            )));
        }

        // Validation already ruled out duplicates inside the definition, so
        // nothing below can fail half way through.
        let now = Utc::now();
        let source = DataSource {
            id: state.allocate_id(),
            name: definition.name.clone(),
            kind: definition.kind.clone(),
            base_url: definition.base_url.clone(),
            user_agent: definition.user_agent.clone(),
            enabled: definition.enabled,
            last_run_started_at: None,
            last_run_completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        state.sources.push(source.clone());

        for limit in &definition.rate_limits {
            state.push_rate_limit(source.id, limit)?;
        }
        for credential in &definition.credentials {
            state.push_credential(source.id, credential)?;
        }
        if let Some(policy) = &definition.refresh_policy {
            let policy = RefreshPolicy {
                id: state.allocate_id(),
                data_source_id: source.id,
                default_refresh_interval_minutes: policy.default_refresh_interval_minutes,
                max_record_age_days: policy.max_record_age_days,
                incremental_cursor_field: policy.incremental_cursor_field.clone(),
                supports_webhook: policy.supports_webhook,
            };
            state.refresh_policies.push(policy);
        }
        for capability in &definition.capabilities {
            state.push_capability(source.id, capability)?;
        }

        debug!(source = %source.name, "Installed data source");
        Ok(source)
    }

    fn set_source_enabled(&self, name: &str, enabled: bool) -> Result<DataSource> {
        let mut state = self.state();
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| IndexError::NotFound(format!("data source '{}'", name)))?;
        source.enabled = enabled;
        source.updated_at = Utc::now();
        Ok(source.clone())
    }

    fn delete_source(&self, source_id: SourceId) -> Result<()> {
        let mut state = self.state();
        let before = state.sources.len();
        state.sources.retain(|s| s.id != source_id);
        if state.sources.len() == before {
            return Err(IndexError::NotFound(format!("data source {}", source_id)));
        }
        state.credentials.retain(|c| c.data_source_id != source_id);
        state.rate_limits.retain(|l| l.data_source_id != source_id);
        state.refresh_policies.retain(|p| p.data_source_id != source_id);
        state.capabilities.retain(|c| c.data_source_id != source_id);
        state.runs.retain(|r| r.data_source_id != source_id);
        Ok(())
    }

    fn refresh_policy_for(&self, source_id: SourceId) -> Result<Option<RefreshPolicy>> {
        let state = self.state();
        Ok(state
            .refresh_policies
            .iter()
            .find(|p| p.data_source_id == source_id)
            .cloned())
    }

    fn capabilities_for(&self, source_id: SourceId) -> Result<Vec<Capability>> {
        let state = self.state();
        Ok(state
            .capabilities
            .iter()
            .filter(|c| c.data_source_id == source_id)
            .cloned()
            .collect())
    }
}

impl CredentialStore for InMemoryStore {
    fn credentials_for(&self, source_id: SourceId) -> Result<Vec<Credential>> {
        let state = self.state();
        Ok(state
            .credentials
            .iter()
            .filter(|c| c.data_source_id == source_id)
            .cloned()
            .collect())
    }

    fn add_credential(&self, source_id: SourceId, credential: &NewCredential) -> Result<Credential> {
        validate_credential(&format!("#{source_id}"), credential)?;
        self.state().push_credential(source_id, credential)
    }

    fn remove_credential(&self, credential_id: i64) -> Result<()> {
        let mut state = self.state();
        let before = state.credentials.len();
        state.credentials.retain(|c| c.id != credential_id);
        if state.credentials.len() == before {
            return Err(IndexError::NotFound(format!("credential {}", credential_id)));
        }
        Ok(())
    }
}

impl RateLimitPolicies for InMemoryStore {
    fn rate_limits_for(&self, source_id: SourceId) -> Result<Vec<RateLimit>> {
        let state = self.state();
        let mut limits: Vec<RateLimit> = state
            .rate_limits
            .iter()
            .filter(|l| l.data_source_id == source_id)
            .cloned()
            .collect();
        limits.sort_by_key(|l| l.window_seconds);
        Ok(limits)
    }

    fn add_rate_limit(&self, source_id: SourceId, limit: &NewRateLimit) -> Result<RateLimit> {
        validate_rate_limit(&format!("#{source_id}"), limit)?;
        self.state().push_rate_limit(source_id, limit)
    }
}

impl RunLedger for InMemoryStore {
    fn count_runs_since(&self, source_id: SourceId, since: DateTime<Utc>) -> Result<u64> {
        Ok(self.state().count_runs_since(source_id, since))
    }

    fn open_run(&self, source_id: SourceId, started_at: DateTime<Utc>) -> Result<Run> {
        self.state().push_run(source_id, started_at)
    }

    fn open_run_within_limits(
        &self,
        source_id: SourceId,
        limits: &[RateLimit],
        started_at: DateTime<Utc>,
    ) -> Result<RunAdmission> {
        let mut state = self.state();
        if let Some((limit, observed)) = first_exhausted(limits, started_at, |since| {
            Ok(state.count_runs_since(source_id, since))
        })? {
            return Ok(RunAdmission::Exhausted { limit, observed });
        }
        state.push_run(source_id, started_at).map(RunAdmission::Opened)
    }

    fn complete_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<Run> {
        let mut state = self.state();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| IndexError::NotFound(format!("run {}", run_id)))?;
        check_completion(run, outcome)?;

        run.completed_at = Some(outcome.completed_at);
        run.status = outcome.status;
        run.error = outcome.error.clone();
        run.items_fetched = outcome.items_fetched;
        run.items_processed = outcome.items_processed;
        let run = run.clone();

        let source = state.source_mut(run.data_source_id)?;
        source.last_run_completed_at = Some(outcome.completed_at);
        source.last_error = outcome.error.clone();
        source.updated_at = Utc::now();
        Ok(run)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let state = self.state();
        Ok(state.runs.iter().find(|r| r.id == run_id).cloned())
    }

    fn recent_runs(&self, source_id: SourceId, limit: usize) -> Result<Vec<Run>> {
        let state = self.state();
        let mut runs: Vec<Run> = state
            .runs
            .iter()
            .filter(|r| r.data_source_id == source_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }
}
