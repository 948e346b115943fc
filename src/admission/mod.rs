//! Fetch admission: decide whether a fetch against a named source may start
//! now, pick its credential and open its ledger entry.

pub mod credentials;
pub mod locks;

pub use credentials::select_active_credential;
pub use locks::SourceLocks;

use crate::clock::{ClockPort, SystemClock};
use crate::error::IndexError;
use crate::metrics::AdmissionMetrics;
use crate::models::{Credential, DataSource, Run};
use crate::storage::{AdmissionStore, RunAdmission};
use serde::Serialize;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Everything the transport layer needs to execute an admitted fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchPlan {
    pub data_source: DataSource,
    pub credential: Option<Credential>,
    pub run: Run,
}

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Data source '{source_name}' is not configured")]
    SourceNotConfigured { source_name: String },

    #[error("Data source '{source_name}' is disabled")]
    SourceDisabled { source_name: String },

    #[error(
        "Rate limit exceeded for '{source_name}' ({max_calls} calls per {window_seconds}s window, {observed} started)"
    )]
    RateLimitExceeded {
        source_name: String,
        window_seconds: i64,
        max_calls: i64,
        observed: u64,
        retry_delay_seconds: Option<i64>,
    },

    #[error("Storage failure during admission: {0}")]
    Storage(#[from] IndexError),
}

impl AdmissionError {
    /// Only quota rejections clear up on their own; the rest need an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdmissionError::RateLimitExceeded { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::SourceNotConfigured { .. } => "not_configured",
            AdmissionError::SourceDisabled { .. } => "disabled",
            AdmissionError::RateLimitExceeded { .. } => "rate_limited",
            AdmissionError::Storage(_) => "storage",
        }
    }
}

/// Admission orchestrator over a store implementing all four collaborator
/// contracts.
pub struct FetchAdmission<S: AdmissionStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn ClockPort>,
    locks: SourceLocks,
}

impl<S: AdmissionStore + ?Sized> FetchAdmission<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            store,
            clock,
            locks: SourceLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Admit one fetch attempt against `source_name`.
    ///
    /// Checks run in order: the source exists, it is enabled, every rate-limit
    /// window has room. Only then is a credential chosen and a `started` run
    /// recorded; any rejection leaves the ledger untouched. The quota check and
    /// the run insert are one atomic ledger step, so concurrent callers cannot
    /// both take the last slot, even from separate processes sharing a
    /// database. The per-source lock only queues callers inside this process.
    #[instrument(skip_all, fields(source = %source_name))]
    pub fn prepare_fetch(&self, source_name: &str) -> Result<FetchPlan, AdmissionError> {
        let t0 = Instant::now();
        let result = self.admit(source_name);
        let elapsed = t0.elapsed().as_secs_f64();

        match &result {
            Ok(plan) => {
                AdmissionMetrics::record_admitted(source_name, elapsed);
                let credential = plan.credential.as_ref().map(Credential::fingerprint);
                info!(
                    run_id = plan.run.id,
                    credential = credential.as_deref(),
                    "Fetch admitted"
                );
            }
            Err(err) => {
                AdmissionMetrics::record_rejected(source_name, err.reason(), elapsed);
                warn!(reason = err.reason(), "Fetch rejected: {}", err);
            }
        }
        result
    }

    fn admit(&self, source_name: &str) -> Result<FetchPlan, AdmissionError> {
        let data_source = self.resolve_source(source_name)?;

        let lock = self.locks.for_source(data_source.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let now = self.clock.now_utc();
        let limits = self.store.rate_limits_for(data_source.id)?;
        let credential = select_active_credential(&self.store.credentials_for(data_source.id)?, now);

        match self.store.open_run_within_limits(data_source.id, &limits, now)? {
            RunAdmission::Opened(run) => Ok(FetchPlan {
                data_source,
                credential,
                run,
            }),
            RunAdmission::Exhausted { limit, observed } => Err(AdmissionError::RateLimitExceeded {
                source_name: data_source.name,
                window_seconds: limit.window_seconds,
                max_calls: limit.max_calls,
                observed,
                retry_delay_seconds: limit.retry_delay_seconds,
            }),
        }
    }

    fn resolve_source(&self, source_name: &str) -> Result<DataSource, AdmissionError> {
        let data_source = self.store.find_source(source_name)?.ok_or_else(|| {
            AdmissionError::SourceNotConfigured {
                source_name: source_name.to_string(),
            }
        })?;
        if !data_source.enabled {
            return Err(AdmissionError::SourceDisabled {
                source_name: data_source.name,
            });
        }
        Ok(data_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{NewCredential, SourceDefinition};
    use crate::storage::{CredentialStore, InMemoryStore, RunLedger, SourceRegistry};
    use chrono::{Duration, Utc};

    fn admission_with(
        definitions: &[SourceDefinition],
    ) -> (FetchAdmission<InMemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryStore::new());
        for definition in definitions {
            store.install_source(definition).unwrap();
        }
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let admission = FetchAdmission::with_clock(store, clock.clone());
        (admission, clock)
    }

    #[test]
    fn test_prepare_fetch_creates_run_and_returns_plan() {
        let (admission, _) = admission_with(&[SourceDefinition::new("tmdb")]);

        let plan = admission.prepare_fetch("tmdb").unwrap();
        assert_eq!(plan.data_source.name, "tmdb");
        assert_eq!(plan.run.status, crate::models::RunStatus::Started);
        assert!(plan.credential.is_none());
    }

    #[test]
    fn test_unknown_source_is_not_configured() {
        let (admission, _) = admission_with(&[]);
        let err = admission.prepare_fetch("missing").unwrap_err();
        assert!(matches!(err, AdmissionError::SourceNotConfigured { ref source_name } if source_name == "missing"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_disabled_check_precedes_rate_limits() {
        let definition = SourceDefinition::new("imdb").disabled().with_rate_limit(60, 0);
        let (admission, _) = admission_with(&[definition]);

        let err = admission.prepare_fetch("imdb").unwrap_err();
        assert!(matches!(err, AdmissionError::SourceDisabled { .. }));
    }

    #[test]
    fn test_rate_limit_error_names_the_window() {
        let definition = SourceDefinition::new("wikidata")
            .with_rate_limit(1, 5)
            .with_rate_limit(60, 1);
        let (admission, _) = admission_with(&[definition]);

        admission.prepare_fetch("wikidata").unwrap();
        match admission.prepare_fetch("wikidata").unwrap_err() {
            AdmissionError::RateLimitExceeded {
                source_name,
                window_seconds,
                max_calls,
                observed,
                ..
            } => {
                assert_eq!(source_name, "wikidata");
                assert_eq!(window_seconds, 60);
                assert_eq!(max_calls, 1);
                assert_eq!(observed, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_window_ages_out() {
        let (admission, clock) = admission_with(&[SourceDefinition::new("wikidata").with_rate_limit(60, 1)]);

        admission.prepare_fetch("wikidata").unwrap();
        let err = admission.prepare_fetch("wikidata").unwrap_err();
        assert!(err.is_retryable());

        // Lower bound is inclusive: a run exactly one window old still counts.
        clock.advance(Duration::seconds(60));
        assert!(admission.prepare_fetch("wikidata").is_err());

        clock.advance(Duration::seconds(1));
        admission.prepare_fetch("wikidata").unwrap();
    }

    #[test]
    fn test_rejections_do_not_touch_the_ledger() {
        let (admission, _) = admission_with(&[SourceDefinition::new("tmdb").with_rate_limit(60, 2)]);
        for _ in 0..2 {
            admission.prepare_fetch("tmdb").unwrap();
        }
        for _ in 0..3 {
            admission.prepare_fetch("tmdb").unwrap_err();
        }

        let source = admission.store().find_source("tmdb").unwrap().unwrap();
        let runs = admission.store().recent_runs(source.id, 100).unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[test]
    fn test_plan_carries_soonest_valid_credential() {
        let (admission, clock) = admission_with(&[SourceDefinition::new("archive")]);
        let now = clock.now_utc();
        let store = admission.store();
        let source = store.find_source("archive").unwrap().unwrap();
        store
            .add_credential(
                source.id,
                &NewCredential::new("api_key", "later").expiring_at(now + Duration::days(7)),
            )
            .unwrap();
        store
            .add_credential(
                source.id,
                &NewCredential::new("api_key", "sooner").expiring_at(now + Duration::hours(1)),
            )
            .unwrap();

        let plan = admission.prepare_fetch("archive").unwrap();
        assert_eq!(plan.credential.map(|c| c.token), Some("sooner".to_string()));
    }
}
