use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tempfile::tempdir;

use open_cinema_index::admission::{AdmissionError, FetchAdmission};
use open_cinema_index::clock::{ClockPort, ManualClock};
use open_cinema_index::models::{NewCredential, RunOutcome, RunStatus, SourceDefinition};
use open_cinema_index::registry::default_sources;
use open_cinema_index::storage::{
    CredentialStore, RateLimitPolicies, RunLedger, SourceRegistry, SqliteStore,
};

fn start() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_767_225_600, 0).unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    admission: FetchAdmission<SqliteStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(definitions: &[SourceDefinition]) -> Result<Self> {
        let dir = tempdir()?;
        let store = Arc::new(SqliteStore::open(dir.path().join("index.db"))?);
        for definition in definitions {
            store.install_source(definition)?;
        }
        let clock = Arc::new(ManualClock::new(start()));
        let admission = FetchAdmission::with_clock(store, clock.clone());
        Ok(Self {
            _dir: dir,
            admission,
            clock,
        })
    }

    fn store(&self) -> &SqliteStore {
        self.admission.store()
    }

    fn run_count(&self, name: &str) -> Result<usize> {
        let source = self.store().find_source(name)?.expect("source installed");
        Ok(self.store().recent_runs(source.id, usize::MAX)?.len())
    }
}

#[test]
fn test_source_without_limits_is_never_throttled() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("archive")])?;
    for _ in 0..25 {
        harness.admission.prepare_fetch("archive")?;
    }
    assert_eq!(harness.run_count("archive")?, 25);
    Ok(())
}

#[test]
fn test_one_call_per_minute() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("wikidata").with_rate_limit(60, 1)])?;

    let first = harness.admission.prepare_fetch("wikidata")?;
    assert_eq!(first.run.started_at, start());

    let err = harness.admission.prepare_fetch("wikidata").unwrap_err();
    assert!(matches!(err, AdmissionError::RateLimitExceeded { .. }));

    harness.clock.advance(Duration::seconds(61));
    harness.admission.prepare_fetch("wikidata")?;
    assert_eq!(harness.run_count("wikidata")?, 2);
    Ok(())
}

#[test]
fn test_run_exactly_one_window_old_still_counts() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("wikidata").with_rate_limit(60, 1)])?;
    harness.admission.prepare_fetch("wikidata")?;

    harness.clock.advance(Duration::seconds(60));
    assert!(harness.admission.prepare_fetch("wikidata").is_err());

    harness.clock.advance(Duration::microseconds(1));
    assert!(harness.admission.prepare_fetch("wikidata").is_ok());
    Ok(())
}

#[test]
fn test_windows_are_isolated_per_source() -> Result<()> {
    let harness = Harness::new(&[
        SourceDefinition::new("tmdb").with_rate_limit(60, 2),
        SourceDefinition::new("wikidata").with_rate_limit(60, 1),
    ])?;

    harness.admission.prepare_fetch("tmdb")?;
    harness.admission.prepare_fetch("wikidata")?;
    harness.admission.prepare_fetch("tmdb")?;
    assert!(harness.admission.prepare_fetch("wikidata").is_err());
    assert!(harness.admission.prepare_fetch("tmdb").is_err());

    assert_eq!(harness.run_count("tmdb")?, 2);
    assert_eq!(harness.run_count("wikidata")?, 1);
    Ok(())
}

#[test]
fn test_every_window_is_enforced() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("tmdb")
        .with_rate_limit(10, 2)
        .with_rate_limit(3600, 3)])?;

    harness.admission.prepare_fetch("tmdb")?;
    harness.admission.prepare_fetch("tmdb")?;
    match harness.admission.prepare_fetch("tmdb").unwrap_err() {
        AdmissionError::RateLimitExceeded { window_seconds, .. } => assert_eq!(window_seconds, 10),
        other => panic!("unexpected error: {other}"),
    }

    harness.clock.advance(Duration::seconds(11));
    harness.admission.prepare_fetch("tmdb")?;

    harness.clock.advance(Duration::seconds(11));
    match harness.admission.prepare_fetch("tmdb").unwrap_err() {
        AdmissionError::RateLimitExceeded {
            window_seconds,
            observed,
            ..
        } => {
            assert_eq!(window_seconds, 3600);
            assert_eq!(observed, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn test_zero_quota_always_rejects() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("paused").with_rate_limit(60, 0)])?;
    for _ in 0..3 {
        let err = harness.admission.prepare_fetch("paused").unwrap_err();
        assert!(matches!(err, AdmissionError::RateLimitExceeded { max_calls: 0, .. }));
        harness.clock.advance(Duration::hours(1));
    }
    assert_eq!(harness.run_count("paused")?, 0);
    Ok(())
}

#[test]
fn test_valid_credential_wins_regardless_of_insertion_order() -> Result<()> {
    let now = start();
    for reversed in [false, true] {
        let mut credentials = vec![
            NewCredential::new("api_key", "stale").expiring_at(now - Duration::minutes(5)),
            NewCredential::new("api_key", "fresh").expiring_at(now + Duration::days(1)),
        ];
        if reversed {
            credentials.reverse();
        }
        let mut definition = SourceDefinition::new("tmdb");
        definition.credentials = credentials;

        let harness = Harness::new(&[definition])?;
        let plan = harness.admission.prepare_fetch("tmdb")?;
        assert_eq!(plan.credential.map(|c| c.token), Some("fresh".to_string()));
    }
    Ok(())
}

#[test]
fn test_credentials_without_expiry_rank_last() -> Result<()> {
    let now = start();
    let definition = SourceDefinition::new("tmdb")
        .with_credential(NewCredential::new("api_key", "forever"))
        .with_credential(NewCredential::new("api_key", "month").expiring_at(now + Duration::days(30)));
    let harness = Harness::new(&[definition])?;

    let plan = harness.admission.prepare_fetch("tmdb")?;
    assert_eq!(plan.credential.map(|c| c.token), Some("month".to_string()));
    Ok(())
}

#[test]
fn test_only_expired_credentials_yield_plan_without_credential() -> Result<()> {
    let now = start();
    let definition = SourceDefinition::new("tmdb")
        .with_credential(NewCredential::new("api_key", "old").expiring_at(now - Duration::days(1)))
        .with_credential(NewCredential::new("bearer", "expiring-now").expiring_at(now));
    let harness = Harness::new(&[definition])?;

    let plan = harness.admission.prepare_fetch("tmdb")?;
    assert!(plan.credential.is_none());
    assert_eq!(harness.run_count("tmdb")?, 1);
    Ok(())
}

#[test]
fn test_rotated_credential_is_picked_up_on_next_call() -> Result<()> {
    let now = start();
    let harness = Harness::new(&[SourceDefinition::new("tmdb")
        .with_credential(NewCredential::new("api_key", "v1").expiring_at(now + Duration::hours(1)))])?;

    let plan = harness.admission.prepare_fetch("tmdb")?;
    let old = plan.credential.expect("credential selected");
    assert_eq!(old.token, "v1");

    let source_id = plan.data_source.id;
    harness
        .store()
        .add_credential(source_id, &NewCredential::new("api_key", "v2").expiring_at(now + Duration::days(90)))?;
    harness.store().remove_credential(old.id)?;

    let plan = harness.admission.prepare_fetch("tmdb")?;
    assert_eq!(plan.credential.map(|c| c.token), Some("v2".to_string()));
    Ok(())
}

#[test]
fn test_unknown_and_disabled_sources() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("imdb").disabled().with_rate_limit(60, 0)])?;

    let err = harness.admission.prepare_fetch("letterboxd").unwrap_err();
    assert!(matches!(err, AdmissionError::SourceNotConfigured { .. }));

    let err = harness.admission.prepare_fetch("imdb").unwrap_err();
    assert!(matches!(err, AdmissionError::SourceDisabled { ref source_name } if source_name == "imdb"));
    assert!(!err.is_retryable());

    harness.store().set_source_enabled("imdb", true)?;
    let err = harness.admission.prepare_fetch("imdb").unwrap_err();
    assert!(matches!(err, AdmissionError::RateLimitExceeded { .. }));
    assert!(err.is_retryable());
    Ok(())
}

#[test]
fn test_successes_and_rejections_leave_exactly_successful_runs() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("tmdb").with_rate_limit(60, 4)])?;

    let mut admitted = 0;
    let mut rejected = 0;
    for _ in 0..10 {
        match harness.admission.prepare_fetch("tmdb") {
            Ok(_) => admitted += 1,
            Err(AdmissionError::RateLimitExceeded { .. }) => rejected += 1,
            Err(other) => return Err(other.into()),
        }
    }
    assert_eq!((admitted, rejected), (4, 6));
    assert_eq!(harness.run_count("tmdb")?, 4);
    Ok(())
}

#[test]
fn test_admitted_run_flows_through_completion() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("tmdb").with_rate_limit(60, 1)])?;
    let plan = harness.admission.prepare_fetch("tmdb")?;

    let source = harness.store().find_source("tmdb")?.expect("source installed");
    assert_eq!(source.last_run_started_at, Some(start()));

    harness.clock.advance(Duration::seconds(3));
    let failed = harness.store().complete_run(
        plan.run.id,
        &RunOutcome::failed(harness.clock.now_utc(), "HTTP 503"),
    )?;
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.duration(), Duration::seconds(3));

    let source = harness.store().find_source("tmdb")?.expect("source installed");
    assert_eq!(source.last_error.as_deref(), Some("HTTP 503"));

    // Completed runs still occupy their slot in the window.
    assert!(harness.admission.prepare_fetch("tmdb").is_err());
    Ok(())
}

#[test]
fn test_plan_json_omits_the_secret() -> Result<()> {
    let harness = Harness::new(&[SourceDefinition::new("tmdb")
        .with_credential(NewCredential::new("api_key", "super-secret-token"))])?;
    let plan = harness.admission.prepare_fetch("tmdb")?;

    let json = serde_json::to_string(&plan)?;
    assert!(!json.contains("super-secret-token"));
    assert!(!format!("{:?}", plan).contains("super-secret-token"));
    assert!(json.contains("\"status\":\"started\""));
    Ok(())
}

#[test]
fn test_default_sources_admit_within_their_quotas() -> Result<()> {
    let harness = Harness::new(&default_sources())?;

    for _ in 0..40 {
        harness.admission.prepare_fetch("tmdb")?;
    }
    assert!(harness.admission.prepare_fetch("tmdb").is_err());

    harness.admission.prepare_fetch("wikidata")?;
    assert!(harness.admission.prepare_fetch("wikidata").is_err());
    harness.clock.advance(Duration::seconds(2));
    harness.admission.prepare_fetch("wikidata")?;

    let tmdb = harness.store().find_source("tmdb")?.expect("tmdb installed");
    let limits = harness.store().rate_limits_for(tmdb.id)?;
    assert_eq!(limits.len(), 1);
    assert_eq!(limits[0].max_retries, Some(3));
    Ok(())
}
