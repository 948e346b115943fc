use super::{
    check_completion, first_exhausted, CredentialStore, RateLimitPolicies, RunAdmission, RunLedger,
    SourceRegistry,
};
use crate::constants::DEFAULT_BUSY_TIMEOUT_MS;
use crate::error::{IndexError, Result};
use crate::models::{
    Capability, Credential, DataSource, NewCapability, NewCredential, NewRateLimit,
    NewRefreshPolicy, RateLimit, RefreshPolicy, Run, RunId, RunOutcome, RunStatus,
    SourceDefinition, SourceId,
};
use crate::registry::{validate_credential, validate_definition, validate_rate_limit};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/001_admission_schema.sql");

const SOURCE_COLUMNS: &str = "id, name, kind, base_url, user_agent, enabled, last_run_started_at, \
     last_run_completed_at, last_error, created_at, updated_at";
const CREDENTIAL_COLUMNS: &str =
    "id, data_source_id, kind, token, expires_at, rotated_at, created_at, updated_at";
const RATE_LIMIT_COLUMNS: &str = "id, data_source_id, window_seconds, max_calls, burst, \
     retry_delay_seconds, max_retries, backoff_multiplier";
const RUN_COLUMNS: &str = "id, data_source_id, started_at, completed_at, status, error, \
     items_fetched, items_processed";

/// SQLite-backed registry and run ledger.
///
/// Statements share one connection behind a mutex; multi-row changes run in a
/// transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    pub fn open_with_timeout<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "Opened SQLite store");
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement rolls its transaction back on unwind, so the
        // connection is still consistent.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SourceRegistry for SqliteStore {
    fn find_source(&self, name: &str) -> Result<Option<DataSource>> {
        let conn = self.conn();
        let source = conn
            .query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM data_sources WHERE name = ?1"),
                params![name],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    fn list_sources(&self) -> Result<Vec<DataSource>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources ORDER BY name"
        ))?;
        let sources = stmt
            .query_map([], source_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }

    fn install_source(&self, definition: &SourceDefinition) -> Result<DataSource> {
        validate_definition(definition)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = micros(Utc::now());
        tx.execute(
            "INSERT INTO data_sources (name, kind, base_url, user_agent, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                definition.name,
                definition.kind,
                definition.base_url,
                definition.user_agent,
                definition.enabled,
                now
            ],
        )
        .map_err(|e| constraint_or(e, || format!("data source '{}' already exists", definition.name)))?;
        let source_id = tx.last_insert_rowid();

        for limit in &definition.rate_limits {
            insert_rate_limit(&tx, source_id, limit)?;
        }
        for credential in &definition.credentials {
            insert_credential(&tx, source_id, credential)?;
        }
        if let Some(policy) = &definition.refresh_policy {
            insert_refresh_policy(&tx, source_id, policy)?;
        }
        for capability in &definition.capabilities {
            insert_capability(&tx, source_id, capability)?;
        }

        let source = load_source(&tx, source_id)?;
        tx.commit()?;
        info!(
            source = %source.name,
            rate_limits = definition.rate_limits.len(),
            credentials = definition.credentials.len(),
            "Installed data source"
        );
        Ok(source)
    }

    fn set_source_enabled(&self, name: &str, enabled: bool) -> Result<DataSource> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE data_sources SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
            params![enabled, micros(Utc::now()), name],
        )?;
        if updated == 0 {
            return Err(IndexError::NotFound(format!("data source '{}'", name)));
        }
        let source = conn.query_row(
            &format!("SELECT {SOURCE_COLUMNS} FROM data_sources WHERE name = ?1"),
            params![name],
            source_from_row,
        )?;
        Ok(source)
    }

    fn delete_source(&self, source_id: SourceId) -> Result<()> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM data_sources WHERE id = ?1", params![source_id])?;
        if deleted == 0 {
            return Err(IndexError::NotFound(format!("data source {}", source_id)));
        }
        debug!(source_id, "Deleted data source");
        Ok(())
    }

    fn refresh_policy_for(&self, source_id: SourceId) -> Result<Option<RefreshPolicy>> {
        let conn = self.conn();
        let policy = conn
            .query_row(
                "SELECT id, data_source_id, default_refresh_interval_minutes, max_record_age_days,
                        incremental_cursor_field, supports_webhook
                 FROM data_source_refresh_policies WHERE data_source_id = ?1",
                params![source_id],
                |row| {
                    Ok(RefreshPolicy {
                        id: row.get(0)?,
                        data_source_id: row.get(1)?,
                        default_refresh_interval_minutes: row.get(2)?,
                        max_record_age_days: row.get(3)?,
                        incremental_cursor_field: row.get(4)?,
                        supports_webhook: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(policy)
    }

    fn capabilities_for(&self, source_id: SourceId) -> Result<Vec<Capability>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, data_source_id, capability, endpoint_path, payload_mapping
             FROM data_source_capabilities WHERE data_source_id = ?1 ORDER BY id",
        )?;
        let capabilities = stmt
            .query_map(params![source_id], capability_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(capabilities)
    }
}

impl CredentialStore for SqliteStore {
    fn credentials_for(&self, source_id: SourceId) -> Result<Vec<Credential>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM data_source_credentials
             WHERE data_source_id = ?1 ORDER BY id"
        ))?;
        let credentials = stmt
            .query_map(params![source_id], credential_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(credentials)
    }

    fn add_credential(&self, source_id: SourceId, credential: &NewCredential) -> Result<Credential> {
        validate_credential(&format!("#{source_id}"), credential)?;
        let conn = self.conn();
        insert_credential(&conn, source_id, credential)
    }

    fn remove_credential(&self, credential_id: i64) -> Result<()> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM data_source_credentials WHERE id = ?1",
            params![credential_id],
        )?;
        if deleted == 0 {
            return Err(IndexError::NotFound(format!("credential {}", credential_id)));
        }
        Ok(())
    }
}

impl RateLimitPolicies for SqliteStore {
    fn rate_limits_for(&self, source_id: SourceId) -> Result<Vec<RateLimit>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RATE_LIMIT_COLUMNS} FROM data_source_rate_limits
             WHERE data_source_id = ?1 ORDER BY window_seconds"
        ))?;
        let limits = stmt
            .query_map(params![source_id], rate_limit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(limits)
    }

    fn add_rate_limit(&self, source_id: SourceId, limit: &NewRateLimit) -> Result<RateLimit> {
        validate_rate_limit(&format!("#{source_id}"), limit)?;
        let conn = self.conn();
        insert_rate_limit(&conn, source_id, limit)
    }
}

impl RunLedger for SqliteStore {
    fn count_runs_since(&self, source_id: SourceId, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn();
        count_runs(&conn, source_id, since)
    }

    fn open_run(&self, source_id: SourceId, started_at: DateTime<Utc>) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let run = insert_run(&tx, source_id, started_at)?;
        tx.commit()?;
        debug!(source_id, run_id = run.id, "Opened run");
        Ok(run)
    }

    fn open_run_within_limits(
        &self,
        source_id: SourceId,
        limits: &[RateLimit],
        started_at: DateTime<Utc>,
    ) -> Result<RunAdmission> {
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock before the counts, so a second
        // connection on the same file waits here instead of counting stale rows.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some((limit, observed)) =
            first_exhausted(limits, started_at, |since| count_runs(&tx, source_id, since))?
        {
            return Ok(RunAdmission::Exhausted { limit, observed });
        }
        let run = insert_run(&tx, source_id, started_at)?;
        tx.commit()?;
        debug!(source_id, run_id = run.id, "Opened run within limits");
        Ok(RunAdmission::Opened(run))
    }

    fn complete_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let run = tx
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM data_source_runs WHERE id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or_else(|| IndexError::NotFound(format!("run {}", run_id)))?;
        check_completion(&run, outcome)?;

        let completed = micros(outcome.completed_at);
        tx.execute(
            "UPDATE data_source_runs
             SET completed_at = ?1, status = ?2, error = ?3, items_fetched = ?4, items_processed = ?5
             WHERE id = ?6",
            params![
                completed,
                outcome.status,
                outcome.error,
                outcome.items_fetched,
                outcome.items_processed,
                run_id
            ],
        )?;
        tx.execute(
            "UPDATE data_sources SET last_run_completed_at = ?1, last_error = ?2, updated_at = ?3
             WHERE id = ?4",
            params![completed, outcome.error, micros(Utc::now()), run.data_source_id],
        )?;
        let run = load_run(&tx, run_id)?;
        tx.commit()?;
        debug!(run_id, status = %run.status, "Completed run");
        Ok(run)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM data_source_runs WHERE id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn recent_runs(&self, source_id: SourceId, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM data_source_runs
             WHERE data_source_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let runs = stmt
            .query_map(params![source_id, limit], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

fn insert_rate_limit(conn: &Connection, source_id: SourceId, limit: &NewRateLimit) -> Result<RateLimit> {
    conn.execute(
        "INSERT INTO data_source_rate_limits
         (data_source_id, window_seconds, max_calls, burst, retry_delay_seconds, max_retries, backoff_multiplier)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            source_id,
            limit.window_seconds,
            limit.max_calls,
            limit.burst,
            limit.retry_delay_seconds,
            limit.max_retries,
            limit.backoff_multiplier
        ],
    )
    .map_err(|e| {
        constraint_or(e, || {
            format!("source {} already has a {}s window", source_id, limit.window_seconds)
        })
    })?;
    let limit = conn.query_row(
        &format!("SELECT {RATE_LIMIT_COLUMNS} FROM data_source_rate_limits WHERE id = ?1"),
        params![conn.last_insert_rowid()],
        rate_limit_from_row,
    )?;
    Ok(limit)
}

fn insert_credential(conn: &Connection, source_id: SourceId, credential: &NewCredential) -> Result<Credential> {
    let now = micros(Utc::now());
    conn.execute(
        "INSERT INTO data_source_credentials
         (data_source_id, kind, token, expires_at, rotated_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            source_id,
            credential.kind,
            credential.token,
            credential.expires_at.map(micros),
            credential.rotated_at.map(micros),
            now
        ],
    )
    .map_err(|e| {
        constraint_or(e, || {
            format!("source {} already has this {} credential", source_id, credential.kind)
        })
    })?;
    let credential = conn.query_row(
        &format!("SELECT {CREDENTIAL_COLUMNS} FROM data_source_credentials WHERE id = ?1"),
        params![conn.last_insert_rowid()],
        credential_from_row,
    )?;
    Ok(credential)
}

fn insert_refresh_policy(conn: &Connection, source_id: SourceId, policy: &NewRefreshPolicy) -> Result<()> {
    conn.execute(
        "INSERT INTO data_source_refresh_policies
         (data_source_id, default_refresh_interval_minutes, max_record_age_days, incremental_cursor_field, supports_webhook)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            source_id,
            policy.default_refresh_interval_minutes,
            policy.max_record_age_days,
            policy.incremental_cursor_field,
            policy.supports_webhook
        ],
    )
    .map_err(|e| constraint_or(e, || format!("source {} already has a refresh policy", source_id)))?;
    Ok(())
}

fn insert_capability(conn: &Connection, source_id: SourceId, capability: &NewCapability) -> Result<()> {
    let mapping = capability
        .payload_mapping
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO data_source_capabilities (data_source_id, capability, endpoint_path, payload_mapping)
         VALUES (?1, ?2, ?3, ?4)",
        params![source_id, capability.capability, capability.endpoint_path, mapping],
    )
    .map_err(|e| {
        constraint_or(e, || {
            format!("source {} already declares '{}'", source_id, capability.capability)
        })
    })?;
    Ok(())
}

fn count_runs(conn: &Connection, source_id: SourceId, since: DateTime<Utc>) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM data_source_runs WHERE data_source_id = ?1 AND started_at >= ?2",
        params![source_id, micros(since)],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn insert_run(conn: &Connection, source_id: SourceId, started_at: DateTime<Utc>) -> Result<Run> {
    let started = micros(started_at);
    conn.execute(
        "INSERT INTO data_source_runs (data_source_id, started_at, status) VALUES (?1, ?2, ?3)",
        params![source_id, started, RunStatus::Started],
    )
    .map_err(|e| constraint_or(e, || format!("data source {} does not exist", source_id)))?;
    let run_id = conn.last_insert_rowid();
    conn.execute(
        "UPDATE data_sources SET last_run_started_at = ?1, updated_at = ?2 WHERE id = ?3",
        params![started, micros(Utc::now()), source_id],
    )?;
    load_run(conn, run_id)
}

fn load_source(conn: &Connection, source_id: SourceId) -> Result<DataSource> {
    let source = conn.query_row(
        &format!("SELECT {SOURCE_COLUMNS} FROM data_sources WHERE id = ?1"),
        params![source_id],
        source_from_row,
    )?;
    Ok(source)
}

fn load_run(conn: &Connection, run_id: RunId) -> Result<Run> {
    let run = conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM data_source_runs WHERE id = ?1"),
        params![run_id],
        run_from_row,
    )?;
    Ok(run)
}

/// Constraint failures are caller mistakes, not infrastructure trouble.
fn constraint_or(err: rusqlite::Error, describe: impl FnOnce() -> String) -> IndexError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation => {
            IndexError::Constraint(format!("{} ({})", describe(), err))
        }
        _ => IndexError::Database(err),
    }
}

fn micros(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_micros()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_micros(value).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(value) => DateTime::<Utc>::from_timestamp_micros(value)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, value)),
        None => Ok(None),
    }
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<DataSource> {
    Ok(DataSource {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        base_url: row.get(3)?,
        user_agent: row.get(4)?,
        enabled: row.get(5)?,
        last_run_started_at: opt_time_at(row, 6)?,
        last_run_completed_at: opt_time_at(row, 7)?,
        last_error: row.get(8)?,
        created_at: time_at(row, 9)?,
        updated_at: time_at(row, 10)?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get(0)?,
        data_source_id: row.get(1)?,
        kind: row.get(2)?,
        token: row.get(3)?,
        expires_at: opt_time_at(row, 4)?,
        rotated_at: opt_time_at(row, 5)?,
        created_at: time_at(row, 6)?,
        updated_at: time_at(row, 7)?,
    })
}

fn rate_limit_from_row(row: &Row<'_>) -> rusqlite::Result<RateLimit> {
    Ok(RateLimit {
        id: row.get(0)?,
        data_source_id: row.get(1)?,
        window_seconds: row.get(2)?,
        max_calls: row.get(3)?,
        burst: row.get(4)?,
        retry_delay_seconds: row.get(5)?,
        max_retries: row.get(6)?,
        backoff_multiplier: row.get(7)?,
    })
}

fn capability_from_row(row: &Row<'_>) -> rusqlite::Result<Capability> {
    let mapping: Option<String> = row.get(4)?;
    let payload_mapping = mapping
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Capability {
        id: row.get(0)?,
        data_source_id: row.get(1)?,
        capability: row.get(2)?,
        endpoint_path: row.get(3)?,
        payload_mapping,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        data_source_id: row.get(1)?,
        started_at: time_at(row, 2)?,
        completed_at: opt_time_at(row, 3)?,
        status: row.get(4)?,
        error: row.get(5)?,
        items_fetched: row.get(6)?,
        items_processed: row.get(7)?,
    })
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
