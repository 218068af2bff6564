//! SQLite-backed job store.
//!
//! Active-uniqueness is enforced by the database itself with a partial
//! unique index over `(key, kind)` restricted to slot-holding rows
//! (queued, running, or failed with a retry scheduled), so racing
//! triggers cannot create two active jobs even across processes, and a
//! trigger landing in a retry window coalesces onto the pending job.

use super::{
    blob_hash, CreateOutcome, JobStatus, JobStore, NotificationRecord, PerformanceSnapshot,
    PipelineJob, ProviderMetrics, StageRecord,
};
use crate::errors::{CallFailure, EngineError, FailureKind};
use crate::provider::{ProviderId, Role, TokenUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    key           TEXT NOT NULL,
    kind          TEXT NOT NULL,
    status        TEXT NOT NULL,
    attempt       INTEGER NOT NULL,
    payload       TEXT NOT NULL,
    result        TEXT,
    error_code    TEXT,
    error_message TEXT,
    next_retry_at TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_slot
    ON jobs(key, kind)
    WHERE status IN ('queued', 'running') OR next_retry_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS stage_records (
    job_id        TEXT NOT NULL,
    seq           INTEGER NOT NULL,
    stage         TEXT NOT NULL,
    role          TEXT NOT NULL,
    provider      TEXT,
    ok            INTEGER NOT NULL,
    hedged        INTEGER NOT NULL,
    attempts      INTEGER NOT NULL,
    latency_ms    INTEGER NOT NULL,
    tokens_in     INTEGER NOT NULL,
    tokens_out    INTEGER NOT NULL,
    error_code    TEXT,
    error_message TEXT,
    output        TEXT,
    recorded_at   TEXT NOT NULL,
    PRIMARY KEY (job_id, seq)
);

CREATE TABLE IF NOT EXISTS notifications (
    id         TEXT PRIMARY KEY,
    channel    TEXT NOT NULL,
    key        TEXT NOT NULL,
    kind       TEXT NOT NULL,
    status     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blobs (
    hash       TEXT PRIMARY KEY,
    content    BLOB NOT NULL,
    created_at TEXT NOT NULL
);
";

/// [`JobStore`] backed by a SQLite database.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Opens (creating if needed) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store; useful in tests.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, EngineError> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn job_from_row(row: &Row<'_>) -> rusqlite::Result<PipelineJob> {
        let id: String = row.get("id")?;
        let status: String = row.get("status")?;
        let payload: String = row.get("payload")?;
        let result: Option<String> = row.get("result")?;
        let error_code: Option<String> = row.get("error_code")?;
        let error_message: Option<String> = row.get("error_message")?;
        let next_retry_at: Option<String> = row.get("next_retry_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(PipelineJob {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            key: row.get("key")?,
            kind: row.get("kind")?,
            status: JobStatus::from_str_opt(&status).unwrap_or(JobStatus::Failed),
            attempt: row.get("attempt")?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            result: result.and_then(|r| serde_json::from_str(&r).ok()),
            error: error_code.map(|code| CallFailure {
                kind: FailureKind::from_code(&code).unwrap_or(FailureKind::Transient),
                message: error_message.unwrap_or_default(),
            }),
            next_retry_at: next_retry_at.as_deref().and_then(parse_ts),
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
        })
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StageRecord> {
        let job_id: String = row.get("job_id")?;
        let role: String = row.get("role")?;
        let provider: Option<String> = row.get("provider")?;
        let output: Option<String> = row.get("output")?;
        let recorded_at: String = row.get("recorded_at")?;
        let tokens_in: u32 = row.get("tokens_in")?;
        let tokens_out: u32 = row.get("tokens_out")?;

        Ok(StageRecord {
            job_id: Uuid::parse_str(&job_id).unwrap_or_default(),
            seq: row.get("seq")?,
            stage: row.get("stage")?,
            role: parse_role(&role),
            provider: provider.as_deref().and_then(ProviderId::from_str_opt),
            ok: row.get("ok")?,
            hedged: row.get("hedged")?,
            attempts: row.get("attempts")?,
            latency_ms: row.get("latency_ms")?,
            tokens: TokenUsage::new(tokens_in, tokens_out),
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            output: output.and_then(|o| serde_json::from_str(&o).ok()),
            recorded_at: parse_ts(&recorded_at).unwrap_or_else(Utc::now),
        })
    }

    fn find_active_sync(
        conn: &Connection,
        key: &str,
        kind: &str,
    ) -> Result<Option<Uuid>, EngineError> {
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM jobs
                 WHERE key = ?1 AND kind = ?2
                   AND (status IN ('queued', 'running') OR next_retry_at IS NOT NULL)",
                params![key, kind],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }
}

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_role(value: &str) -> Role {
    match value {
        "strategist" => Role::Strategist,
        "consolidator" => Role::Consolidator,
        "planner" => Role::Planner,
        _ => Role::Briefer,
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(
        &self,
        key: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<CreateOutcome, EngineError> {
        let conn = self.conn.lock();
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        let inserted = conn.execute(
            "INSERT INTO jobs (id, key, kind, status, attempt, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', 1, ?4, ?5, ?5)",
            params![id.to_string(), key, kind, payload.to_string(), now],
        );

        match inserted {
            Ok(_) => Ok(CreateOutcome::Created(id)),
            Err(err) if is_unique_violation(&err) => {
                let existing = Self::find_active_sync(&conn, key, kind)?
                    .ok_or_else(|| EngineError::Internal("lost race on active job".into()))?;
                Ok(CreateOutcome::Duplicate(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE jobs SET status = 'running', updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(EngineError::UnknownJob(id));
        }
        Ok(())
    }

    async fn mark_ok(&self, id: Uuid, result: serde_json::Value) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE jobs SET status = 'ok', result = ?2, error_code = NULL,
                 error_message = NULL, next_retry_at = NULL, updated_at = ?3
             WHERE id = ?1",
            params![id.to_string(), result.to_string(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(EngineError::UnknownJob(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: CallFailure) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE jobs SET status = 'failed', error_code = ?2, error_message = ?3,
                 next_retry_at = NULL, updated_at = ?4
             WHERE id = ?1",
            params![
                id.to_string(),
                error.kind.code(),
                error.message,
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::UnknownJob(id));
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        error: CallFailure,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE jobs SET status = 'failed', error_code = ?2, error_message = ?3,
                 next_retry_at = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                error.kind.code(),
                error.message,
                next_retry_at.to_rfc3339(),
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::UnknownJob(id));
        }
        Ok(())
    }

    async fn requeue_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        let conn = self.conn.lock();
        let now_str = now.to_rfc3339();

        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM jobs
                 WHERE status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1",
            )?;
            let rows = stmt.query_map(params![now_str], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut requeued = Vec::with_capacity(ids.len());
        for id in ids {
            conn.execute(
                "UPDATE jobs SET status = 'queued', attempt = attempt + 1,
                     next_retry_at = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![id, now_str],
            )?;
            if let Ok(uuid) = Uuid::parse_str(&id) {
                requeued.push(uuid);
            }
        }
        Ok(requeued)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>, EngineError> {
        let conn = self.conn.lock();
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id.to_string()],
                Self::job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    async fn find_active(&self, key: &str, kind: &str) -> Result<Option<Uuid>, EngineError> {
        let conn = self.conn.lock();
        Self::find_active_sync(&conn, key, kind)
    }

    async fn append_stage_record(&self, record: StageRecord) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stage_records
                 (job_id, seq, stage, role, provider, ok, hedged, attempts, latency_ms,
                  tokens_in, tokens_out, error_code, error_message, output, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.job_id.to_string(),
                record.seq,
                record.stage,
                record.role.as_str(),
                record.provider.map(ProviderId::as_str),
                record.ok,
                record.hedged,
                record.attempts,
                record.latency_ms,
                record.tokens.input,
                record.tokens.output,
                record.error_code,
                record.error_message,
                record.output.as_ref().map(ToString::to_string),
                record.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn stage_records(&self, job_id: Uuid) -> Result<Vec<StageRecord>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM stage_records WHERE job_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], Self::record_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn record_notification(&self, record: NotificationRecord) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notifications (id, channel, key, kind, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.channel,
                record.key,
                record.kind,
                record.status.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn notifications(&self, channel: &str) -> Result<Vec<NotificationRecord>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, channel, key, kind, status, created_at
             FROM notifications WHERE channel = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![channel], |row| {
            let id: String = row.get(0)?;
            let status: String = row.get(4)?;
            let created_at: String = row.get(5)?;
            Ok(NotificationRecord {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                channel: row.get(1)?,
                key: row.get(2)?,
                kind: row.get(3)?,
                status: JobStatus::from_str_opt(&status).unwrap_or(JobStatus::Failed),
                created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn store_blob(&self, content: &[u8]) -> Result<String, EngineError> {
        let conn = self.conn.lock();
        let hash = blob_hash(content);
        conn.execute(
            "INSERT OR IGNORE INTO blobs (hash, content, created_at) VALUES (?1, ?2, ?3)",
            params![hash, content, Utc::now().to_rfc3339()],
        )?;
        Ok(hash)
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let conn = self.conn.lock();
        let content = conn
            .query_row(
                "SELECT content FROM blobs WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    async fn performance_snapshot(&self) -> Result<PerformanceSnapshot, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT provider, COUNT(*), SUM(CASE WHEN ok = 0 THEN 1 ELSE 0 END),
                    AVG(latency_ms), SUM(tokens_in), SUM(tokens_out)
             FROM stage_records
             WHERE provider IS NOT NULL
             GROUP BY provider",
        )?;

        let rows = stmt.query_map([], |row| {
            let provider: String = row.get(0)?;
            let calls: u64 = row.get(1)?;
            let failures: u64 = row.get(2)?;
            let avg_latency_ms: f64 = row.get(3)?;
            let tokens_in: u64 = row.get(4)?;
            let tokens_out: u64 = row.get(5)?;
            Ok((
                provider,
                ProviderMetrics {
                    calls,
                    failures,
                    avg_latency_ms,
                    tokens_in,
                    tokens_out,
                },
            ))
        })?;

        let mut snapshot = PerformanceSnapshot::default();
        for row in rows {
            let (provider, metrics) = row?;
            if let Some(id) = ProviderId::from_str_opt(&provider) {
                snapshot.providers.insert(id, metrics);
            }
        }
        Ok(snapshot)
    }
}
