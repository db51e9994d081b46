//! Persistent, compressed investigation reports.
//!
//! Backed by SQLite, with `investigationTrace`/`finalAnalysis`
//! gzip-compressed at rest and a bounded connection pool standing in for
//! a real server-backed database pool, since a single
//! `rusqlite::Connection` only ever serves one caller at a time.

use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{Mutex, Semaphore};

use crate::types::{IncidentId, Report, ReportStatus, ReportStoreError};

const DEFAULT_POOL_SIZE: usize = 3;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_LIMIT: usize = 100;

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Assigns a fresh incident id, `timestamp = now`, `status = open`,
    /// compresses the trace and analysis, and inserts the row.
    async fn save(&self, report: Report) -> Result<IncidentId, ReportStoreError>;

    /// Most recent reports, newest first, without the compressed blobs.
    async fn list(&self) -> Result<Vec<Report>, ReportStoreError>;

    async fn get(&self, incident_id: IncidentId) -> Result<Report, ReportStoreError>;

    /// Deletes rows older than `days`. Returns the number of rows removed.
    async fn prune(&self, days: u32) -> Result<usize, ReportStoreError>;
}

fn compress(data: &str) -> Result<Vec<u8>, ReportStoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data.as_bytes())
        .map_err(|e| ReportStoreError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| ReportStoreError::Compression(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<String, ReportStoreError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| ReportStoreError::Compression(e.to_string()))?;
    Ok(out)
}

fn to_unix_secs(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn from_unix_secs(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn status_str(status: ReportStatus) -> &'static str {
    match status {
        ReportStatus::Open => "open",
        ReportStatus::Acknowledged => "acknowledged",
        ReportStatus::Resolved => "resolved",
    }
}

fn status_from_str(s: &str) -> ReportStatus {
    match s {
        "acknowledged" => ReportStatus::Acknowledged,
        "resolved" => ReportStatus::Resolved,
        _ => ReportStatus::Open,
    }
}

/// A free-list of `rusqlite::Connection`s guarded by a semaphore, so at
/// most `size` callers hold a connection concurrently and acquisition
/// beyond that blocks up to `ACQUIRE_TIMEOUT` before failing.
struct ConnectionPool {
    free: Mutex<Vec<rusqlite::Connection>>,
    permits: Semaphore,
}

struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<rusqlite::Connection>,
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // best effort: re-queue synchronously, pool mutex is uncontended here
            if let Ok(mut free) = self.pool.free.try_lock() {
                free.push(conn);
            }
        }
    }
}

impl ConnectionPool {
    fn open(path: &Path, size: usize) -> Result<Self, ReportStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ReportStoreError::Storage(e.to_string()))?;
        }
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = rusqlite::Connection::open(path).map_err(|e| ReportStoreError::Storage(e.to_string()))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| ReportStoreError::Storage(e.to_string()))?;
            free.push(conn);
        }
        init_schema(&free[0])?;
        Ok(Self { free: Mutex::new(free), permits: Semaphore::new(size) })
    }

    fn open_in_memory(_size: usize) -> Result<Self, ReportStoreError> {
        // In-memory connections don't share state across handles, so
        // tests get exactly one connection behind a single permit.
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| ReportStoreError::Storage(e.to_string()))?;
        init_schema(&conn)?;
        Ok(Self { free: Mutex::new(vec![conn]), permits: Semaphore::new(1) })
    }

    async fn acquire(&self) -> Result<PooledConnection<'_>, ReportStoreError> {
        let permit = tokio::time::timeout(ACQUIRE_TIMEOUT, self.permits.acquire())
            .await
            .map_err(|_| ReportStoreError::PoolExhausted)?
            .map_err(|_| ReportStoreError::PoolExhausted)?;
        let conn = self
            .free
            .lock()
            .await
            .pop()
            .ok_or(ReportStoreError::PoolExhausted)?;
        Ok(PooledConnection { pool: self, conn: Some(conn), _permit: permit })
    }
}

impl std::ops::Deref for PooledConnection<'_> {
    type Target = rusqlite::Connection;
    fn deref(&self) -> &rusqlite::Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), ReportStoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS reports (
            incident_id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            initial_log TEXT NOT NULL,
            triage_reason TEXT NOT NULL,
            investigation_trace BLOB NOT NULL,
            final_analysis BLOB NOT NULL,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reports_timestamp ON reports(timestamp);",
    )
    .map_err(|e| ReportStoreError::Storage(e.to_string()))?;
    Ok(())
}

/// SQLite-backed `ReportStore`.
pub struct SqliteReportStore {
    pool: ConnectionPool,
}

impl SqliteReportStore {
    pub fn open(path: &Path) -> Result<Self, ReportStoreError> {
        Ok(Self { pool: ConnectionPool::open(path, DEFAULT_POOL_SIZE)? })
    }

    pub fn open_in_memory() -> Result<Self, ReportStoreError> {
        Ok(Self { pool: ConnectionPool::open_in_memory(DEFAULT_POOL_SIZE)? })
    }

    pub fn default_path() -> std::path::PathBuf {
        std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from(".")).join("seraph_reports.db")
    }

    #[cfg(test)]
    async fn backdate(&self, incident_id: IncidentId, age_secs: i64) {
        let conn = self.pool.acquire().await.unwrap();
        conn.execute(
            "UPDATE reports SET timestamp = ?1 WHERE incident_id = ?2",
            rusqlite::params![to_unix_secs(SystemTime::now()) - age_secs, incident_id.to_string()],
        )
        .unwrap();
    }
}

#[async_trait]
impl ReportStore for SqliteReportStore {
    async fn save(&self, report: Report) -> Result<IncidentId, ReportStoreError> {
        let incident_id = IncidentId::new();
        let trace = compress(&report.investigation_trace)?;
        let analysis = compress(&report.final_analysis)?;
        let conn = self.pool.acquire().await?;
        conn.execute(
            "INSERT INTO reports
                (incident_id, timestamp, initial_log, triage_reason, investigation_trace, final_analysis, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                incident_id.to_string(),
                to_unix_secs(SystemTime::now()),
                report.initial_log,
                report.triage_reason,
                trace,
                analysis,
                status_str(ReportStatus::Open),
            ],
        )
        .map_err(|e| ReportStoreError::Storage(e.to_string()))?;
        Ok(incident_id)
    }

    async fn list(&self) -> Result<Vec<Report>, ReportStoreError> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn
            .prepare(
                "SELECT incident_id, timestamp, initial_log, triage_reason, status
                 FROM reports ORDER BY timestamp DESC LIMIT ?1",
            )
            .map_err(|e| ReportStoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![LIST_LIMIT as i64], |row| {
                let timestamp: i64 = row.get(1)?;
                let status_raw: String = row.get(4)?;
                Ok(Report {
                    incident_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                    timestamp: from_unix_secs(timestamp),
                    initial_log: row.get(2)?,
                    triage_reason: row.get(3)?,
                    investigation_trace: String::new(),
                    final_analysis: String::new(),
                    status: status_from_str(&status_raw),
                })
            })
            .map_err(|e| ReportStoreError::Storage(e.to_string()))?;
        let mut reports = Vec::new();
        for row in rows {
            reports.push(row.map_err(|e| ReportStoreError::Storage(e.to_string()))?);
        }
        Ok(reports)
    }

    async fn get(&self, incident_id: IncidentId) -> Result<Report, ReportStoreError> {
        let conn = self.pool.acquire().await?;
        let result = conn.query_row(
            "SELECT timestamp, initial_log, triage_reason, investigation_trace, final_analysis, status
             FROM reports WHERE incident_id = ?1",
            rusqlite::params![incident_id.to_string()],
            |row| {
                let timestamp: i64 = row.get(0)?;
                let trace_blob: Vec<u8> = row.get(3)?;
                let analysis_blob: Vec<u8> = row.get(4)?;
                let status_raw: String = row.get(5)?;
                Ok((timestamp, row.get::<_, String>(1)?, row.get::<_, String>(2)?, trace_blob, analysis_blob, status_raw))
            },
        );
        match result {
            Ok((timestamp, initial_log, triage_reason, trace_blob, analysis_blob, status_raw)) => Ok(Report {
                incident_id,
                timestamp: from_unix_secs(timestamp),
                initial_log,
                triage_reason,
                investigation_trace: decompress(&trace_blob)?,
                final_analysis: decompress(&analysis_blob)?,
                status: status_from_str(&status_raw),
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(ReportStoreError::NotFound(incident_id.to_string())),
            Err(e) => Err(ReportStoreError::Storage(e.to_string())),
        }
    }

    async fn prune(&self, days: u32) -> Result<usize, ReportStoreError> {
        let cutoff = to_unix_secs(SystemTime::now()) - (days as i64) * 86_400;
        let conn = self.pool.acquire().await?;
        let removed = conn
            .execute("DELETE FROM reports WHERE timestamp < ?1", rusqlite::params![cutoff])
            .map_err(|e| ReportStoreError::Storage(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Report;

    fn sample_report() -> Report {
        Report {
            incident_id: IncidentId::new(),
            timestamp: SystemTime::now(),
            initial_log: "pod payments-7f4 OOMKilled".to_string(),
            triage_reason: "memory exhaustion in payments service".to_string(),
            investigation_trace: "turn 1: checked pod memory limits".to_string(),
            final_analysis: "root cause: memory leak in payments v2.3.1".to_string(),
            status: ReportStatus::Open,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips_compressed_blobs() {
        let store = SqliteReportStore::open_in_memory().unwrap();
        let report = sample_report();
        let expected_trace = report.investigation_trace.clone();
        let id = store.save(report).await.unwrap();

        let loaded = store.get(id).await.unwrap();
        assert_eq!(loaded.investigation_trace, expected_trace);
        assert_eq!(loaded.status, ReportStatus::Open);
    }

    #[tokio::test]
    async fn list_omits_compressed_blobs() {
        let store = SqliteReportStore::open_in_memory().unwrap();
        store.save(sample_report()).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].investigation_trace.is_empty());
    }

    #[tokio::test]
    async fn get_unknown_incident_fails() {
        let store = SqliteReportStore::open_in_memory().unwrap();
        let err = store.get(IncidentId::new()).await.unwrap_err();
        assert!(matches!(err, ReportStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn prune_removes_rows_older_than_cutoff() {
        let store = SqliteReportStore::open_in_memory().unwrap();
        let old_id = store.save(sample_report()).await.unwrap();
        store.backdate(old_id, 90 * 86_400).await;
        store.save(sample_report()).await.unwrap();

        let removed = store.prune(30).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
