//! Best-effort metrics history in SQLite, one `metrics (ts, cpu, mem)` row per
//! tick. Recording never blocks the caller; rows are dropped when the writer
//! falls behind.

use crate::schema::Snapshot;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to open history database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("history query failed: {0}")]
    Query(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub ts: DateTime<Utc>,
    pub cpu: f64,
    pub mem_used_mb: u64,
}

impl HistoryRecord {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            ts: snapshot.metadata.timestamp,
            cpu: snapshot.cpu.global_usage_percent,
            mem_used_mb: snapshot.memory.used_mb,
        }
    }
}

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Opens (or creates) the database file and makes sure the table exists.
    pub async fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                debug!(path = %parent.display(), error = %err, "could not create history directory");
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // One writer; SQLite serializes writes anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| HistoryError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), rows = store.row_count().await?, "history database opened");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                ts DATETIME NOT NULL,
                cpu REAL NOT NULL,
                mem INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        sqlx::query("INSERT INTO metrics (ts, cpu, mem) VALUES (?, ?, ?)")
            .bind(record.ts)
            .bind(record.cpu)
            .bind(i64::try_from(record.mem_used_mb).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn row_count(&self) -> Result<i64, HistoryError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metrics")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Clone)]
pub struct HistoryWriter {
    tx: mpsc::Sender<HistoryRecord>,
}

impl HistoryWriter {
    /// Opens the store and starts the writer task. The task exits once every
    /// `HistoryWriter` clone has been dropped.
    pub async fn open(path: &Path) -> Result<(Self, JoinHandle<()>), HistoryError> {
        let store = HistoryStore::open(path).await?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(write_loop(store, rx));
        Ok((Self { tx }, task))
    }

    /// A writer whose queue nobody drains.
    #[cfg(test)]
    pub(crate) fn stalled() -> (Self, mpsc::Receiver<HistoryRecord>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn record(&self, snapshot: &Snapshot) {
        if let Err(err) = self.tx.try_send(HistoryRecord::from_snapshot(snapshot)) {
            debug!(error = %err, "history record dropped");
        }
    }
}

async fn write_loop(store: HistoryStore, mut rx: mpsc::Receiver<HistoryRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(err) = store.insert(&record).await {
            warn!(error = %err, "failed to store history record");
        }
    }
    store.close().await;
    debug!("history writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Cpu, Memory};
    use sqlx::Row;
    use std::time::{Duration, Instant};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aegisd-{}-{name}", std::process::id()))
    }

    fn busy_snapshot() -> Snapshot {
        Snapshot {
            cpu: Cpu {
                global_usage_percent: 12.5,
                ..Default::default()
            },
            memory: Memory {
                used_mb: 2048,
                total_mb: 4096,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stores_one_row_per_record() {
        let path = temp_path("history.db");
        let _ = std::fs::remove_file(&path);

        let (writer, task) = HistoryWriter::open(&path).await.unwrap();
        writer.record(&busy_snapshot());
        writer.record(&busy_snapshot());
        drop(writer);
        task.await.unwrap();

        let store = HistoryStore::open(&path).await.unwrap();
        assert_eq!(store.row_count().await.unwrap(), 2);
        let rows = sqlx::query("SELECT ts, cpu, mem FROM metrics")
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows[0].get::<f64, _>("cpu"), 12.5);
        assert_eq!(rows[0].get::<i64, _>("mem"), 2048);
        let ts: DateTime<Utc> = rows[1].get("ts");
        assert_eq!(ts, Snapshot::default().metadata.timestamp);
        store.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unopenable_path_is_an_error() {
        let path = Path::new("/proc/aegisd/definitely/not/writable.db");
        assert!(matches!(
            HistoryWriter::open(path).await,
            Err(HistoryError::Open { .. })
        ));
    }

    #[test]
    fn full_queue_drops_records_without_blocking() {
        let (writer, rx) = HistoryWriter::stalled();
        let started = Instant::now();
        for _ in 0..QUEUE_CAPACITY + 16 {
            writer.record(&busy_snapshot());
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(writer.tx.capacity(), 0);
        assert_eq!(rx.len(), QUEUE_CAPACITY);
    }
}
