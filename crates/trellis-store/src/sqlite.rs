use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::config::StoreConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::RunStore;
use trellis_core::types::{RunId, RunRecord, RunStatus, RunSummary};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
         id TEXT PRIMARY KEY,
         graph_id TEXT NOT NULL,
         goal TEXT NOT NULL,
         entry_point TEXT NOT NULL,
         status TEXT NOT NULL,
         current_node TEXT NOT NULL,
         path_json TEXT NOT NULL,
         memory_json TEXT NOT NULL,
         total_retries INTEGER NOT NULL DEFAULT 0,
         total_tokens INTEGER NOT NULL DEFAULT 0,
         error TEXT,
         correlation_id TEXT,
         created_at TEXT NOT NULL,
         finished_at TEXT
     );

     CREATE INDEX IF NOT EXISTS idx_runs_goal ON runs(goal);
     CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
     CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);";

struct Inner {
    conn: Mutex<Connection>,
    /// Pending writes, coalesced per run id; newest record wins.
    buffer: Mutex<HashMap<String, RunRecord>>,
    /// Read cache with a freshness deadline per entry.
    cache: Mutex<HashMap<String, (RunRecord, Instant)>>,
    cache_ttl: Duration,
}

/// SQLite-backed run store.
///
/// Writes are buffered and flushed on an interval by a background task;
/// `immediate = true` writes through synchronously (terminal records,
/// anything that must survive a crash). Reads consult the buffer first,
/// then a TTL cache, then the database.
pub struct SqliteRunStore {
    inner: Arc<Inner>,
    flush_interval: Duration,
    cancel: CancellationToken,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SqliteRunStore {
    /// Open or create the store per config (`path = None` is in-memory).
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => {
                let path = Path::new(path);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        TrellisError::Database(format!("Failed to create store directory: {}", e))
                    })?;
                }
                let conn = Connection::open(path)
                    .map_err(|e| TrellisError::Database(format!("Failed to open store: {}", e)))?;
                conn.execute_batch("PRAGMA journal_mode=WAL;\n PRAGMA synchronous=NORMAL;")
                    .map_err(|e| TrellisError::Database(e.to_string()))?;
                conn
            }
            None => Connection::open_in_memory()
                .map_err(|e| TrellisError::Database(e.to_string()))?,
        };

        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                buffer: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                cache_ttl: Duration::from_millis(config.cache_ttl_ms),
            }),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            cancel: CancellationToken::new(),
            flusher: Mutex::new(None),
        })
    }

    /// In-memory store with default tuning (tests, ephemeral runs).
    pub fn in_memory() -> Result<Self> {
        Self::from_config(&StoreConfig::default())
    }

    /// Drain the write buffer into the database in one transaction.
    fn flush(inner: &Inner) -> Result<usize> {
        let pending: Vec<RunRecord> = {
            let mut buffer = inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.drain().map(|(_, record)| record).collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut conn = inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        for record in &pending {
            upsert(&tx, record)?;
        }
        tx.commit()
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        debug!(flushed = pending.len(), "Flushed run records");
        Ok(pending.len())
    }

    fn load_record(&self, id: &RunId) -> Result<Option<RunRecord>> {
        // Freshest state first: pending buffer, then cache, then disk.
        if let Some(record) = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id.0)
        {
            return Ok(Some(record.clone()));
        }

        {
            let cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((record, fetched_at)) = cache.get(&id.0) {
                if fetched_at.elapsed() < self.inner.cache_ttl {
                    return Ok(Some(record.clone()));
                }
            }
        }

        let record = {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare("SELECT * FROM runs WHERE id = ?1")
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            match stmt.query_row(params![id.0], row_to_record) {
                Ok(record) => Some(record),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(TrellisError::Database(e.to_string())),
            }
        };

        if let Some(record) = &record {
            self.inner
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.0.clone(), (record.clone(), Instant::now()));
        }
        Ok(record)
    }

    fn query_summaries(&self, sql: &str, param: Option<&str>) -> Result<Vec<RunSummary>> {
        // Queries must see buffered state too, so flush first.
        Self::flush(&self.inner)?;

        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let rows = match param {
            Some(p) => stmt.query_map(params![p], row_to_record),
            None => stmt.query_map([], row_to_record),
        }
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut summaries = Vec::new();
        for row in rows {
            let record = row.map_err(|e| TrellisError::Database(e.to_string()))?;
            summaries.push(record.summary());
        }
        Ok(summaries)
    }
}

impl RunStore for SqliteRunStore {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.inner);
            let cancel = self.cancel.clone();
            let interval = self.flush_interval;

            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = Self::flush(&inner) {
                                error!(error = %e, "Periodic flush failed");
                            }
                        }
                    }
                }
            });

            *self.flusher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            info!(flush_interval_ms = interval.as_millis() as u64, "Run store started");
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cancel.cancel();
            let handle = self
                .flusher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            // Nothing buffered may be lost at shutdown.
            Self::flush(&self.inner)?;
            info!("Run store stopped");
            Ok(())
        })
    }

    fn save_run(&self, record: &RunRecord, immediate: bool) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            if immediate {
                {
                    let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
                    upsert(&conn, &record)?;
                }
                // The durable row supersedes any buffered version.
                self.inner
                    .buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&record.id.0);
            } else {
                self.inner
                    .buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(record.id.0.clone(), record.clone());
            }

            self.inner
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(record.id.0.clone(), (record, Instant::now()));
            Ok(())
        })
    }

    fn load_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let id = id.clone();
        Box::pin(async move { self.load_record(&id) })
    }

    fn load_summary(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunSummary>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.load_record(&id)?.map(|r| r.summary())) })
    }

    fn delete_run(&self, id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let buffered = self
                .inner
                .buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id.0)
                .is_some();
            self.inner
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id.0);

            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let deleted = conn
                .execute("DELETE FROM runs WHERE id = ?1", params![id.0])
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            Ok(buffered || deleted > 0)
        })
    }

    fn runs_by_goal(&self, goal: &str) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let goal = goal.to_string();
        Box::pin(async move {
            self.query_summaries(
                "SELECT * FROM runs WHERE goal = ?1 ORDER BY created_at DESC",
                Some(&goal),
            )
        })
    }

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            self.query_summaries(
                "SELECT * FROM runs WHERE status = ?1 ORDER BY created_at DESC",
                Some(status.as_str()),
            )
        })
    }

    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        // Paths are stored as JSON arrays of node ids; match the quoted id.
        let pattern = format!("%\"{}\"%", node_id);
        Box::pin(async move {
            self.query_summaries(
                "SELECT * FROM runs WHERE path_json LIKE ?1 ORDER BY created_at DESC",
                Some(&pattern),
            )
        })
    }

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            self.query_summaries("SELECT * FROM runs ORDER BY created_at DESC", None)
        })
    }
}

fn upsert(conn: &Connection, record: &RunRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO runs
             (id, graph_id, goal, entry_point, status, current_node, path_json,
              memory_json, total_retries, total_tokens, error, correlation_id,
              created_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             current_node = excluded.current_node,
             path_json = excluded.path_json,
             memory_json = excluded.memory_json,
             total_retries = excluded.total_retries,
             total_tokens = excluded.total_tokens,
             error = excluded.error,
             finished_at = excluded.finished_at",
        params![
            record.id.0,
            record.graph_id,
            record.goal,
            record.entry_point,
            record.status.as_str(),
            record.current_node,
            serde_json::to_string(&record.path)?,
            serde_json::to_string(&record.memory)?,
            record.total_retries as i64,
            record.total_tokens as i64,
            record.error,
            record.correlation_id,
            record.created_at.to_rfc3339(),
            record.finished_at.map(|t| t.to_rfc3339()),
        ],
    )
    .map_err(|e| TrellisError::Database(format!("Failed to save run: {}", e)))?;
    Ok(())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_str: String = row.get("status")?;
    let path_json: String = row.get("path_json")?;
    let memory_json: String = row.get("memory_json")?;
    let created_str: String = row.get("created_at")?;
    let finished_str: Option<String> = row.get("finished_at")?;

    Ok(RunRecord {
        id: RunId::from_str(&row.get::<_, String>("id")?),
        graph_id: row.get("graph_id")?,
        goal: row.get("goal")?,
        entry_point: row.get("entry_point")?,
        status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
        current_node: row.get("current_node")?,
        path: serde_json::from_str(&path_json).unwrap_or_default(),
        memory: serde_json::from_str(&memory_json).unwrap_or_default(),
        total_retries: row.get::<_, i64>("total_retries")? as u32,
        total_tokens: row.get::<_, i64>("total_tokens")? as u64,
        error: row.get("error")?,
        correlation_id: row.get("correlation_id")?,
        created_at: parse_timestamp(&created_str),
        finished_at: finished_str.as_deref().map(parse_timestamp),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
