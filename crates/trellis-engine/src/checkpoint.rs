use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use trellis_core::config::RetentionPolicy;
use trellis_core::error::{Result, TrellisError};

use crate::memory::RunMemory;

/// A single checkpoint snapshot.
///
/// Written synchronously relative to the node boundary it represents: no
/// node transition is considered durable until its checkpoint is written.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Run being checkpointed.
    pub run_id: String,
    /// Monotone step counter at which the checkpoint was taken.
    pub step: u64,
    /// The node whose commit this checkpoint represents.
    pub node_id: String,
    /// Node to re-enter on resume. None = traversal complete after this node.
    pub resume_node: Option<String>,
    /// Serialized run memory (JSON).
    pub memory_json: String,
    /// Serialized execution path (JSON).
    pub path_json: String,
    /// Retries consumed so far.
    pub total_retries: u32,
    /// Cumulative token count.
    pub total_tokens: u64,
    /// Cumulative node latency in milliseconds.
    pub total_latency_ms: u64,
    /// When the checkpoint was created.
    pub timestamp: DateTime<Utc>,
}

/// What a resume needs to reconstruct an execution at the node after the
/// checkpointed one, replaying nothing already committed.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub resume_from: Option<String>,
    pub memory: RunMemory,
    pub path: Vec<String>,
    pub step: u64,
    pub total_retries: u32,
    pub total_tokens: u64,
}

/// Persistent checkpoint store backed by SQLite.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
    retention: RetentionPolicy,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         run_id TEXT NOT NULL,
         step INTEGER NOT NULL,
         node_id TEXT NOT NULL,
         resume_node TEXT,
         memory_json TEXT NOT NULL,
         path_json TEXT NOT NULL,
         total_retries INTEGER NOT NULL DEFAULT 0,
         total_tokens INTEGER NOT NULL DEFAULT 0,
         total_latency_ms INTEGER NOT NULL DEFAULT 0,
         timestamp TEXT NOT NULL
     );

     CREATE INDEX IF NOT EXISTS idx_cp_run_step
         ON checkpoints(run_id, step DESC);";

impl CheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path, retention: RetentionPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrellisError::Checkpoint(format!("Failed to create checkpoint directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| TrellisError::Checkpoint(format!("Failed to open store: {}", e)))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n PRAGMA synchronous=NORMAL;\n\n {}",
            SCHEMA
        ))
        .map_err(|e| TrellisError::Checkpoint(format!("Failed to initialize schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            retention,
        })
    }

    /// Open an in-memory store (tests, ephemeral runs).
    pub fn in_memory(retention: RetentionPolicy) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TrellisError::Checkpoint(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Checkpoint(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention,
        })
    }

    /// Save a checkpoint and apply the retention policy.
    ///
    /// Returns the checkpoint's rowid.
    pub fn save(&self, cp: &Checkpoint) -> Result<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Checkpoint(e.to_string()))?;

        conn.execute(
            "INSERT INTO checkpoints
                 (run_id, step, node_id, resume_node, memory_json, path_json,
                  total_retries, total_tokens, total_latency_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                cp.run_id,
                cp.step as i64,
                cp.node_id,
                cp.resume_node,
                cp.memory_json,
                cp.path_json,
                cp.total_retries as i64,
                cp.total_tokens as i64,
                cp.total_latency_ms as i64,
                cp.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| TrellisError::Checkpoint(format!("Failed to save checkpoint: {}", e)))?;

        let id = conn.last_insert_rowid();

        match &self.retention {
            RetentionPolicy::All => {}
            RetentionPolicy::LatestOnly => {
                conn.execute(
                    "DELETE FROM checkpoints WHERE run_id = ?1 AND id != ?2",
                    params![cp.run_id, id],
                )
                .map_err(|e| {
                    TrellisError::Checkpoint(format!("Failed to prune checkpoints: {}", e))
                })?;
            }
            RetentionPolicy::PruneOld { keep } => {
                conn.execute(
                    "DELETE FROM checkpoints WHERE run_id = ?1 AND id NOT IN (
                         SELECT id FROM checkpoints WHERE run_id = ?1
                         ORDER BY step DESC LIMIT ?2
                     )",
                    params![cp.run_id, *keep as i64],
                )
                .map_err(|e| {
                    TrellisError::Checkpoint(format!("Failed to prune checkpoints: {}", e))
                })?;
            }
        }

        Ok(id)
    }

    /// Load the latest checkpoint for a run.
    pub fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Checkpoint(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT run_id, step, node_id, resume_node, memory_json, path_json,
                        total_retries, total_tokens, total_latency_ms, timestamp
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY step DESC
                 LIMIT 1",
            )
            .map_err(|e| TrellisError::Checkpoint(format!("Failed to prepare query: {}", e)))?;

        let result = stmt
            .query_row(params![run_id], |row| {
                let ts_str: String = row.get(9)?;
                Ok(Checkpoint {
                    run_id: row.get(0)?,
                    step: row.get::<_, i64>(1)? as u64,
                    node_id: row.get(2)?,
                    resume_node: row.get(3)?,
                    memory_json: row.get(4)?,
                    path_json: row.get(5)?,
                    total_retries: row.get::<_, i64>(6)? as u32,
                    total_tokens: row.get::<_, i64>(7)? as u64,
                    total_latency_ms: row.get::<_, i64>(8)? as u64,
                    timestamp: DateTime::parse_from_rfc3339(&ts_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            });

        // "No checkpoint" is only the no-rows case; real database failures
        // must not masquerade as an empty store.
        match result {
            Ok(cp) => Ok(Some(cp)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(TrellisError::Checkpoint(format!(
                "Failed to load checkpoint: {}",
                e
            ))),
        }
    }

    /// Number of checkpoints retained for a run.
    pub fn count(&self, run_id: &str) -> Result<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Checkpoint(e.to_string()))?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(|e| TrellisError::Checkpoint(e.to_string()))?;
        Ok(count as u64)
    }

    /// Delete all checkpoints for a run (after successful completion).
    pub fn delete(&self, run_id: &str) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Checkpoint(e.to_string()))?;
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints WHERE run_id = ?1",
                params![run_id],
            )
            .map_err(|e| TrellisError::Checkpoint(format!("Failed to delete: {}", e)))?;
        Ok(deleted)
    }

    /// Convert a checkpoint into the state a resumed execution starts from.
    pub fn to_resume_state(cp: &Checkpoint) -> Result<ResumeState> {
        let memory: RunMemory = serde_json::from_str(&cp.memory_json)
            .map_err(|e| TrellisError::Checkpoint(format!("Corrupt memory snapshot: {}", e)))?;
        let path: Vec<String> = serde_json::from_str(&cp.path_json)
            .map_err(|e| TrellisError::Checkpoint(format!("Corrupt path snapshot: {}", e)))?;

        Ok(ResumeState {
            resume_from: cp.resume_node.clone(),
            memory,
            path,
            step: cp.step,
            total_retries: cp.total_retries,
            total_tokens: cp.total_tokens,
        })
    }
}
