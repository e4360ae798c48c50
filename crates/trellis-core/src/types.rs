use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal and in-flight states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Paused,
    Cancelled,
}

impl RunStatus {
    /// Whether the run can no longer make progress without outside action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// What a node handler produced.
///
/// A handler that completes with `success = false` is a committed node
/// result (on-failure edges react to it); a handler that returns `Err`
/// is a node error subject to classification and the retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutcome {
    #[serde(default = "default_outcome_success")]
    pub success: bool,
    /// Handler output. A JSON object allows per-key extraction into run
    /// memory; any other value is stored whole under each declared key.
    pub output: serde_json::Value,
    /// Human-readable error when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
    /// Tokens consumed by the handler (0 for non-LLM nodes).
    #[serde(default)]
    pub tokens_used: u64,
    /// Handler-reported latency in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_outcome_success() -> bool {
    true
}

impl NodeOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self::json(serde_json::Value::String(output.into()))
    }

    pub fn json(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            tokens_used: 0,
            latency_ms: 0,
        }
    }

    /// A completed-but-unsuccessful result (routes to on-failure edges).
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            tokens_used: 0,
            latency_ms: 0,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// Context handed to a node handler for one invocation.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: String,
    /// Keys this node declared as input; all are present in `memory`.
    pub input_keys: Vec<String>,
    /// Keys this node is expected to produce.
    pub output_keys: Vec<String>,
    /// Snapshot of accumulated run memory.
    pub memory: HashMap<String, serde_json::Value>,
}

impl NodeContext {
    /// Fetch a declared input value.
    pub fn input(&self, key: &str) -> Option<&serde_json::Value> {
        self.memory.get(key)
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.memory.get(key).and_then(|v| v.as_str())
    }
}

/// Final, user-visible result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub success: bool,
    pub status: RunStatus,
    /// Nodes visited, in commit order. Retried nodes appear once per attempt.
    pub path: Vec<String>,
    /// Final memory snapshot.
    pub memory: HashMap<String, serde_json::Value>,
    /// Human-readable error when `success` is false.
    pub error: Option<String>,
    pub total_retries: u32,
    pub total_tokens: u64,
    pub elapsed_ms: u64,
}

/// Durable form of a run, as written to the persistence backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub graph_id: String,
    pub goal: String,
    pub entry_point: String,
    pub status: RunStatus,
    pub current_node: String,
    pub path: Vec<String>,
    pub memory: HashMap<String, serde_json::Value>,
    pub total_retries: u32,
    pub total_tokens: u64,
    pub error: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lightweight listing form of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub goal: String,
    pub entry_point: String,
    pub status: RunStatus,
    pub current_node: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            goal: self.goal.clone(),
            entry_point: self.entry_point.clone(),
            status: self.status,
            current_node: self.current_node.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// A lifecycle event broadcast to all subscribers.
///
/// Fire-and-forget: publishing is never part of the execution's
/// correctness path.
#[derive(Debug, Clone)]
pub struct ExecEvent {
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    pub kind: ExecEventKind,
}

impl ExecEvent {
    pub fn now(run_id: RunId, kind: ExecEventKind) -> Self {
        Self {
            run_id,
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExecEventKind {
    /// A run started traversal.
    RunStarted { entry_point: String },
    /// A run reached a terminal state.
    RunCompleted { success: bool, total_retries: u32 },
    /// A run stopped at a pause node.
    RunPaused { node_id: String },
    /// Node dispatch began.
    NodeStarted { node_id: String },
    /// Node committed successfully.
    NodeCompleted { node_id: String, latency_ms: u64 },
    /// Node invocation failed (before any retry decision).
    NodeError { node_id: String, error: String },
    /// A delegate or predicate edge was evaluated.
    DecisionMade { from: String, to: String, taken: bool },
    /// The retry controller granted a retry.
    RetryScheduled {
        node_id: String,
        retry_index: u32,
        delay_ms: u64,
    },
    /// A checkpoint was committed.
    CheckpointSaved { step: u64, node_id: String },
}
