use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Node execution errors
    #[error("Node '{node}' execution failed: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Node '{node}' timed out after {timeout_secs}s")]
    NodeTimeout { node: String, timeout_secs: u64 },

    #[error("Node '{node}' rate limited by provider")]
    RateLimited { node: String },

    #[error("Node '{node}' input validation failed, missing keys: {}", keys.join(", "))]
    InputValidation { node: String, keys: Vec<String> },

    #[error("No handler registered for node '{node}' (handler '{handler}')")]
    HandlerNotFound { node: String, handler: String },

    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    // Delegate edge errors
    #[error("No decision engine available for delegate edge {from} -> {to}")]
    DecisionUnavailable { from: String, to: String },

    #[error("Delegate edge {from} -> {to} escalated after decision failure: {message}")]
    DecisionEscalated {
        from: String,
        to: String,
        message: String,
    },

    // Retry errors
    #[error("Retry budget exhausted for run: {consumed}/{ceiling} retries used (last failure at node '{node}')")]
    RetryBudgetExhausted {
        node: String,
        consumed: u32,
        ceiling: u32,
    },

    // Graph errors
    #[error("Invalid graph: {0}")]
    Graph(String),

    // Runtime errors
    #[error("Entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("Max concurrent executions reached ({0})")]
    ConcurrencyLimit(usize),

    #[error("Runtime is already running")]
    AlreadyRunning,

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;

/// Failure classification driving the executor's response to a node error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure, eligible for the run's retry budget.
    Retriable,
    /// Unrecoverable for this node, terminates the run.
    Fatal,
    /// Input/output contract violated, never retried.
    Validation,
    /// A required external collaborator is absent; edge policy governs.
    Dependency,
}

impl ErrorClass {
    pub fn of(err: &TrellisError) -> Self {
        match err {
            TrellisError::NodeTimeout { .. } | TrellisError::RateLimited { .. } => Self::Retriable,
            TrellisError::Io(_) => Self::Retriable,
            TrellisError::NodeExecution { message, .. } => {
                if is_transient(message) {
                    Self::Retriable
                } else {
                    Self::Fatal
                }
            }
            TrellisError::InputValidation { .. } => Self::Validation,
            TrellisError::DecisionUnavailable { .. } => Self::Dependency,
            _ => Self::Fatal,
        }
    }
}

fn is_transient(msg: &str) -> bool {
    msg.contains("429")
        || msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("timeout")
        || msg.contains("connection")
        || msg.contains("transient")
}
