use serde::{Deserialize, Serialize};

/// An edge connecting two nodes in the execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must hold to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Tie-break when multiple edges leave the same source: lower values
    /// are evaluated first.
    #[serde(default)]
    pub priority: i32,
}

/// Condition for traversing an edge. Evaluation never mutates graph state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Traverse if the source node succeeded.
    #[default]
    OnSuccess,
    /// Traverse if the source node failed.
    OnFailure,
    /// Traverse if a simple expression over run memory matches.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Predicate { expr: String },
    /// Ask the decision engine whether to traverse. The failure policy is
    /// mandatory: graphs must state what happens when no decision can be
    /// made, there is no implicit default.
    Delegate {
        prompt: String,
        on_failure: DelegatePolicy,
    },
}

/// What a delegate edge does when its decision cannot be made (engine
/// absent or erroring).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegatePolicy {
    /// Fail open: traverse the edge anyway.
    Proceed,
    /// Fail closed: do not traverse, keep evaluating other edges.
    Skip,
    /// Abort the run.
    Escalate,
}

impl Edge {
    /// Create an edge that fires on source success.
    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnSuccess,
            priority: 0,
        }
    }

    /// Create an edge that fires on source failure.
    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnFailure,
            priority: 0,
        }
    }

    /// Create a predicate edge.
    pub fn predicate(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Predicate { expr: expr.into() },
            priority: 0,
        }
    }

    /// Create a delegate edge with an explicit failure policy.
    pub fn delegate(
        from: impl Into<String>,
        to: impl Into<String>,
        prompt: impl Into<String>,
        on_failure: DelegatePolicy,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Delegate {
                prompt: prompt.into(),
                on_failure,
            },
            priority: 0,
        }
    }

    /// Set the priority (lower evaluates first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Evaluate a simple predicate expression against run memory.
///
/// Supported expressions:
/// - `key == "value"` for exact match
/// - `key != "value"` for not-equal
/// - `key contains "substr"` for substring match
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_predicate(
    expr: &str,
    memory: &std::collections::HashMap<String, serde_json::Value>,
) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return memory
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return memory
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return memory
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts: Vec<&str> = expr.splitn(2, op).collect();
    if parts.len() != 2 {
        return None;
    }
    let key = parts[0].trim();
    let val = parts[1].trim().trim_matches('"');
    Some((key, val))
}
