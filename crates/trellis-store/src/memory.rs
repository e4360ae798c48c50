use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::RunStore;
use trellis_core::types::{RunId, RunRecord, RunStatus, RunSummary};

/// In-process run store with no durability; for tests and embedding
/// without a database file.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filter(&self, pred: impl Fn(&RunRecord) -> bool) -> Vec<RunSummary> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<&RunRecord> = runs.values().filter(|r| pred(r)).collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.into_iter().map(|r| r.summary()).collect()
    }
}

impl RunStore for MemoryRunStore {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn save_run(&self, record: &RunRecord, _immediate: bool) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(record.id.0.clone(), record);
            Ok(())
        })
    }

    fn load_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&id.0)
                .cloned())
        })
    }

    fn load_summary(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunSummary>>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&id.0)
                .map(|r| r.summary()))
        })
    }

    fn delete_run(&self, id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id.0)
                .is_some())
        })
    }

    fn runs_by_goal(&self, goal: &str) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let goal = goal.to_string();
        Box::pin(async move { Ok(self.filter(|r| r.goal == goal)) })
    }

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move { Ok(self.filter(|r| r.status == status)) })
    }

    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let node_id = node_id.to_string();
        Box::pin(async move { Ok(self.filter(|r| r.path.iter().any(|n| n == &node_id))) })
    }

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move { Ok(self.filter(|_| true)) })
    }
}
