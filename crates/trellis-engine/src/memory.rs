use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Accumulated key/value memory for one run.
///
/// Each node reads its declared inputs from and merges its declared
/// outputs into this map. Keys are strings; values are JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMemory {
    data: HashMap<String, serde_json::Value>,
}

impl RunMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create memory from initial trigger data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge another memory into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &RunMemory) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Declared input keys that are absent from memory.
    pub fn missing_inputs(&self, input_keys: &[String]) -> Vec<String> {
        input_keys
            .iter()
            .filter(|k| !self.data.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Merge a node's output under its declared output keys.
    ///
    /// If the output is a JSON object, each declared key present in the
    /// object is extracted individually; otherwise the whole value is
    /// stored under each declared key.
    pub fn ingest_output(&mut self, output_keys: &[String], output: &serde_json::Value) {
        if output_keys.is_empty() {
            return;
        }

        if let Some(obj) = output.as_object() {
            let mut any = false;
            for key in output_keys {
                if let Some(val) = obj.get(key) {
                    self.data.insert(key.clone(), val.clone());
                    any = true;
                }
            }
            if any {
                return;
            }
        }

        // Fallback: store the whole output under each declared key
        for key in output_keys {
            self.data.insert(key.clone(), output.clone());
        }
    }

    /// The underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> HashMap<String, serde_json::Value> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut mem = RunMemory::new();
        mem.set_str("topic", "graph engines");
        mem.set("count", serde_json::json!(3));

        assert_eq!(mem.get_str("topic"), Some("graph engines"));
        assert_eq!(mem.get("count"), Some(&serde_json::json!(3)));
        assert_eq!(mem.get("missing"), None);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut a = RunMemory::new();
        a.set_str("x", "1");
        a.set_str("y", "2");

        let mut b = RunMemory::new();
        b.set_str("y", "overwritten");
        b.set_str("z", "3");

        a.merge(&b);
        assert_eq!(a.get_str("x"), Some("1"));
        assert_eq!(a.get_str("y"), Some("overwritten"));
        assert_eq!(a.get_str("z"), Some("3"));
    }

    #[test]
    fn test_missing_inputs() {
        let mut mem = RunMemory::new();
        mem.set_str("present", "yes");

        let missing = mem.missing_inputs(&["present".into(), "absent".into(), "gone".into()]);
        assert_eq!(missing, vec!["absent".to_string(), "gone".to_string()]);

        assert!(mem.missing_inputs(&[]).is_empty());
    }

    #[test]
    fn test_ingest_object_output() {
        let mut mem = RunMemory::new();
        let output = serde_json::json!({"findings": "solid", "score": 8});
        mem.ingest_output(&["findings".into(), "score".into()], &output);

        assert_eq!(mem.get_str("findings"), Some("solid"));
        assert_eq!(mem.get("score"), Some(&serde_json::json!(8)));
    }

    #[test]
    fn test_ingest_scalar_output() {
        let mut mem = RunMemory::new();
        mem.ingest_output(&["summary".into()], &serde_json::json!("plain result"));
        assert_eq!(mem.get_str("summary"), Some("plain result"));
    }

    #[test]
    fn test_ingest_object_without_declared_keys_falls_back() {
        let mut mem = RunMemory::new();
        let output = serde_json::json!({"unrelated": true});
        mem.ingest_output(&["wanted".into()], &output);
        assert_eq!(mem.get("wanted"), Some(&output));
    }

    #[test]
    fn test_ingest_empty_keys() {
        let mut mem = RunMemory::new();
        mem.ingest_output(&[], &serde_json::json!("anything"));
        assert!(mem.data().is_empty());
    }
}
