//! Tree-shaped statistics recorder for pipeline runs.
//!
//! Stages record counters, values, and lists under a cursor-addressed path
//! (`enter`/`leave`). The recorder can be created disabled, in which case
//! every operation is a no-op; this keeps stage code free of conditionals.

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
struct StatNode {
    records: BTreeMap<String, Value>,
    children: BTreeMap<String, StatNode>,
}

impl StatNode {
    fn snapshot(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.records {
            map.insert(key.clone(), value.clone());
        }
        for (name, child) in &self.children {
            map.insert(name.clone(), child.snapshot());
        }
        Value::Object(map)
    }
}

/// Records nested counts, values, and timings during a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    enabled: bool,
    root: StatNode,
    cursor: Vec<String>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Create an enabled recorder.
    pub fn new() -> Self {
        Self { enabled: true, root: StatNode::default(), cursor: Vec::new() }
    }

    /// Create a recorder that ignores everything written to it.
    pub fn disabled() -> Self {
        Self { enabled: false, root: StatNode::default(), cursor: Vec::new() }
    }

    /// Whether this recorder actually collects anything.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn current(&mut self) -> &mut StatNode {
        let mut node = &mut self.root;
        for name in &self.cursor {
            node = node.children.entry(name.clone()).or_default();
        }
        node
    }

    /// Descend into (and create if needed) a named child scope.
    pub fn enter(&mut self, name: &str) {
        if self.enabled {
            self.cursor.push(name.to_string());
        }
    }

    /// Return to the parent scope. Leaving the root is a no-op.
    pub fn leave(&mut self) {
        if self.enabled {
            self.cursor.pop();
        }
    }

    /// Record a value under the current scope, replacing any previous value.
    pub fn record(&mut self, key: &str, value: impl Into<Value>) {
        if self.enabled {
            let value = value.into();
            self.current().records.insert(key.to_string(), value);
        }
    }

    /// Increment an integer counter under the current scope.
    pub fn incr(&mut self, key: &str) {
        self.add(key, 1);
    }

    /// Add to an integer counter under the current scope, creating it at 0.
    pub fn add(&mut self, key: &str, amount: i64) {
        if self.enabled {
            let entry = self
                .current()
                .records
                .entry(key.to_string())
                .or_insert_with(|| Value::from(0));
            let current = entry.as_i64().unwrap_or(0);
            *entry = Value::from(current + amount);
        }
    }

    /// Append a value to a list under the current scope, creating it empty.
    pub fn push(&mut self, key: &str, value: impl Into<Value>) {
        if self.enabled {
            let value = value.into();
            let entry = self
                .current()
                .records
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(value);
            }
        }
    }

    /// Produce a lossless snapshot of everything recorded so far.
    pub fn snapshot(&self) -> Value {
        if self.enabled {
            self.root.snapshot()
        } else {
            Value::Object(serde_json::Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_scopes_snapshot_losslessly() {
        let mut stats = Statistics::new();
        stats.record("documents", 3);
        stats.enter("ceo");
        stats.incr("feedback");
        stats.incr("feedback");
        stats.push("thresholds", 0.35);
        stats.push("thresholds", 0.2);
        stats.leave();

        assert_eq!(
            stats.snapshot(),
            json!({
                "documents": 3,
                "ceo": { "feedback": 2, "thresholds": [0.35, 0.2] }
            })
        );
    }

    #[test]
    fn disabled_recorder_collects_nothing() {
        let mut stats = Statistics::disabled();
        stats.enter("scope");
        stats.record("key", 1);
        stats.incr("count");
        assert_eq!(stats.snapshot(), json!({}));
    }

    #[test]
    fn leave_at_root_is_harmless() {
        let mut stats = Statistics::new();
        stats.leave();
        stats.record("ok", true);
        assert_eq!(stats.snapshot(), json!({ "ok": true }));
    }
}
