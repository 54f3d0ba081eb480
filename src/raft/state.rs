use super::Entry;

use std::collections::HashMap;

/// The replicated state machine: a key/value mapping, mutated only by
/// applying committed log entries in index order. In memory only.
pub struct KeyValue {
    data: HashMap<String, String>,
}

impl KeyValue {
    /// Creates an empty state machine.
    pub fn new() -> Self {
        Self { data: HashMap::new() }
    }

    /// Applies a log entry, writing its key/value pair.
    pub fn apply(&mut self, entry: &Entry) {
        self.data.insert(entry.key.clone(), entry.value.clone());
    }

    /// Returns the value for a key, or the empty string if absent.
    pub fn lookup(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }
}

impl Default for KeyValue {
    fn default() -> Self {
        Self::new()
    }
}
