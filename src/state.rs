use std::collections::BTreeMap;

/// The replicated state machine: a plain string map.
#[derive(Debug, Default, Clone)]
pub struct KeyValueStore {
    data: BTreeMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> KeyValueStore {
        KeyValueStore::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    /// `None` means the key was never set (or was deleted), which is not the same as an
    /// empty value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn del(&mut self, key: &str) -> Option<String> {
        self.data.remove(key)
    }

    pub fn append(&mut self, key: &str, value: &str) {
        self.data.entry(key.to_string()).or_default().push_str(value);
    }

    pub fn strlen(&self, key: &str) -> usize {
        self.get(key).map(|v| v.chars().count()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
