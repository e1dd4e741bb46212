use crate::storage::{LogEntry, LogIndex, Storage, Term};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    current_term: Term,
    voted_for: Option<String>,
    entries: Vec<LogEntry>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn current_term(&self) -> Term {
        self.current_term
    }

    fn set_current_term(&mut self, current_term: Term) {
        if current_term != self.current_term {
            self.voted_for = None;
        }
        self.current_term = current_term;
    }

    fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    fn set_voted_for(&mut self, candidate_id: Option<String>) {
        self.voted_for = candidate_id;
    }

    fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    fn append_entry(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.entries.len() as LogIndex - 1
    }

    fn remove_entries_starting_at(&mut self, log_index: LogIndex) {
        self.entries.truncate(log_index.max(0) as usize);
    }

    fn reset(&mut self) {
        self.voted_for = None;
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{LogEntry, MemoryStorage, Storage};

    #[test]
    fn append_entries() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.last_index(), -1);
        assert_eq!(storage.last_term(), 0);

        assert_eq!(storage.append_entry(LogEntry::new(1, "no-op")), 0);
        assert_eq!(storage.append_entry(LogEntry::new(1, "set:a:b")), 1);
        assert_eq!(storage.append_entry(LogEntry::new(2, "del:a")), 2);

        assert_eq!(storage.last_index(), 2);
        assert_eq!(storage.last_term(), 2);
        assert_eq!(storage.get_term(1), Some(1));
        assert_eq!(storage.get_term(-1), None);
        assert_eq!(storage.get_term(3), None);
        assert_eq!(storage.entries_from(1).len(), 2);
        assert!(storage.entries_from(5).is_empty());
    }

    #[test]
    fn term_change_clears_vote() {
        let mut storage = MemoryStorage::new();
        storage.set_current_term(1);
        storage.set_voted_for(Some("n2".to_string()));

        storage.set_current_term(1);
        assert_eq!(storage.voted_for(), Some("n2"));

        storage.set_current_term(2);
        assert_eq!(storage.voted_for(), None);
    }

    #[test]
    fn truncate_and_reset() {
        let mut storage = MemoryStorage::new();
        for _ in 0..4 {
            storage.append_entry(LogEntry::new(1, "no-op"));
        }
        storage.remove_entries_starting_at(2);
        assert_eq!(storage.last_index(), 1);

        storage.set_current_term(3);
        storage.set_voted_for(Some("n1".to_string()));
        storage.reset();
        assert_eq!(storage.last_index(), -1);
        assert_eq!(storage.voted_for(), None);
        assert_eq!(storage.current_term(), 3);
    }
}
