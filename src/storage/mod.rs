use serde::{Deserialize, Serialize};

pub type Term = u64;

/// Zero-based position in the log; `-1` stands for "no entry".
pub type LogIndex = i64;

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub term: Term,
    pub command: String,
}

impl LogEntry {
    pub fn new<C: ToString>(term: Term, command: C) -> LogEntry {
        LogEntry {
            term,
            command: command.to_string(),
        }
    }
}

/// Term, vote and log of a node.
///
/// Everything lives for the lifetime of the process only; there is no recovery after a
/// restart, so none of these operations can fail.
pub trait Storage: Send + 'static {
    fn current_term(&self) -> Term;
    /// Updating the term to a different value forgets the vote cast in the previous term.
    fn set_current_term(&mut self, current_term: Term);
    fn voted_for(&self) -> Option<&str>;
    fn set_voted_for(&mut self, candidate_id: Option<String>);
    fn entries(&self) -> &[LogEntry];
    fn append_entry(&mut self, entry: LogEntry) -> LogIndex;
    /// Drops every entry at `log_index` and after.
    fn remove_entries_starting_at(&mut self, log_index: LogIndex);
    /// Forgets the vote and the whole log. The term is kept.
    fn reset(&mut self);

    fn last_index(&self) -> LogIndex {
        self.entries().len() as LogIndex - 1
    }

    fn last_term(&self) -> Term {
        self.entries().last().map(|e| e.term).unwrap_or(0)
    }

    fn get_entry(&self, log_index: LogIndex) -> Option<&LogEntry> {
        if log_index < 0 {
            return None;
        }
        self.entries().get(log_index as usize)
    }

    fn get_term(&self, log_index: LogIndex) -> Option<Term> {
        self.get_entry(log_index).map(|e| e.term)
    }

    fn entries_from(&self, log_index: LogIndex) -> Vec<LogEntry> {
        let start = log_index.max(0) as usize;
        self.entries().get(start..).map(|entries| entries.to_vec()).unwrap_or_default()
    }
}

pub use memory::MemoryStorage;

mod memory;
