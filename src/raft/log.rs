use crate::proto::LogEntry;

/// The replicated log. Indices are 1-based and contiguous; index 0 stands for
/// "before the first entry" and always has term 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the last log index
    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Get the last log term
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`; `Some(0)` for index 0, `None` past the end.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Get log entry at index (1-indexed)
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Entries from `start_index` (inclusive) to the end of the log.
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(1) - 1;
        if start as usize >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start as usize..].to_vec()
    }

    /// Entries in the inclusive range `[from, to]`, clipped to the log.
    pub fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let from = from.max(1);
        let to = to.min(self.last_index());
        if from > to {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..to as usize].to_vec()
    }

    /// Append a new entry stamped with `term` and return its index.
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            index,
            term,
            command,
        });
        index
    }

    /// Drop the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.max(1) - 1;
        if (keep as usize) < self.entries.len() {
            self.entries.truncate(keep as usize);
        }
    }

    /// Merge entries received from a leader that follow `prev_log_index`.
    ///
    /// Entries already present with a matching term are kept untouched, so a
    /// delayed or duplicated batch never shortens the log. The first entry whose
    /// term disagrees truncates the log from that point before the rest of the
    /// batch is appended. Returns `true` if the log changed.
    pub fn merge(&mut self, prev_log_index: u64, incoming: &[LogEntry]) -> bool {
        let mut changed = false;
        for (offset, entry) in incoming.iter().enumerate() {
            let index = prev_log_index + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => self.truncate_from(index),
                None => {}
            }
            self.entries.push(LogEntry {
                index,
                term: entry.term,
                command: entry.command.clone(),
            });
            changed = true;
        }
        changed
    }

    /// First index holding `term`, scanning back from `from` while the term holds.
    pub fn first_index_of_term(&self, term: u64, from: u64) -> u64 {
        let mut index = from.min(self.last_index());
        while index > 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Last index holding `term`, if any entry carries it.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Check if a candidate's last entry is at least as up-to-date as ours
    pub fn is_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_index())
    }
}
