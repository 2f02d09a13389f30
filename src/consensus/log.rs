//! The replicated operation log.
//!
//! The log is an ordered sequence of entries, each holding the term under
//! which it was appended and an opaque operation supplied by the host. An
//! entry's position is its identity: indexes are 1-based and contiguous, with
//! 0 meaning "before the first entry". There is no durable storage -- the log
//! lives in memory and is reconstructed from the leader after a restart.
//!
//! In the steady state the log is append-only. Uncommitted tail entries may
//! be truncated and replaced when a follower discovers they conflict with a
//! new leader's log. Committed entries are immutable, and each is executed
//! (applied to the host state machine) exactly once, in index order, tracked
//! by a per-entry executed flag. Removing an executed entry would un-apply
//! history that the host has already observed, so it panics: it means the
//! protocol implementation itself is broken.

use super::node::Term;

use serde::{Deserialize, Serialize};

/// A log index. 1-based; 0 indicates no entry.
pub type Index = u64;

/// A log entry. The index is not stored: an entry's position in the log is
/// its index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was appended.
    pub term: Term,
    /// The opaque host operation to replicate.
    pub operation: Vec<u8>,
}

/// A stored entry and its execution state.
#[derive(Clone, Debug, PartialEq)]
struct Stored {
    entry: Entry,
    /// Whether the entry has been applied to the host state machine. Set
    /// exactly once, when the commit index first reaches the entry.
    executed: bool,
}

/// The replicated log and commit index of a single node.
#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<Stored>,
    /// The highest committed index. Never decreases, and never exceeds the
    /// log size.
    commit_index: Index,
}

impl Log {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self { entries: Vec::new(), commit_index: 0 }
    }

    /// The number of stored entries, which is also the last index.
    pub fn size(&self) -> Index {
        self.entries.len() as Index
    }

    /// The highest committed index.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// The last index and term, or (0, 0) if the log is empty.
    pub fn last(&self) -> (Index, Term) {
        match self.entries.last() {
            Some(stored) => (self.size(), stored.entry.term),
            None => (0, 0),
        }
    }

    /// The term of the entry at the given index. Index 0 is the empty
    /// prefix with term 0; indexes beyond the log are unknown (None).
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|stored| stored.entry.term)
    }

    /// The entry at the given index, if stored.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1).map(|stored| &stored.entry)
    }

    /// Whether the entry at the given index has been executed.
    pub fn is_executed(&self, index: Index) -> bool {
        index >= 1 && self.entries.get(index as usize - 1).is_some_and(|s| s.executed)
    }

    /// Appends an entry, returning its index. Terms must be positive and
    /// non-decreasing.
    pub fn append(&mut self, entry: Entry) -> Index {
        assert!(entry.term > 0, "appended entry has term 0");
        let (_, last_term) = self.last();
        assert!(entry.term >= last_term, "term regression {last_term} -> {}", entry.term);
        self.entries.push(Stored { entry, executed: false });
        self.size()
    }

    /// Removes all entries at and after the given index. Only uncommitted,
    /// unexecuted entries may be removed; anything else is a fatal protocol
    /// integrity violation.
    pub fn truncate_from(&mut self, index: Index) {
        assert!(index >= 1, "can't truncate from index 0");
        assert!(
            index > self.commit_index,
            "truncating committed entry {index} (commit index {})",
            self.commit_index
        );
        for (offset, stored) in self.entries[index as usize - 1..].iter().enumerate() {
            assert!(!stored.executed, "truncating executed entry {}", index + offset as Index);
        }
        self.entries.truncate(index as usize - 1);
    }

    /// Advances the commit index to the given index, executing every newly
    /// committed entry exactly once, in index order, via the given callback.
    /// Regressions are ignored (commit indexes from stale leaders may lag);
    /// the index must not exceed the log size.
    pub fn commit_to(&mut self, index: Index, mut execute: impl FnMut(Index, &Entry)) -> Index {
        assert!(index <= self.size(), "commit index {index} beyond log size {}", self.size());
        if index <= self.commit_index {
            return self.commit_index;
        }
        for i in self.commit_index + 1..=index {
            let stored = &mut self.entries[i as usize - 1];
            assert!(!stored.executed, "entry {i} executed before commit");
            stored.executed = true;
            execute(i, &stored.entry);
        }
        self.commit_index = index;
        self.commit_index
    }

    /// Clones the entries at and after the given index, for replication.
    pub fn entries_from(&self, from: Index) -> Vec<Entry> {
        assert!(from >= 1, "entries_from index must be positive");
        if from > self.size() {
            return Vec::new();
        }
        self.entries[from as usize - 1..].iter().map(|stored| stored.entry.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(term: Term, operation: &str) -> Entry {
        Entry { term, operation: operation.as_bytes().to_vec() }
    }

    #[test]
    fn append_and_lookup() {
        let mut log = Log::new();
        assert_eq!(log.last(), (0, 0));
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);

        assert_eq!(log.append(entry(1, "a")), 1);
        assert_eq!(log.append(entry(1, "b")), 2);
        assert_eq!(log.append(entry(2, "c")), 3);

        assert_eq!(log.size(), 3);
        assert_eq!(log.last(), (3, 2));
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(4), None);
        assert_eq!(log.get(2), Some(&entry(1, "b")));
        assert_eq!(log.entries_from(2), vec![entry(1, "b"), entry(2, "c")]);
        assert_eq!(log.entries_from(4), vec![]);
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn append_term_regression_panics() {
        let mut log = Log::new();
        log.append(entry(2, "a"));
        log.append(entry(1, "b"));
    }

    #[test]
    fn commit_executes_in_order_exactly_once() {
        let mut log = Log::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));
        log.append(entry(1, "c"));

        let mut executed = Vec::new();
        log.commit_to(2, |index, entry| executed.push((index, entry.operation.clone())));
        assert_eq!(executed, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
        assert_eq!(log.commit_index(), 2);
        assert!(log.is_executed(2));
        assert!(!log.is_executed(3));

        // Replaying the same commit is a no-op: nothing executes twice.
        let mut replayed = Vec::new();
        log.commit_to(2, |index, _| replayed.push(index));
        assert_eq!(replayed, Vec::<Index>::new());

        // A regressed commit index is ignored.
        log.commit_to(1, |index, _| replayed.push(index));
        assert_eq!(replayed, Vec::<Index>::new());
        assert_eq!(log.commit_index(), 2);
    }

    #[test]
    fn truncate_uncommitted_tail() {
        let mut log = Log::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));
        log.append(entry(2, "c"));
        log.commit_to(1, |_, _| {});

        log.truncate_from(2);
        assert_eq!(log.size(), 1);
        assert_eq!(log.last(), (1, 1));

        // Replacing the tail at a later term is fine.
        log.append(entry(3, "d"));
        assert_eq!(log.last(), (2, 3));
    }

    #[test]
    #[should_panic(expected = "truncating committed entry")]
    fn truncate_committed_panics() {
        let mut log = Log::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));
        log.commit_to(2, |_, _| {});
        log.truncate_from(2);
    }

    #[test]
    #[should_panic(expected = "beyond log size")]
    fn commit_beyond_log_panics() {
        let mut log = Log::new();
        log.append(entry(1, "a"));
        log.commit_to(2, |_, _| {});
    }
}
