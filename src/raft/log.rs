use super::Term;

use serde::{Deserialize, Serialize};

/// A log index. Index 0 holds the sentinel entry.
pub type Index = u64;

/// A log entry: one client write, ordered by its position in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the leader appended the entry.
    pub term: Term,
    /// The key to write.
    pub key: String,
    /// The value to write.
    pub value: String,
    /// The client that submitted the write, for the post-commit ok response.
    pub client_id: String,
    /// The client's message ID for the write.
    pub request_id: String,
}

impl Entry {
    /// Creates an internal entry that carries no client write. Leaders append
    /// one when they assume leadership, to commit entries from previous terms
    /// (see section 8 in the Raft paper). These are never applied to the state
    /// machine and never answered to a client.
    pub fn noop(term: Term) -> Self {
        Self {
            term,
            key: String::new(),
            value: String::new(),
            client_id: String::new(),
            request_id: String::new(),
        }
    }

    /// Returns true if the entry carries no client write.
    pub fn is_noop(&self) -> bool {
        self.request_id.is_empty()
    }
}

/// The replicated log: an ordered sequence of entries, replicated from the
/// leader to followers and applied to the state machine once committed.
///
/// Index 0 holds a synthetic sentinel entry with term 1, which is treated as
/// committed and applied by convention. It exists so that the entry preceding
/// the first real entry always has an index and a term, which keeps the
/// replication consistency check uniform.
///
/// Invariants:
///
/// * The entry at index 0 is the sentinel.
/// * Entry terms never decrease along the log.
/// * Two logs that agree on (index, term) at some position agree on all
///   earlier entries (see section 5.3 in the Raft paper).
///
/// The log is in memory only and dies with the process. Out-of-range index
/// accesses are programmer errors and panic.
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    /// Creates a new log holding only the sentinel.
    pub fn new() -> Self {
        Self { entries: vec![Entry::noop(1)] }
    }

    /// Returns the number of entries, including the sentinel.
    pub fn len(&self) -> Index {
        self.entries.len() as Index
    }

    /// Returns true if the log holds only the sentinel.
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 1
    }

    /// Returns the index of the last entry (0 if only the sentinel).
    pub fn last_index(&self) -> Index {
        self.len() - 1
    }

    /// Returns the term of the last entry.
    pub fn last_term(&self) -> Term {
        self.term_at(self.last_index())
    }

    /// Returns the term of the entry at the given index.
    pub fn term_at(&self, index: Index) -> Term {
        self.entries[index as usize].term
    }

    /// Returns the entry at the given index.
    pub fn entry_at(&self, index: Index) -> &Entry {
        &self.entries[index as usize]
    }

    /// Appends an entry, returning its index. The term must not regress.
    pub fn append(&mut self, entry: Entry) -> Index {
        assert!(entry.term >= self.last_term(), "term regression {} → {}", self.last_term(), entry.term);
        self.entries.push(entry);
        self.last_index()
    }

    /// Replaces the log from the given index onwards with the given entries,
    /// truncating any existing suffix. The sentinel cannot be replaced.
    pub fn truncate_and_extend(&mut self, start: Index, entries: Vec<Entry>) {
        assert!(start >= 1, "can't replace the sentinel");
        assert!(start <= self.len(), "start {} beyond log length {}", start, self.len());
        self.entries.truncate(start as usize);
        self.entries.extend(entries);
    }

    /// Returns a copy of up to limit entries starting at the given index.
    pub fn range(&self, from: Index, limit: usize) -> Vec<Entry> {
        self.entries[from as usize..].iter().take(limit).cloned().collect()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}
