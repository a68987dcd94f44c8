//! Storage collaborators of the Raft core: the log store, the durable term
//! and vote, and the membership config. The core only depends on the traits
//! here; in-memory and file-backed implementations are provided.

mod file;
mod memory;

pub use file::{FileConfigStore, FileLog, FileTermStore};
pub use memory::{MemoryConfigStore, MemoryLog, MemoryState, MemoryTermStore};

use crate::error::Result;
use crate::raft::{Entry, Index, Membership, RaftId, Term};

/// A log entry store. Entries are contiguous by index, following a base point
/// (the last entry removed by compaction or snapshot installation).
///
/// Writes are only guaranteed durable after calling flush().
pub trait LogStore: Send {
    /// Appends an entry. Its index must be last_index() + 1.
    fn append(&mut self, entry: Entry) -> Result<()>;

    /// Fetches an entry, if it exists.
    fn get(&self, index: Index) -> Result<Option<Entry>>;

    /// Removes all entries at and after the given index.
    fn truncate_from(&mut self, index: Index) -> Result<()>;

    /// Returns the index of the last entry, or the base index if empty.
    fn last_index(&self) -> Index;

    /// Returns the base index and term, (-1, 0) if nothing was ever removed.
    fn base(&self) -> (Index, Term);

    /// Removes all entries up to and including the given index, which becomes
    /// the base.
    fn compact(&mut self, index: Index, term: Term) -> Result<()>;

    /// Removes all entries, and sets the base to the given index and term.
    fn reset(&mut self, index: Index, term: Term) -> Result<()>;

    /// Flushes buffered writes to durable storage.
    fn flush(&mut self) -> Result<()>;
}

/// Durable storage for the current term and vote.
pub trait TermStore: Send {
    /// Loads the persisted term and vote, or (0, None) if none.
    fn load(&self) -> Result<(Term, Option<RaftId>)>;

    /// Durably persists the term and vote. Must not return before the write
    /// is durable, since votes are only granted after this.
    fn persist(&mut self, term: Term, voted_for: Option<RaftId>) -> Result<()>;
}

/// Durable storage for the current membership config.
pub trait ConfigStore: Send {
    /// Returns the current membership config.
    fn current(&self) -> Result<Membership>;

    /// Durably persists a new membership config.
    fn persist(&mut self, membership: &Membership) -> Result<()>;
}
