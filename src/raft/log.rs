use super::{ClientRequest, RaftId, Term};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::storage::LogStore;

use log::debug;
use serde::{Deserialize, Serialize};

/// A log index. The first entry has index 0, and -1 indicates no entry.
pub type Index = i64;

/// Indicates the absence of a log entry, e.g. the base of an empty log.
pub const NO_INDEX: Index = -1;

/// The original request type of noop entries, appended by new leaders to
/// commit entries from previous terms (see section 5.4.2 in the Raft paper).
pub const ORIGINAL_TYPE_NOOP: u32 = u32::MAX;

/// The original request type of membership config change entries. The data
/// is a Bincode-encoded list of members.
pub const ORIGINAL_TYPE_CONFIG_CHANGE: u32 = u32::MAX - 1;

/// A log entry. The payload is opaque to Raft, and handed to the state
/// machine along with the request metadata once committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The storage engine's request type, or one of the reserved types.
    pub original_type: u32,
    /// The client sequence number, for reply correlation.
    pub seq_num: u64,
    /// Whether the client request was weak.
    pub is_weak: bool,
    /// The request payload.
    pub data: Vec<u8>,
}

/// What an entry does when applied.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryKind {
    Noop,
    Config(Vec<RaftId>),
    Request,
}

impl Entry {
    /// Creates a log entry for a client request.
    pub fn from_request(index: Index, term: Term, request: ClientRequest) -> Self {
        Self {
            index,
            term,
            original_type: request.original_type,
            seq_num: request.seq_num,
            is_weak: request.is_weak,
            data: request.data,
        }
    }

    /// Creates a noop entry.
    pub fn noop(index: Index, term: Term) -> Self {
        Self::from_request(index, term, noop_request())
    }

    /// Classifies the entry.
    pub fn kind(&self) -> Result<EntryKind> {
        Ok(match self.original_type {
            ORIGINAL_TYPE_NOOP => EntryKind::Noop,
            ORIGINAL_TYPE_CONFIG_CHANGE => EntryKind::Config(Vec::<RaftId>::decode(&self.data)?),
            _ => EntryKind::Request,
        })
    }
}

/// Returns a noop client request, used for leader noop entries.
pub fn noop_request() -> ClientRequest {
    ClientRequest { original_type: ORIGINAL_TYPE_NOOP, seq_num: 0, is_weak: false, data: vec![] }
}

/// Returns a config change client request for the given members.
pub fn config_change_request(seq_num: u64, members: &[RaftId]) -> Result<ClientRequest> {
    Ok(ClientRequest {
        original_type: ORIGINAL_TYPE_CONFIG_CHANGE,
        seq_num,
        is_weak: false,
        data: encoding::bincode::serialize(&members)?,
    })
}

impl encoding::Value for RaftId {}

/// The Raft log stores a sequence of client requests that are replicated
/// across the group's nodes and applied sequentially to the local state
/// machine. For example:
///
/// Index | Term | Request
/// ------|------|---------------------------------
///   0   |   1  | noop
///   1   |   1  | submit rows to table block 17
///   2   |   1  | config change: members {1, 2, 3}
///   3   |   2  | noop
///   4   |   2  | submit rows to table block 18
///
/// The log only retains a window of entries: once applied, a prefix may be
/// compacted away, or replaced wholesale by an installed snapshot. The last
/// removed entry's index and term are kept as the log's base (snapshot point),
/// so consistency checks against it still succeed.
///
/// The log wraps an external [`LogStore`], caching the last index and term.
/// The commit index is kept in memory only: it is recovered from a log quorum
/// after restarts, since entries are only committed once durable on a quorum.
///
/// Invariants:
///
/// * Entry indexes are contiguous from the base (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * Committed entries are never changed or removed, except by compaction.
/// * If two logs contain a matching index/term, all previous entries are
///   identical (see section 5.3 in the Raft paper).
pub struct Log {
    store: Box<dyn LogStore>,
    last_index: Index,
    last_term: Term,
    commit_index: Index,
}

impl Log {
    /// Initializes a log using the given store.
    pub fn new(store: Box<dyn LogStore>) -> Result<Self> {
        let (base_index, base_term) = store.base();
        let last_index = store.last_index();
        let last_term = if last_index == base_index {
            base_term
        } else {
            match store.get(last_index)? {
                Some(entry) => entry.term,
                None => return Err(Error::InvalidData(format!("missing last entry {last_index}"))),
            }
        };
        // Everything up to the base has been applied, and is thus committed.
        Ok(Self { store, last_index, last_term, commit_index: base_index })
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the commit index.
    pub fn get_commit_index(&self) -> Index {
        self.commit_index
    }

    /// Returns the base index and term: the last entry removed by compaction
    /// or snapshot installation, or (-1, 0) if none.
    pub fn get_base(&self) -> (Index, Term) {
        self.store.base()
    }

    /// Returns the index of the first retained entry.
    pub fn begin_index(&self) -> Index {
        self.store.base().0 + 1
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Result<Option<Entry>> {
        if index < self.begin_index() || index > self.last_index {
            return Ok(None);
        }
        self.store.get(index)
    }

    /// Returns the term of the entry at the given index, if it is known. This
    /// includes the base entry, and the empty base (-1, 0).
    pub fn term_at(&self, index: Index) -> Result<Option<Term>> {
        let (base_index, base_term) = self.store.base();
        if index == base_index {
            return Ok(Some(base_term));
        }
        if index == NO_INDEX {
            return Ok(Some(0));
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Checks if the log contains an entry with the given index and term. The
    /// empty base (-1, 0) is always contained.
    pub fn has(&self, index: Index, term: Term) -> Result<bool> {
        if index > self.last_index {
            return Ok(false);
        }
        Ok(self.term_at(index)? == Some(term))
    }

    /// Appends client requests to the log at the given term as a single write,
    /// returning the index of the last appended entry.
    pub fn append(&mut self, term: Term, requests: Vec<ClientRequest>) -> Result<Index> {
        assert!(term >= self.last_term, "append term regression {} → {}", self.last_term, term);
        for request in requests {
            let entry = Entry::from_request(self.last_index + 1, term, request);
            self.store.append(entry)?;
            self.last_index += 1;
            self.last_term = term;
        }
        self.store.flush()?;
        Ok(self.last_index)
    }

    /// Commits entries up to and including the given index. Lower indexes are
    /// ignored, since the commit index never regresses.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index <= self.commit_index {
            return Ok(self.commit_index);
        }
        assert!(index <= self.last_index, "commit index {index} beyond last index");
        self.commit_index = index;
        Ok(index)
    }

    /// Returns the entries in the given inclusive index range. Entries outside
    /// of the retained window are skipped.
    pub fn scan(&self, from: Index, to: Index) -> Result<Vec<Entry>> {
        let from = from.max(self.begin_index());
        let to = to.min(self.last_index);
        let mut entries = Vec::with_capacity((to - from + 1).max(0) as usize);
        for index in from..=to {
            match self.store.get(index)? {
                Some(entry) => entries.push(entry),
                None => return Err(Error::InvalidData(format!("missing log entry {index}"))),
            }
        }
        Ok(entries)
    }

    /// Removes all entries at and after the given index. Committed entries
    /// can't be removed.
    pub fn truncate_from(&mut self, index: Index) -> Result<()> {
        if index > self.last_index {
            return Ok(());
        }
        assert!(index > self.commit_index, "truncation of committed index {index}");
        debug!("Truncating log from index {index}");
        let (base_index, base_term) = self.store.base();
        let last_term = match index - 1 {
            prev if prev == base_index => base_term,
            prev => match self.store.get(prev)? {
                Some(entry) => entry.term,
                None => return Err(Error::InvalidData(format!("missing entry {prev}"))),
            },
        };
        self.store.truncate_from(index)?;
        self.store.flush()?;
        self.last_index = index - 1;
        self.last_term = last_term;
        Ok(())
    }

    /// Splices a set of contiguous entries into the log, following the entry
    /// at base_index. Entries already present with the same term are skipped.
    /// At the first entry whose term conflicts with the existing log, the log
    /// is truncated and the remaining entries appended. Entries at or below
    /// the log base are already committed and skipped.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            return Err(Error::InvalidInput("spliced entries are not contiguous".into()));
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            return Err(Error::InvalidInput("spliced entries have term regression".into()));
        }

        let base_index = self.store.base().0;
        let mut entries = entries.into_iter().skip_while(|e| e.index <= base_index).peekable();
        if let Some(first) = entries.peek() {
            if first.index > self.last_index + 1 {
                return Err(Error::InvalidInput(format!(
                    "spliced index {} does not touch last index {}",
                    first.index, self.last_index
                )));
            }
        }

        // Skip entries that are already in the log.
        while let Some(entry) = entries.peek() {
            match self.term_at(entry.index)? {
                Some(term) if term == entry.term && entry.index <= self.last_index => {
                    entries.next();
                }
                _ => break,
            }
        }

        // Truncate any conflicting tail and append the rest.
        let Some(first) = entries.peek() else {
            return Ok(self.last_index);
        };
        if first.index <= self.last_index {
            self.truncate_from(first.index)?;
        }
        for entry in entries {
            let (index, term) = (entry.index, entry.term);
            self.store.append(entry)?;
            self.last_index = index;
            self.last_term = term;
        }
        self.store.flush()?;
        Ok(self.last_index)
    }

    /// Compacts the log, removing all entries up to and including the given
    /// index, which must be applied.
    pub fn compact(&mut self, index: Index) -> Result<()> {
        if index < self.begin_index() {
            return Ok(());
        }
        assert!(index <= self.commit_index, "compaction of uncommitted index {index}");
        let term = match self.term_at(index)? {
            Some(term) => term,
            None => return Err(Error::InvalidData(format!("missing entry {index}"))),
        };
        debug!("Compacting log through index {index}");
        self.store.compact(index, term)?;
        self.store.flush()
    }

    /// Installs a snapshot point. If the log already contains the snapshot's
    /// last entry, the log is compacted through it and any following entries
    /// are retained. Otherwise, the entire log is discarded.
    pub fn install_snapshot(&mut self, last_index: Index, last_term: Term) -> Result<()> {
        if self.has(last_index, last_term)? {
            self.commit(last_index)?;
            return self.compact(last_index);
        }
        self.store.reset(last_index, last_term)?;
        self.store.flush()?;
        self.last_index = last_index;
        self.last_term = last_term;
        self.commit_index = self.commit_index.max(last_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLog;
    use pretty_assertions::assert_eq;

    fn request(data: &[u8]) -> ClientRequest {
        ClientRequest { original_type: 1, seq_num: 0, is_weak: false, data: data.to_vec() }
    }

    fn entry(index: Index, term: Term, data: &[u8]) -> Entry {
        Entry::from_request(index, term, request(data))
    }

    fn setup() -> Result<Log> {
        let mut log = Log::new(Box::new(MemoryLog::new()))?;
        log.append(1, vec![request(b"a"), request(b"b")])?;
        log.append(2, vec![request(b"c")])?;
        Ok(log)
    }

    #[test]
    fn new_empty() -> Result<()> {
        let log = Log::new(Box::new(MemoryLog::new()))?;
        assert_eq!(log.get_last_index(), (NO_INDEX, 0));
        assert_eq!(log.get_commit_index(), NO_INDEX);
        assert_eq!(log.begin_index(), 0);
        assert!(log.has(NO_INDEX, 0)?);
        assert!(!log.has(0, 0)?);
        Ok(())
    }

    #[test]
    fn append() -> Result<()> {
        let log = setup()?;
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get(1)?, Some(entry(1, 1, b"b")));
        assert_eq!(log.get(3)?, None);
        assert!(log.has(0, 1)?);
        assert!(!log.has(0, 2)?);
        Ok(())
    }

    #[test]
    fn commit_never_regresses() -> Result<()> {
        let mut log = setup()?;
        assert_eq!(log.commit(1)?, 1);
        assert_eq!(log.commit(0)?, 1);
        assert_eq!(log.get_commit_index(), 1);
        Ok(())
    }

    #[test]
    fn splice_append() -> Result<()> {
        let mut log = setup()?;
        assert_eq!(log.splice(vec![entry(3, 2, b"d"), entry(4, 3, b"e")])?, 4);
        assert_eq!(log.get_last_index(), (4, 3));
        Ok(())
    }

    #[test]
    fn splice_overlap_keeps_matching() -> Result<()> {
        let mut log = setup()?;
        assert_eq!(log.splice(vec![entry(1, 1, b"b"), entry(2, 2, b"c")])?, 2);
        assert_eq!(log.scan(0, 2)?, vec![entry(0, 1, b"a"), entry(1, 1, b"b"), entry(2, 2, b"c")]);
        Ok(())
    }

    #[test]
    fn splice_replaces_conflict() -> Result<()> {
        let mut log = setup()?;
        assert_eq!(log.splice(vec![entry(1, 1, b"b"), entry(2, 3, b"x")])?, 2);
        assert_eq!(log.get(2)?, Some(entry(2, 3, b"x")));
        assert_eq!(log.get_last_index(), (2, 3));
        Ok(())
    }

    #[test]
    fn splice_keeps_tail_without_conflict() -> Result<()> {
        let mut log = setup()?;
        assert_eq!(log.splice(vec![entry(1, 1, b"b")])?, 2);
        assert_eq!(log.get_last_index(), (2, 2));
        Ok(())
    }

    #[test]
    fn splice_gap_errors() -> Result<()> {
        let mut log = setup()?;
        assert!(log.splice(vec![entry(5, 2, b"x")]).is_err());
        Ok(())
    }

    #[test]
    fn truncate_from() -> Result<()> {
        let mut log = setup()?;
        log.truncate_from(1)?;
        assert_eq!(log.get_last_index(), (0, 1));
        assert_eq!(log.get(1)?, None);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "truncation of committed index")]
    fn truncate_committed_panics() {
        let mut log = setup().unwrap();
        log.commit(1).unwrap();
        log.truncate_from(1).unwrap();
    }

    #[test]
    fn compact() -> Result<()> {
        let mut log = setup()?;
        log.commit(2)?;
        log.compact(1)?;
        assert_eq!(log.begin_index(), 2);
        assert_eq!(log.get_base(), (1, 1));
        assert_eq!(log.get(1)?, None);
        assert!(log.has(1, 1)?);
        assert_eq!(log.scan(0, 2)?, vec![entry(2, 2, b"c")]);
        Ok(())
    }

    #[test]
    fn install_snapshot_discards_divergent_log() -> Result<()> {
        let mut log = setup()?;
        log.install_snapshot(7, 4)?;
        assert_eq!(log.get_last_index(), (7, 4));
        assert_eq!(log.get_commit_index(), 7);
        assert_eq!(log.begin_index(), 8);
        assert!(log.has(7, 4)?);
        Ok(())
    }

    #[test]
    fn install_snapshot_retains_suffix() -> Result<()> {
        let mut log = setup()?;
        log.install_snapshot(1, 1)?;
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get_commit_index(), 1);
        assert_eq!(log.begin_index(), 2);
        Ok(())
    }

    #[test]
    fn entry_kind() -> Result<()> {
        assert_eq!(Entry::noop(0, 1).kind()?, EntryKind::Noop);
        let members = vec![RaftId::new(1, 1), RaftId::new(2, 1)];
        let config = Entry::from_request(1, 1, config_change_request(7, &members)?);
        assert_eq!(config.kind()?, EntryKind::Config(members));
        assert_eq!(entry(2, 1, b"x").kind()?, EntryKind::Request);
        Ok(())
    }
}
