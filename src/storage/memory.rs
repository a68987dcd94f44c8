use super::{ConfigStore, LogStore, TermStore};
use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::raft::{ApplyMeta, Entry, Index, Membership, RaftId, Snapshot, State, Term, NO_INDEX};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// An in-memory log store. Entries are not persisted.
pub struct MemoryLog {
    entries: VecDeque<Entry>,
    base: (Index, Term),
}

impl MemoryLog {
    pub fn new() -> Self {
        Self { entries: VecDeque::new(), base: (NO_INDEX, 0) }
    }

    /// Maps a log index to a position in the entry queue.
    fn position(&self, index: Index) -> Option<usize> {
        let offset = index - self.base.0 - 1;
        (offset >= 0 && (offset as usize) < self.entries.len()).then_some(offset as usize)
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, entry: Entry) -> Result<()> {
        let next = self.last_index() + 1;
        if entry.index != next {
            return Err(Error::InvalidInput(format!(
                "appended index {} must be {next}",
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    fn get(&self, index: Index) -> Result<Option<Entry>> {
        Ok(self.position(index).map(|p| self.entries[p].clone()))
    }

    fn truncate_from(&mut self, index: Index) -> Result<()> {
        let keep = (index - self.base.0 - 1).max(0) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn last_index(&self) -> Index {
        self.base.0 + self.entries.len() as Index
    }

    fn base(&self) -> (Index, Term) {
        self.base
    }

    fn compact(&mut self, index: Index, term: Term) -> Result<()> {
        let remove = (index - self.base.0).clamp(0, self.entries.len() as Index) as usize;
        self.entries.drain(..remove);
        self.base = (index, term);
        Ok(())
    }

    fn reset(&mut self, index: Index, term: Term) -> Result<()> {
        self.entries.clear();
        self.base = (index, term);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory term store. Clones share the same underlying value, which
/// lets tests inspect what a node persisted, or restart a node with it.
#[derive(Clone, Default)]
pub struct MemoryTermStore {
    inner: Arc<Mutex<(Term, Option<RaftId>)>>,
}

impl MemoryTermStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TermStore for MemoryTermStore {
    fn load(&self) -> Result<(Term, Option<RaftId>)> {
        let inner = self.inner.lock().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(*inner)
    }

    fn persist(&mut self, term: Term, voted_for: Option<RaftId>) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|e| Error::Internal(e.to_string()))?;
        *inner = (term, voted_for);
        Ok(())
    }
}

/// An in-memory membership config store.
#[derive(Clone)]
pub struct MemoryConfigStore {
    inner: Arc<Mutex<Membership>>,
}

impl MemoryConfigStore {
    /// Creates a store holding the given initial members.
    pub fn new(members: impl IntoIterator<Item = RaftId>) -> Self {
        Self { inner: Arc::new(Mutex::new(Membership::new(members, NO_INDEX))) }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn current(&self) -> Result<Membership> {
        let inner = self.inner.lock().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(inner.clone())
    }

    fn persist(&mut self, membership: &Membership) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|e| Error::Internal(e.to_string()))?;
        *inner = membership.clone();
        Ok(())
    }
}

/// An in-memory state machine which records applied request payloads in
/// order. Each apply returns the payload's index as the result. Applied
/// requests can also be observed through an optional channel.
pub struct MemoryState {
    applied_index: Index,
    requests: Vec<(Index, Vec<u8>)>,
    applied_tx: Option<crossbeam::channel::Sender<(ApplyMeta, Vec<u8>)>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self { applied_index: NO_INDEX, requests: Vec::new(), applied_tx: None }
    }

    /// Creates a state machine that also sends each applied request to the
    /// given channel.
    pub fn with_channel(applied_tx: crossbeam::channel::Sender<(ApplyMeta, Vec<u8>)>) -> Self {
        Self { applied_tx: Some(applied_tx), ..Self::new() }
    }

    /// Returns the applied request payloads, in order.
    pub fn requests(&self) -> &[(Index, Vec<u8>)] {
        &self.requests
    }
}

impl State for MemoryState {
    fn get_applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, data: Vec<u8>, meta: ApplyMeta) -> Result<Vec<u8>> {
        assert!(meta.index > self.applied_index, "request {} applied twice", meta.index);
        self.applied_index = meta.index;
        self.requests.push((meta.index, data.clone()));
        if let Some(tx) = &self.applied_tx {
            tx.send((meta.clone(), data))?;
        }
        Ok(meta.index.to_be_bytes().to_vec())
    }

    fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot { last_index: self.applied_index, data: bincode::serialize(&self.requests)? })
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        self.requests = bincode::deserialize(&snapshot.data)?;
        self.applied_index = snapshot.last_index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(index: Index, term: Term) -> Entry {
        Entry {
            index,
            term,
            original_type: 1,
            seq_num: index as u64,
            is_weak: false,
            data: vec![index as u8],
        }
    }

    #[test]
    fn log_append_get() -> Result<()> {
        let mut log = MemoryLog::new();
        assert_eq!(log.last_index(), NO_INDEX);
        log.append(entry(0, 1))?;
        log.append(entry(1, 1))?;
        assert!(log.append(entry(3, 1)).is_err());
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.get(1)?, Some(entry(1, 1)));
        assert_eq!(log.get(2)?, None);
        assert_eq!(log.get(NO_INDEX)?, None);
        Ok(())
    }

    #[test]
    fn log_truncate_compact_reset() -> Result<()> {
        let mut log = MemoryLog::new();
        for index in 0..5 {
            log.append(entry(index, 1))?;
        }
        log.truncate_from(3)?;
        assert_eq!(log.last_index(), 2);

        log.compact(1, 1)?;
        assert_eq!(log.base(), (1, 1));
        assert_eq!(log.get(1)?, None);
        assert_eq!(log.get(2)?, Some(entry(2, 1)));
        assert_eq!(log.last_index(), 2);
        log.append(entry(3, 2))?;

        log.reset(10, 3)?;
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.get(3)?, None);
        log.append(entry(11, 3))?;
        assert_eq!(log.get(11)?, Some(entry(11, 3)));
        Ok(())
    }

    #[test]
    fn term_store_shared() -> Result<()> {
        let store = MemoryTermStore::new();
        let mut clone = store.clone();
        clone.persist(3, Some(RaftId::new(2, 1)))?;
        assert_eq!(store.load()?, (3, Some(RaftId::new(2, 1))));
        Ok(())
    }

    #[test]
    fn state_snapshot_restore() -> Result<()> {
        let mut state = MemoryState::new();
        let meta =
            |index| ApplyMeta { index, term: 1, is_weak: false, original_type: 1, seq_num: 0 };
        assert_eq!(state.apply(vec![0x01], meta(1))?, 1i64.to_be_bytes().to_vec());
        state.apply(vec![0x02], meta(3))?;
        let snapshot = state.snapshot()?;
        assert_eq!(snapshot.last_index, 3);

        let mut restored = MemoryState::new();
        restored.restore(snapshot)?;
        assert_eq!(restored.get_applied_index(), 3);
        assert_eq!(restored.requests(), state.requests());
        Ok(())
    }
}
