use super::{Index, Term};
use crate::error::Result;

/// Metadata handed to the state machine along with each applied request.
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyMeta {
    /// The log index of the request.
    pub index: Index,
    /// The term in which the request was appended.
    pub term: Term,
    /// Whether the client request was weak.
    pub is_weak: bool,
    /// The storage engine's original request type.
    pub original_type: u32,
    /// The client sequence number.
    pub seq_num: u64,
}

/// A state machine snapshot, covering all requests applied through
/// last_index.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub last_index: Index,
    pub data: Vec<u8>,
}

/// A Raft-managed state machine, i.e. the storage engine of a group. Raft
/// does not care what the state machine does: it applies opaque request
/// payloads sequentially from the committed log, and hands an opaque result
/// back to the client.
///
/// Since requests are applied identically across all replicas, they must be
/// deterministic and yield the same state and result across all replicas.
pub trait State: Send {
    /// Returns the index of the last request applied by the state machine, or
    /// -1 if none. Noop and config entries never reach the state machine, so
    /// this may trail the node's own applied index.
    fn get_applied_index(&self) -> Index;

    /// Applies a committed request, returning a client result. Errors are
    /// considered applied and returned to the client: the entry remains
    /// committed regardless.
    fn apply(&mut self, data: Vec<u8>, meta: ApplyMeta) -> Result<Vec<u8>>;

    /// Takes a snapshot of the current state.
    fn snapshot(&self) -> Result<Snapshot>;

    /// Replaces the entire state with a snapshot received from the leader.
    /// Must be atomic: on error, the previous state must remain intact.
    fn restore(&mut self, snapshot: Snapshot) -> Result<()>;
}
