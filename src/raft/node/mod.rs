mod candidate;
mod follower;
mod leader;
mod snapshot;

use super::{
    code, AppendEntries, AppendEntriesBatch, AppendEntriesReply, ClientRequestReply, Entry,
    EntryKind, Envelope, GroupId, HeartbeatReply, Index, Log, Membership, Message, Ping,
    PreSnapshotReply, RaftId, RequestVoteReply, SnapshotRsp, State, Timeout, TimeoutKind, NO_INDEX,
};
use super::{
    ApplyMeta, ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES, SNAPSHOT_CHUNK_SIZE,
    SNAPSHOT_TIMEOUT,
};
use crate::error::Result;
use crate::storage::{ConfigStore, TermStore};

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

use ::log::{debug, info, warn};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u16;

/// Raft node options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// The maximum number of entries to send in a single append message.
    pub max_append_entries: usize,
    /// The size of snapshot data chunks, in bytes.
    pub snapshot_chunk_size: usize,
    /// The number of ticks without a snapshot acknowledgement before the
    /// transfer is aborted.
    pub snapshot_timeout: Ticks,
    /// The number of applied entries to retain in the log when compacting.
    /// None disables compaction.
    pub log_retention: Option<u64>,
    /// Logs every stepped message at debug level.
    pub trace_messages: bool,
    /// The wall clock in milliseconds, used for reply timestamps and snapshot
    /// transfer identity.
    pub clock: fn() -> i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            max_append_entries: MAX_APPEND_ENTRIES,
            snapshot_chunk_size: SNAPSHOT_CHUNK_SIZE,
            snapshot_timeout: SNAPSHOT_TIMEOUT,
            log_retention: None,
            trace_messages: false,
            clock: wall_clock_ms,
        }
    }
}

/// Returns the wall clock time in milliseconds since the Unix epoch.
pub fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A node's role, for status reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// A node status snapshot, for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: RaftId,
    pub role: NodeRole,
    pub term: Term,
    pub leader: Option<RaftId>,
    pub commit_index: Index,
    pub applied_index: Index,
    pub last_index: Index,
    pub begin_index: Index,
    pub members: Vec<RaftId>,
    /// The match index of each member, as known by the leader. Only set on
    /// leaders.
    pub match_index: BTreeMap<RaftId, Index>,
    /// The current election and heartbeat timer clocks. A Timeout message is
    /// only honored if it carries the current clock value.
    pub election_clock: u64,
    pub heartbeat_clock: u64,
}

/// A Raft node of a single group, with a dynamic role. The node is driven
/// synchronously by processing inbound messages via step() or by advancing
/// time via tick(). These methods consume the current node, and return a new
/// one with a possibly different role. Outbound messages, including client
/// replies, are sent via the given node_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual
/// node logic. It exists for ergonomic use across role transitions, i.e
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader if
    /// it is the only group member. The membership, term and vote are loaded
    /// from the given stores.
    pub fn new(
        id: RaftId,
        log: Log,
        term_store: Box<dyn TermStore>,
        config_store: Box<dyn ConfigStore>,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(id, log, term_store, config_store, state, node_tx, opts)?;
        if node.membership.members == [id] {
            // If there are no peers, become leader immediately.
            return node.into_candidate()?.maybe_win();
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> RaftId {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node's group ID.
    pub fn group_id(&self) -> GroupId {
        self.id().group_id
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Returns the node's status.
    pub fn status(&self) -> Status {
        match self {
            Node::Candidate(n) => n.status(None, BTreeMap::new()),
            Node::Follower(n) => n.status(n.role.leader, BTreeMap::new()),
            Node::Leader(n) => n.status(Some(n.id), n.match_indexes()),
        }
    }

    /// Processes a message.
    pub fn step(self, envelope: Envelope) -> Result<Self> {
        if envelope.group_id != self.group_id() {
            warn!("Dropping message for group {} on group {}", envelope.group_id, self.group_id());
            return Ok(self);
        }
        let msg = envelope.message;
        if self.trace_messages() {
            debug!("Stepping {msg:?}");
        }
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    fn trace_messages(&self) -> bool {
        match self {
            Node::Candidate(n) => n.opts.trace_messages,
            Node::Follower(n) => n.opts.trace_messages,
            Node::Leader(n) => n.opts.trace_messages,
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role: std::fmt::Debug {
    /// The role kind, for status reporting.
    const KIND: NodeRole;
}

/// The outcome of applying a committed entry, used by leaders to reply to
/// waiting clients.
#[derive(Debug)]
struct Applied {
    index: Index,
    seq_num: u64,
    result: Result<Vec<u8>>,
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states (roles)
/// are encoded as RawNode<Role>. See: http://cliffle.com/blog/rust-typestate/
pub struct RawNode<R: Role = Follower> {
    id: RaftId,
    membership: Membership,
    term: Term,
    voted_for: Option<RaftId>,
    log: Log,
    state: Box<dyn State>,
    term_store: Box<dyn TermStore>,
    config_store: Box<dyn ConfigStore>,
    /// The index of the last entry applied, including noop and config entries.
    applied_index: Index,
    /// The lowest peer match index announced by the leader. Bounds follower
    /// log compaction.
    min_match_index: Index,
    election_clock: u64,
    heartbeat_clock: u64,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            membership: self.membership,
            term: self.term,
            voted_for: self.voted_for,
            log: self.log,
            state: self.state,
            term_store: self.term_store,
            config_store: self.config_store,
            applied_index: self.applied_index,
            min_match_index: self.min_match_index,
            election_clock: self.election_clock,
            heartbeat_clock: self.heartbeat_clock,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Durably persists the term and vote, then adopts them. The term store
    /// must be written first, so a crash never loses a granted vote.
    fn persist_term(&mut self, term: Term, voted_for: Option<RaftId>) -> Result<()> {
        assert!(term >= self.term, "Term regression {} → {}", self.term, term);
        self.term_store.persist(term, voted_for)?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Returns the group members other than this node, in order.
    fn peers(&self) -> Vec<RaftId> {
        self.membership.peers_of(self.id).collect()
    }

    /// Sends a message.
    fn send(&self, message: Message) -> Result<()> {
        let envelope = Envelope { group_id: self.id.group_id, message };
        if self.opts.trace_messages {
            debug!("Sending {envelope:?}");
        }
        Ok(self.node_tx.send(envelope)?)
    }

    /// Broadcasts a message to all peers, constructing it for each peer.
    fn broadcast(&self, message: impl Fn(RaftId) -> Message) -> Result<()> {
        // Members are sorted, for test determinism.
        for peer in self.peers() {
            self.send(message(peer))?;
        }
        Ok(())
    }

    /// Replies to a client request.
    fn reply(
        &self,
        seq_num: u64,
        err_code: i32,
        leader_hint: Option<RaftId>,
        data: Vec<u8>,
    ) -> Result<()> {
        self.send(Message::ClientRequestReply(ClientRequestReply {
            seq_num,
            err_code,
            leader_hint,
            data,
        }))
    }

    /// Rejects client requests on a non-leader, returning the believed leader.
    fn reject_requests(&self, message: &Message, leader_hint: Option<RaftId>) -> Result<()> {
        let requests = match message {
            Message::ClientRequest(request) => std::slice::from_ref(request),
            Message::ClientRequestBatch(batch) => batch.requests.as_slice(),
            _ => return Ok(()),
        };
        for request in requests {
            self.reply(request.seq_num, code::NOT_LEADER, leader_hint, vec![])?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Returns the wall clock time in milliseconds.
    fn now(&self) -> i64 {
        (self.opts.clock)()
    }

    /// Returns true if the message was submitted locally rather than sent by
    /// a peer, e.g. a leader transfer request.
    fn is_local(&self, message: &Message) -> bool {
        message.src() == Some(self.id)
    }

    /// Rejects a request from a past term with a reply carrying the current
    /// term, without changing any state. Stale replies are simply dropped.
    fn reject_stale(&self, message: &Message) -> Result<()> {
        debug!("Rejecting message from past term: {message:?}");
        let term = self.term;
        match message {
            Message::RequestVote(m) => self.send(Message::RequestVoteReply(RequestVoteReply {
                src: self.id,
                dest: m.src,
                term,
                vote_granted: false,
            })),
            Message::AppendEntries(AppendEntries { src, prev_log_index, private_term, .. })
            | Message::AppendEntriesBatch(AppendEntriesBatch {
                src,
                prev_log_index,
                private_term,
                ..
            }) => self.send(Message::AppendEntriesReply(AppendEntriesReply {
                src: self.id,
                dest: *src,
                term,
                private_term: *private_term,
                success: false,
                match_index: self.log.get_last_index().0,
                last_send_index: *prev_log_index,
                start_time: self.now(),
            })),
            Message::Heartbeat(m) => self.send(Message::HeartbeatReply(HeartbeatReply {
                src: self.id,
                dest: m.src,
                term,
                private_term: m.private_term,
                start_time: self.now(),
            })),
            Message::PreSnapshot(m) => {
                self.send(Message::PreSnapshotReply(PreSnapshotReply {
                    src: self.id,
                    dest: m.src,
                    term,
                    snap_start: NO_INDEX,
                }))
            }
            Message::SnapshotSend(m) => self.send(Message::SnapshotRsp(SnapshotRsp {
                src: self.id,
                dest: m.src,
                term,
                last_index: m.last_index,
                last_term: m.last_term,
                start_time: m.start_time,
                ack: m.seq,
                code: code::SNAPSHOT_STALE,
                snap_begin_index: NO_INDEX,
            })),
            _ => Ok(()),
        }
    }

    /// Handles messages that are processed the same way by all roles. Returns
    /// the message back if it wasn't handled.
    fn step_common(&mut self, msg: Message) -> Result<Option<Message>> {
        match msg {
            // Answer pings from any node.
            Message::Ping(ping) => {
                let reply = Ping { src: self.id, dest: ping.src, data: ping.data };
                self.send(Message::PingReply(reply))?;
            }

            Message::PingReply(ping) => debug!("Ping reply from {}", ping.src),

            Message::Timeout(Timeout { kind: TimeoutKind::Ping, .. }) => {
                let id = self.id;
                self.broadcast(|peer| Message::Ping(Ping { src: id, dest: peer, data: vec![] }))?;
            }

            // Replies only go to local clients, and are never sent to a node.
            Message::ClientRequestReply(reply) => {
                warn!("Dropping unexpected client reply {reply:?}")
            }

            msg => return Ok(Some(msg)),
        }
        Ok(None)
    }

    /// Checks if a Timeout message belongs to the current arming of the given
    /// timer. Stale timeouts have been cancelled and are ignored.
    fn timeout_is_current(&self, timeout: &Timeout) -> bool {
        let clock = match timeout.kind {
            TimeoutKind::Election => self.election_clock,
            TimeoutKind::Heartbeat => self.heartbeat_clock,
            TimeoutKind::Ping => return true,
        };
        if timeout.logic_clock != clock {
            let (kind, logic_clock) = (timeout.kind, timeout.logic_clock);
            debug!("Ignoring stale {kind:?} timeout (clock {logic_clock} ≠ {clock})");
            return false;
        }
        true
    }

    /// Applies any pending, committed entries. Noop entries only advance the
    /// applied index, config entries replace the membership, and requests are
    /// applied to the state machine. Returns the request outcomes, so leaders
    /// can reply to clients.
    fn maybe_apply(&mut self) -> Result<Vec<Applied>> {
        let commit_index = self.log.get_commit_index();
        let mut applied = Vec::new();
        if self.applied_index >= commit_index {
            return Ok(applied);
        }

        for entry in self.log.scan(self.applied_index + 1, commit_index)? {
            let index = entry.index;
            assert_eq!(index, self.applied_index + 1, "applied entries must be contiguous");
            debug!("Applying {entry:?}");
            match entry.kind()? {
                EntryKind::Noop => {}
                EntryKind::Config(members) => {
                    self.apply_config(Membership::new(members, index))?;
                    applied.push(Applied { index, seq_num: entry.seq_num, result: Ok(vec![]) });
                }
                EntryKind::Request if index <= self.state.get_applied_index() => {
                    debug!("Skipping entry {index} already applied to state machine");
                }
                EntryKind::Request => {
                    let Entry { index, term, original_type, seq_num, is_weak, data } = entry;
                    let meta = ApplyMeta { index, term, is_weak, original_type, seq_num };
                    let result = self.state.apply(data, meta);
                    if let Err(err) = &result {
                        warn!("Failed applying entry {index}: {err}");
                    }
                    applied.push(Applied { index, seq_num, result });
                }
            }
            self.applied_index = index;
        }
        assert_eq!(self.applied_index, commit_index, "commit index entries missing");
        self.maybe_compact()?;
        Ok(applied)
    }

    /// Replaces the membership with a newer config and persists it.
    fn apply_config(&mut self, membership: Membership) -> Result<()> {
        if membership.last_config_index <= self.membership.last_config_index {
            return Ok(());
        }
        let (members, index) = (&membership.members, membership.last_config_index);
        info!("Applying membership config {members:?} at index {index}");
        self.config_store.persist(&membership)?;
        self.membership = membership;
        Ok(())
    }

    /// Compacts the log, retaining the configured number of applied entries.
    /// Followers also retain entries that some peer of the leader still needs.
    fn maybe_compact(&mut self) -> Result<()> {
        let Some(retention) = self.opts.log_retention else {
            return Ok(());
        };
        let mut index = self.applied_index - retention as Index;
        if R::KIND != NodeRole::Leader {
            index = index.min(self.min_match_index);
        }
        if index >= self.log.begin_index() {
            self.log.compact(index)?;
        }
        Ok(())
    }

    fn status(&self, leader: Option<RaftId>, match_index: BTreeMap<RaftId, Index>) -> Status {
        Status {
            id: self.id,
            role: R::KIND,
            term: self.term,
            leader,
            commit_index: self.log.get_commit_index(),
            applied_index: self.applied_index,
            last_index: self.log.get_last_index().0,
            begin_index: self.log.begin_index(),
            members: self.membership.members.clone(),
            match_index,
            election_clock: self.election_clock,
            heartbeat_clock: self.heartbeat_clock,
        }
    }
}

/// Returns the size of a quorum (strict majority), given a total size.
fn quorum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Returns the quorum (median) value of the given unsorted slice, in descending
/// order. The slice cannot be empty.
fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size(values.len()) - 1;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}
