//! Implements Raft replication for storage groups.
//!
//! For details on the protocol itself, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//!
//! The database shards its data into storage groups, identified by a group ID.
//! Each group is replicated across a fixed set of nodes by an independent Raft
//! instance, which agrees on an ordered write log and applies it to the
//! group's storage engine (the state machine). A node process typically hosts
//! many groups, each driven by its own decision loop thread. Groups share
//! nothing but the transport.
//!
//! A group member is identified by a `RaftId`: the node address and the group
//! ID. Messages carry the group ID in their wire header, so a process can route
//! inbound messages to the right decision loop.
//!
//! LOG AND STATE MACHINE
//! =====================
//!
//! The Raft log holds opaque client requests, each tagged with the storage
//! engine's original request type, a client sequence number and a weak flag.
//! Once committed, requests are applied in index order to the `State`
//! collaborator, and the result is returned to the submitting client. Leaders
//! append a noop entry on election, and membership config changes are carried
//! as entries with a reserved request type. Neither reaches the state machine.
//!
//! Applied log prefixes are compacted away, keeping a configurable number of
//! entries. Peers that fall behind the retained window are brought up to date
//! with a state machine snapshot instead.
//!
//! LEADER ELECTION
//! ===============
//!
//! Nodes are followers, candidates or leaders, modelled as `Node::Follower`,
//! `Node::Candidate` and `Node::Leader`. Terms increase monotonically, and
//! each node durably persists its current term and vote via the `TermStore`
//! collaborator before acting on them. Messages from past terms are rejected
//! with a reply carrying the current term, and messages from future terms turn
//! the node into a leaderless follower in that term before being processed.
//!
//! A follower that hasn't heard from a leader for a randomized election
//! timeout becomes a candidate: it bumps the term, votes for itself and sends
//! `RequestVote` to all members. A vote is granted if the voter hasn't voted
//! for someone else in the term, and the candidate's log is at least as
//! up-to-date as its own. A strict majority of the current membership wins.
//!
//! REPLICATION
//! ===========
//!
//! Leaders track each peer's progress: the next index to send, the highest
//! index known to match the leader's log, and the last index sent. Entries
//! are shipped as `AppendEntries` (at most one entry) or `AppendEntriesBatch`,
//! along with the index and term of the preceding entry. Followers check that
//! they have the preceding entry, truncate any divergent suffix and splice in
//! the new entries. A rejection carries a conflict hint, which lets the leader
//! skip back several entries at once.
//!
//! An entry is committed once it is replicated to a majority and belongs to
//! the leader's current term (see section 5.4.2 in the Raft paper). Followers
//! learn about commits via AppendEntries and periodic heartbeats.
//!
//! Each peer's progress also carries a private term: a replication session
//! nonce that the follower echoes back in its replies. The leader bumps it
//! whenever a snapshot transfer starts or ends, so replies to messages sent
//! before that point are recognized and discarded.
//!
//! SNAPSHOTS
//! =========
//!
//! When a peer's next index precedes the leader's first retained entry, the
//! leader sends `PreSnapshot`. The receiver replies with the index it wants
//! the transfer to begin at (its commit index + 1). If the leader still has
//! that entry, it simply resumes log replication. Otherwise it snapshots its
//! state machine and sends it as a stop-and-wait sequence of `SnapshotSend`
//! frames: a BEGIN frame with the snapshot metadata, numbered data chunks and
//! an END frame, each acknowledged by `SnapshotRsp`. On END the receiver
//! installs the state, log base and membership atomically. Errors and timeouts
//! abort the transfer, which then restarts from `PreSnapshot`.
//!
//! CLIENT REQUESTS
//! ===============
//!
//! Client writes are submitted to the local node of a group. Only the leader
//! accepts them: other nodes reply `NOT_LEADER` with a leader hint, and the
//! client must redirect. The leader appends a batch of requests in a single
//! log write. Weak requests are acknowledged as soon as they're appended,
//! strong requests once applied. On leadership loss, pending requests are
//! aborted and must be retried.

mod client;
mod codec;
mod log;
mod message;
mod node;
mod server;
mod state;
mod transport;

pub use self::log::{
    config_change_request, noop_request, Entry, EntryKind, Index, Log, NO_INDEX,
    ORIGINAL_TYPE_CONFIG_CHANGE, ORIGINAL_TYPE_NOOP,
};
pub use client::{Client, Request, Response};
pub use codec::{read_frame, write_frame, HEADER_LEN, MAX_FRAME_LEN};
pub use message::{
    code, seq, AppendEntries, AppendEntriesBatch, AppendEntriesReply, ClientRequest,
    ClientRequestBatch, ClientRequestReply, Envelope, GroupId, Heartbeat, HeartbeatReply,
    LeaderTransfer, LocalCmd, Membership, Message, MsgType, Ping, PreSnapshot, PreSnapshotReply,
    RaftId, RequestVote, RequestVoteReply, SnapshotRsp, SnapshotSend, Timeout, TimeoutKind,
};
pub use node::{Node, NodeRole, Options, Status, Term, Ticks};
pub use server::Server;
pub use state::{ApplyMeta, Snapshot, State};
pub use transport::{ChannelNetwork, ChannelTransport, TcpTransport, Transport};

/// The interval between Raft ticks, the unit of time.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// The interval between leader heartbeats in ticks.
pub const HEARTBEAT_INTERVAL: Ticks = 4;

/// The default election timeout range in ticks. This is randomized in this
/// interval, to avoid election ties.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The maximum number of entries to send in a single append message.
pub const MAX_APPEND_ENTRIES: usize = 100;

/// The size of snapshot data chunks, in bytes.
pub const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;

/// The number of ticks without a snapshot acknowledgement before the transfer
/// is aborted and restarted.
pub const SNAPSHOT_TIMEOUT: Ticks = 50;

/// The maximum number of client requests appended in a single log write.
pub const MAX_BATCH: usize = 64;
