use super::{Entry, Index, Term};

use serde::{Deserialize, Serialize};

/// A storage group ID. Each group runs an independent Raft instance.
pub type GroupId = i32;

/// A Raft peer identity: a node address within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftId {
    /// The node address, unique across the cluster.
    pub address: u64,
    /// The group this peer belongs to.
    pub group_id: GroupId,
}

impl RaftId {
    pub fn new(address: u64, group_id: GroupId) -> Self {
        Self { address, group_id }
    }
}

impl std::fmt::Display for RaftId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.address, self.group_id)
    }
}

/// A group membership config: an ordered set of members, and the log index
/// of the config change entry that made it effective (-1 for the initial
/// config).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub members: Vec<RaftId>,
    pub last_config_index: Index,
}

impl crate::encoding::Value for Membership {}

impl Membership {
    /// Creates a membership config from the given members, sorting and
    /// deduplicating them.
    pub fn new(members: impl IntoIterator<Item = RaftId>, last_config_index: Index) -> Self {
        let mut members: Vec<RaftId> = members.into_iter().collect();
        members.sort();
        members.dedup();
        Self { members, last_config_index }
    }

    /// Returns true if the given peer is a member.
    pub fn contains(&self, id: &RaftId) -> bool {
        self.members.contains(id)
    }

    /// Returns the members other than the given node.
    pub fn peers_of(&self, id: RaftId) -> impl Iterator<Item = RaftId> + '_ {
        self.members.iter().copied().filter(move |m| *m != id)
    }

    /// Returns the strict majority size of the membership.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// A message envelope, as sent on the wire. The group ID is part of the fixed
/// header, and lets a process hosting several groups route the message to the
/// right decision loop.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub group_id: GroupId,
    pub message: Message,
}

/// Wire message type discriminants. The numbering is part of the wire format
/// and must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Ping = 1,
    PingReply = 2,
    Timeout = 3,
    ClientRequest = 4,
    ClientRequestBatch = 5,
    ClientRequestReply = 6,
    RequestVote = 7,
    RequestVoteReply = 8,
    AppendEntries = 9,
    AppendEntriesBatch = 10,
    AppendEntriesReply = 11,
    Heartbeat = 12,
    HeartbeatReply = 13,
    PreSnapshot = 14,
    PreSnapshotReply = 15,
    SnapshotSend = 16,
    SnapshotRsp = 17,
    LeaderTransfer = 18,
    LocalCmd = 19,
}

impl MsgType {
    /// Returns true for message types that are only used within a process
    /// and never sent on the wire.
    pub fn is_local(self) -> bool {
        matches!(self, MsgType::Timeout | MsgType::LocalCmd)
    }
}

impl TryFrom<u32> for MsgType {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        Ok(match value {
            1 => MsgType::Ping,
            2 => MsgType::PingReply,
            3 => MsgType::Timeout,
            4 => MsgType::ClientRequest,
            5 => MsgType::ClientRequestBatch,
            6 => MsgType::ClientRequestReply,
            7 => MsgType::RequestVote,
            8 => MsgType::RequestVoteReply,
            9 => MsgType::AppendEntries,
            10 => MsgType::AppendEntriesBatch,
            11 => MsgType::AppendEntriesReply,
            12 => MsgType::Heartbeat,
            13 => MsgType::HeartbeatReply,
            14 => MsgType::PreSnapshot,
            15 => MsgType::PreSnapshotReply,
            16 => MsgType::SnapshotSend,
            17 => MsgType::SnapshotRsp,
            18 => MsgType::LeaderTransfer,
            19 => MsgType::LocalCmd,
            v => return Err(v),
        })
    }
}

/// Reply status codes, used by ClientRequestReply.err_code and
/// SnapshotRsp.code.
pub mod code {
    pub const OK: i32 = 0;
    /// The request was submitted to a non-leader. See leader_hint.
    pub const NOT_LEADER: i32 = 1;
    /// The request was aborted by a leader or term change and must be retried.
    pub const ABORTED: i32 = 2;
    /// The state machine failed to apply the committed request. The reply data
    /// contains the error message.
    pub const APPLY_FAILED: i32 = 3;
    /// The request was malformed.
    pub const INVALID_REQUEST: i32 = 4;
    /// A snapshot chunk arrived out of sequence.
    pub const SNAPSHOT_OUT_OF_ORDER: i32 = 10;
    /// The receiver failed to install the snapshot.
    pub const SNAPSHOT_INSTALL_FAILED: i32 = 11;
    /// The snapshot message was from a stale term or transfer attempt.
    pub const SNAPSHOT_STALE: i32 = 12;
}

/// Reserved SnapshotSend.seq and SnapshotRsp.ack values. Real chunks are
/// numbered from 0.
pub mod seq {
    /// Begins a transfer, carrying only the snapshot metadata.
    pub const BEGIN: i32 = -1;
    /// Ends a transfer, telling the receiver to install the snapshot.
    pub const END: i32 = i32::MAX;
    /// Used in error acks when the receiver has no valid transfer state.
    pub const INVALID: i32 = -2;
}

/// A message exchanged by Raft nodes of a group, or between a node and its
/// local clients and timers. Timeout and LocalCmd never cross the network.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Ping(Ping),
    PingReply(Ping),
    Timeout(Timeout),
    ClientRequest(ClientRequest),
    ClientRequestBatch(ClientRequestBatch),
    ClientRequestReply(ClientRequestReply),
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesBatch(AppendEntriesBatch),
    AppendEntriesReply(AppendEntriesReply),
    Heartbeat(Heartbeat),
    HeartbeatReply(HeartbeatReply),
    PreSnapshot(PreSnapshot),
    PreSnapshotReply(PreSnapshotReply),
    SnapshotSend(SnapshotSend),
    SnapshotRsp(SnapshotRsp),
    LeaderTransfer(LeaderTransfer),
    LocalCmd(LocalCmd),
}

impl Message {
    /// Returns the message type discriminant.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Ping(_) => MsgType::Ping,
            Message::PingReply(_) => MsgType::PingReply,
            Message::Timeout(_) => MsgType::Timeout,
            Message::ClientRequest(_) => MsgType::ClientRequest,
            Message::ClientRequestBatch(_) => MsgType::ClientRequestBatch,
            Message::ClientRequestReply(_) => MsgType::ClientRequestReply,
            Message::RequestVote(_) => MsgType::RequestVote,
            Message::RequestVoteReply(_) => MsgType::RequestVoteReply,
            Message::AppendEntries(_) => MsgType::AppendEntries,
            Message::AppendEntriesBatch(_) => MsgType::AppendEntriesBatch,
            Message::AppendEntriesReply(_) => MsgType::AppendEntriesReply,
            Message::Heartbeat(_) => MsgType::Heartbeat,
            Message::HeartbeatReply(_) => MsgType::HeartbeatReply,
            Message::PreSnapshot(_) => MsgType::PreSnapshot,
            Message::PreSnapshotReply(_) => MsgType::PreSnapshotReply,
            Message::SnapshotSend(_) => MsgType::SnapshotSend,
            Message::SnapshotRsp(_) => MsgType::SnapshotRsp,
            Message::LeaderTransfer(_) => MsgType::LeaderTransfer,
            Message::LocalCmd(_) => MsgType::LocalCmd,
        }
    }

    /// Returns the sender's term, for peer messages that carry one.
    pub fn term(&self) -> Option<Term> {
        Some(match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteReply(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesBatch(m) => m.term,
            Message::AppendEntriesReply(m) => m.term,
            Message::Heartbeat(m) => m.term,
            Message::HeartbeatReply(m) => m.term,
            Message::PreSnapshot(m) => m.term,
            Message::PreSnapshotReply(m) => m.term,
            Message::SnapshotSend(m) => m.term,
            Message::SnapshotRsp(m) => m.term,
            Message::LeaderTransfer(m) => m.term,
            Message::Ping(_)
            | Message::PingReply(_)
            | Message::Timeout(_)
            | Message::ClientRequest(_)
            | Message::ClientRequestBatch(_)
            | Message::ClientRequestReply(_)
            | Message::LocalCmd(_) => return None,
        })
    }

    /// Returns the sender, for peer messages.
    pub fn src(&self) -> Option<RaftId> {
        self.route().map(|(src, _)| src)
    }

    /// Returns the recipient, for peer messages. Messages without a recipient
    /// are local: client requests, replies, timeouts and local commands.
    pub fn dest(&self) -> Option<RaftId> {
        self.route().map(|(_, dest)| dest)
    }

    fn route(&self) -> Option<(RaftId, RaftId)> {
        Some(match self {
            Message::Ping(m) | Message::PingReply(m) => (m.src, m.dest),
            Message::RequestVote(m) => (m.src, m.dest),
            Message::RequestVoteReply(m) => (m.src, m.dest),
            Message::AppendEntries(m) => (m.src, m.dest),
            Message::AppendEntriesBatch(m) => (m.src, m.dest),
            Message::AppendEntriesReply(m) => (m.src, m.dest),
            Message::Heartbeat(m) => (m.src, m.dest),
            Message::HeartbeatReply(m) => (m.src, m.dest),
            Message::PreSnapshot(m) => (m.src, m.dest),
            Message::PreSnapshotReply(m) => (m.src, m.dest),
            Message::SnapshotSend(m) => (m.src, m.dest),
            Message::SnapshotRsp(m) => (m.src, m.dest),
            Message::LeaderTransfer(m) => (m.src, m.dest),
            Message::Timeout(_)
            | Message::ClientRequest(_)
            | Message::ClientRequestBatch(_)
            | Message::ClientRequestReply(_)
            | Message::LocalCmd(_) => return None,
        })
    }
}

/// A liveness check. Every node answers with a PingReply echoing the data.
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    pub src: RaftId,
    pub dest: RaftId,
    pub data: Vec<u8>,
}

/// The kind of a local timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Ping,
    Election,
    Heartbeat,
}

/// A local timer firing. The logical clock identifies the timer arming: each
/// rearm bumps the node's clock, so a Timeout carrying an older clock value
/// has been cancelled and is ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct Timeout {
    pub kind: TimeoutKind,
    pub logic_clock: u64,
    pub timer_ms: i32,
}

/// A client write. The sequence number is unique within the submitting
/// process and correlates the eventual ClientRequestReply.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientRequest {
    /// The storage engine's request type, passed back on apply.
    pub original_type: u32,
    pub seq_num: u64,
    /// Weak requests are acknowledged once appended to the leader's log,
    /// without waiting for a commit quorum.
    pub is_weak: bool,
    pub data: Vec<u8>,
}

/// A batch of client writes, appended to the log in a single write.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientRequestBatch {
    pub requests: Vec<ClientRequest>,
}

/// A reply to a client write.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientRequestReply {
    pub seq_num: u64,
    /// The reply status, see [`code`].
    pub err_code: i32,
    /// The leader the replying node believes in, if any.
    pub leader_hint: Option<RaftId>,
    /// The state machine result, or an error message if err_code is
    /// APPLY_FAILED.
    pub data: Vec<u8>,
}

/// Candidates solicit votes from all peers when campaigning for leadership.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestVote {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    /// The index of the candidate's last log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestVoteReply {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    pub vote_granted: bool,
}

/// Leaders replicate a single log entry, or check a follower's log with no
/// entry at all.
#[derive(Clone, Debug, PartialEq)]
pub struct AppendEntries {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    /// The index of the entry immediately preceding the shipped entry.
    pub prev_log_index: Index,
    /// The term of the entry immediately preceding the shipped entry.
    pub prev_log_term: Term,
    /// The leader's commit index.
    pub commit_index: Index,
    /// The leader's replication session nonce for this peer, echoed back.
    pub private_term: Term,
    pub entry: Option<Entry>,
}

/// Leaders replicate several contiguous log entries at once. Semantically
/// identical to shipping the entries one by one.
#[derive(Clone, Debug, PartialEq)]
pub struct AppendEntriesBatch {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub commit_index: Index,
    pub private_term: Term,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppendEntriesReply {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    /// Echoes the private_term of the AppendEntries being answered.
    pub private_term: Term,
    pub success: bool,
    /// On success, the follower's last index known to match the leader. On
    /// failure, a conflict hint: the last index the follower could possibly
    /// share with the leader, after truncating any divergent suffix.
    pub match_index: Index,
    /// The last index shipped in the AppendEntries being answered.
    pub last_send_index: Index,
    /// The follower's wall clock in milliseconds.
    pub start_time: i64,
}

/// Leaders assert their leadership and propagate the commit index.
#[derive(Clone, Debug, PartialEq)]
pub struct Heartbeat {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    pub commit_index: Index,
    pub private_term: Term,
    /// The lowest match index across the leader's peers.
    pub min_match_index: Index,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatReply {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    pub private_term: Term,
    pub start_time: i64,
}

/// A leader announces a snapshot transfer.
#[derive(Clone, Debug, PartialEq)]
pub struct PreSnapshot {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PreSnapshotReply {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    /// The index the receiver wants the transfer to begin at. Everything
    /// before it is already committed on the receiver.
    pub snap_start: Index,
}

/// A snapshot transfer frame: the BEGIN frame, a data chunk, or the END frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotSend {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    pub begin_index: Index,
    pub last_index: Index,
    pub last_term: Term,
    pub last_config_index: Index,
    pub last_config: Membership,
    /// Identifies the transfer attempt.
    pub start_time: i64,
    /// The chunk sequence number, or one of the [`seq`] sentinels.
    pub seq: i32,
    pub data: Vec<u8>,
}

/// Acknowledges a snapshot frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRsp {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    pub last_index: Index,
    pub last_term: Term,
    pub start_time: i64,
    /// The acknowledged seq.
    pub ack: i32,
    /// The status, see [`code`].
    pub code: i32,
    /// Only valid when ack is [`seq::BEGIN`].
    pub snap_begin_index: Index,
}

/// Hands leadership over to a designated member. Submitted locally to the
/// leader, which forwards it to the new leader once it has caught up.
#[derive(Clone, Debug, PartialEq)]
pub struct LeaderTransfer {
    pub src: RaftId,
    pub dest: RaftId,
    pub term: Term,
    pub new_leader: RaftId,
}

/// A local control command, processed by the decision loop like any other
/// input.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalCmd {
    /// Steps down to follower, adopting the given term if it is newer.
    StepDown { new_term: Term },
    /// Lets a follower commit entries it already holds up to the given index,
    /// without waiting for the next heartbeat.
    FollowerCommit { commit_index: Index },
}
