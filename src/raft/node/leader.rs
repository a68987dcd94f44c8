use super::super::{
    code, AppendEntries, AppendEntriesBatch, AppendEntriesReply, ClientRequest, Heartbeat,
    HeartbeatReply, Index, LeaderTransfer, LocalCmd, Message, RaftId, RequestVoteReply,
    TimeoutKind, NO_INDEX, ORIGINAL_TYPE_CONFIG_CHANGE, ORIGINAL_TYPE_NOOP,
};
use super::snapshot::SnapshotSender;
use super::{quorum_value, Follower, Node, NodeRole, RawNode, Role, Term, Ticks};
use crate::encoding::Value as _;
use crate::error::Result;

use ::log::{debug, info, warn};
use itertools::Itertools as _;
use std::collections::BTreeMap;

/// Peer replication progress.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Progress {
    /// The next index to replicate to the peer.
    pub(super) next: Index,
    /// The last index known to match the leader's log.
    pub(super) match_index: Index,
    /// The last index shipped to the peer. Replies for an older shipment
    /// don't trigger further sends, to avoid duplicate pipelines.
    pub(super) last_send_index: Index,
    /// The replication session nonce, echoed in replies. Bumped whenever a
    /// snapshot transfer starts or ends, invalidating older replies.
    pub(super) private_term: Term,
    /// The wall clock of the peer's last valid reply.
    pub(super) last_reply: i64,
    /// The start time of the last snapshot transfer, to keep transfer
    /// identities strictly increasing.
    pub(super) last_snapshot_start: i64,
    /// An outbound snapshot transfer, if any.
    pub(super) snapshot: Option<SnapshotSender>,
}

impl Progress {
    fn new(next: Index, private_term: Term) -> Self {
        Self {
            next,
            match_index: NO_INDEX,
            last_send_index: NO_INDEX,
            private_term,
            last_reply: 0,
            last_snapshot_start: 0,
            snapshot: None,
        }
    }
}

// A leader serves client writes and replicates the log to followers.
#[derive(Clone, Debug, PartialEq)]
pub struct Leader {
    /// Peer replication progress.
    pub(super) progress: BTreeMap<RaftId, Progress>,
    /// Keeps track of pending strong write requests, mapping log index to
    /// client sequence number. Added when the request is appended to the log,
    /// and removed when applied, replying with the result.
    ///
    /// If the leader loses leadership, all pending writes are aborted.
    writes: BTreeMap<Index, u64>,
    /// Number of ticks since last periodic heartbeat.
    since_heartbeat: Ticks,
}

impl Leader {
    /// Creates a new leader role. The private term of each peer starts at
    /// the given session value.
    pub(super) fn new(peers: Vec<RaftId>, last_index: Index, session: Term) -> Self {
        let next = last_index + 1;
        let progress = peers.into_iter().map(|p| (p, Progress::new(next, session))).collect();
        Self { progress, writes: BTreeMap::new(), since_heartbeat: 0 }
    }
}

impl Role for Leader {
    const KIND: NodeRole = NodeRole::Leader;
}

impl RawNode<Leader> {
    /// Transitions the leader into a leaderless follower, either in a new
    /// term or by stepping down in the current one. Pending writes are
    /// aborted.
    pub(super) fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "Term regression {} → {}", self.term, term);

        // Cancel in-flight requests, in log order.
        for seq_num in std::mem::take(&mut self.role.writes).into_values() {
            self.reply(seq_num, code::ABORTED, None, vec![])?;
        }

        if term > self.term {
            info!("Discovered new term {term}");
            self.persist_term(term, None)?;
        } else {
            info!("Stepping down as leader in term {term}");
        }
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Follower::new(None, election_timeout));
        node.election_clock += 1;
        Ok(node)
    }

    /// Processes a message.
    pub(super) fn step(mut self, msg: Message) -> Result<Node> {
        let Some(msg) = self.step_common(msg)? else {
            return Ok(self.into());
        };

        // Past terms are rejected, and future terms turn us into a leaderless
        // follower in that term before processing the message.
        let local = self.is_local(&msg);
        if let Some(term) = msg.term().filter(|_| !local) {
            if term < self.term {
                self.reject_stale(&msg)?;
                return Ok(self.into());
            }
            if term > self.term {
                return self.into_follower(term)?.step(msg);
            }
        }

        match msg {
            // There can't be two leaders in the same term.
            Message::Heartbeat(_)
            | Message::AppendEntries(_)
            | Message::AppendEntriesBatch(_)
            | Message::PreSnapshot(_)
            | Message::SnapshotSend(_) => {
                panic!("saw other leader {:?} in term {}", msg.src(), self.term);
            }

            // A follower appended (or rejected) entries we sent it.
            Message::AppendEntriesReply(reply) => self.receive_append_reply(reply)?,

            // A follower confirms our leadership. If its log is incomplete,
            // resume replication from its match index.
            Message::HeartbeatReply(reply) => self.receive_heartbeat_reply(reply)?,

            Message::PreSnapshotReply(reply) => self.receive_pre_snapshot_reply(reply)?,

            Message::SnapshotRsp(rsp) => self.receive_snapshot_rsp(rsp)?,

            // Don't grant other votes in this term.
            Message::RequestVote(rv) => {
                self.send(Message::RequestVoteReply(RequestVoteReply {
                    src: self.id,
                    dest: rv.src,
                    term: self.term,
                    vote_granted: false,
                }))?;
            }

            // Votes can come in after we won the election, ignore them.
            Message::RequestVoteReply(_) => {}

            Message::LeaderTransfer(lt) if local => return self.transfer_leadership(lt.new_leader),

            Message::LeaderTransfer(lt) => {
                warn!("Ignoring leader transfer from {} as leader", lt.src);
            }

            Message::ClientRequest(request) => self.submit(vec![request])?,

            Message::ClientRequestBatch(batch) => self.submit(batch.requests)?,

            Message::LocalCmd(LocalCmd::StepDown { new_term }) => {
                let term = new_term.max(self.term);
                return Ok(self.into_follower(term)?.into());
            }

            Message::LocalCmd(LocalCmd::FollowerCommit { .. }) => {
                debug!("Ignoring follower commit as leader");
            }

            Message::Timeout(t) => {
                if t.kind == TimeoutKind::Heartbeat && self.timeout_is_current(&t) {
                    self.heartbeat()?;
                }
            }

            Message::Ping(_) | Message::PingReply(_) | Message::ClientRequestReply(_) => {
                unreachable!("handled by step_common")
            }
        }

        self.check_membership()
    }

    /// Processes a logical clock tick.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        self.tick_snapshots()?;
        self.check_membership()
    }

    /// Steps down if a config change removed us from the group.
    fn check_membership(self) -> Result<Node> {
        if !self.membership.contains(&self.id) {
            info!("Removed from group {}, stepping down", self.id.group_id);
            let term = self.term;
            return Ok(self.into_follower(term)?.into());
        }
        Ok(self.into())
    }

    /// Returns the match index of every member, including ourself.
    pub(super) fn match_indexes(&self) -> BTreeMap<RaftId, Index> {
        self.role
            .progress
            .iter()
            .map(|(id, p)| (*id, p.match_index))
            .chain(std::iter::once((self.id, self.log.get_last_index().0)))
            .collect()
    }

    /// Broadcasts a heartbeat to all peers.
    pub(super) fn heartbeat(&mut self) -> Result<()> {
        let commit_index = self.log.get_commit_index();
        let min_match_index = self
            .role
            .progress
            .values()
            .map(|p| p.match_index)
            .min()
            .unwrap_or(self.log.get_last_index().0);
        for (peer, progress) in &self.role.progress {
            self.send(Message::Heartbeat(Heartbeat {
                src: self.id,
                dest: *peer,
                term: self.term,
                commit_index,
                private_term: progress.private_term,
                min_match_index,
            }))?;
        }
        self.heartbeat_clock += 1;
        Ok(())
    }

    /// Validates and proposes client requests. Weak requests are replied to
    /// once appended, strong requests once applied.
    fn submit(&mut self, requests: Vec<ClientRequest>) -> Result<()> {
        let mut accepted = Vec::with_capacity(requests.len());
        for request in requests {
            let valid = match request.original_type {
                ORIGINAL_TYPE_NOOP => false,
                ORIGINAL_TYPE_CONFIG_CHANGE => {
                    Vec::<RaftId>::decode(&request.data).is_ok_and(|m| !m.is_empty())
                }
                _ => true,
            };
            if !valid {
                warn!("Rejecting invalid client request {}", request.seq_num);
                self.reply(request.seq_num, code::INVALID_REQUEST, Some(self.id), vec![])?;
                continue;
            }
            accepted.push(request);
        }
        if accepted.is_empty() {
            return Ok(());
        }

        let submitted = accepted.iter().map(|r| (r.seq_num, r.is_weak)).collect_vec();
        let first = self.propose(accepted)?;
        for (index, (seq_num, is_weak)) in (first..).zip(submitted) {
            if is_weak {
                self.reply(seq_num, code::OK, Some(self.id), vec![])?;
            } else {
                self.role.writes.insert(index, seq_num);
            }
        }

        // A sole member commits immediately.
        self.maybe_commit_and_apply()
    }

    /// Appends requests to our log as a single write, and replicates them to
    /// peers that are caught up. Returns the index of the first new entry.
    pub(super) fn propose(&mut self, requests: Vec<ClientRequest>) -> Result<Index> {
        let first = self.log.get_last_index().0 + 1;
        let last = self.log.append(self.term, requests)?;
        debug!("Proposed entries {first}..={last} in term {}", self.term);

        // Lagging peers are driven by their replies instead.
        let peers = self
            .role
            .progress
            .iter()
            .filter(|(_, p)| p.next == first && p.snapshot.is_none())
            .map(|(id, _)| *id)
            .collect_vec();
        for peer in peers {
            self.send_log(peer)?;
        }
        Ok(first)
    }

    /// Commits any new log entries that have been replicated to a quorum, and
    /// applies them to the state machine, replying to waiting clients.
    pub(super) fn maybe_commit_and_apply(&mut self) -> Result<()> {
        let last_index = self.log.get_last_index().0;
        let quorum_index = quorum_value(
            self.membership
                .members
                .iter()
                .map(|m| match self.role.progress.get(m) {
                    _ if *m == self.id => last_index,
                    Some(progress) => progress.match_index,
                    None => NO_INDEX,
                })
                .collect(),
        );

        // If the commit index doesn't advance, do nothing. The quorum value
        // may regress following a leader change, where peers start out with
        // an unknown match index.
        if quorum_index <= self.log.get_commit_index() {
            return Ok(());
        }

        // We can only safely commit an entry from our own term (see figure 8
        // in the Raft paper).
        match self.log.term_at(quorum_index)? {
            Some(term) if term == self.term => {}
            Some(_) => return Ok(()),
            None => panic!("Commit index {quorum_index} missing"),
        }
        self.log.commit(quorum_index)?;

        for applied in self.maybe_apply()? {
            let Some(seq_num) = self.role.writes.remove(&applied.index) else {
                continue;
            };
            debug_assert_eq!(seq_num, applied.seq_num, "write sequence mismatch");
            match applied.result {
                Ok(data) => self.reply(seq_num, code::OK, Some(self.id), data)?,
                Err(err) => {
                    let data = err.to_string().into_bytes();
                    self.reply(seq_num, code::APPLY_FAILED, Some(self.id), data)?
                }
            }
        }

        // A config change may have been applied.
        self.sync_progress()
    }

    /// Aligns peer progress with the current membership, adding new members
    /// and dropping removed ones.
    fn sync_progress(&mut self) -> Result<()> {
        let members = self.peers();
        self.role.progress.retain(|id, _| members.contains(id));
        let next = self.log.get_last_index().0 + 1;
        let mut added = Vec::new();
        for peer in members {
            if !self.role.progress.contains_key(&peer) {
                info!("Adding peer {peer} to replication");
                self.role.progress.insert(peer, Progress::new(next, self.term));
                added.push(peer);
            }
        }
        // Start new peers off with an empty append at our last index.
        for peer in added {
            self.send_log(peer)?;
        }
        Ok(())
    }

    /// Handles a follower's reply to AppendEntries. A successful reply
    /// advances the peer's match index and possibly the commit index. A
    /// failed reply carries a conflict hint to resume replication from.
    fn receive_append_reply(&mut self, reply: AppendEntriesReply) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let Some(progress) = self.role.progress.get_mut(&reply.src) else {
            debug!("Ignoring append reply from unknown peer {}", reply.src);
            return Ok(());
        };
        if reply.private_term != progress.private_term {
            debug!("Ignoring append reply from {} with stale private term", reply.src);
            return Ok(());
        }
        progress.last_reply = reply.start_time;

        if !reply.success {
            // Skip back to the hint, but never before the match index, and
            // always make progress.
            let hint = reply.match_index + 1;
            progress.next = hint.min(progress.next - 1).max(progress.match_index + 1);
            debug!("Append rejected by {}, retrying from {}", reply.src, progress.next);
            return self.send_log(reply.src);
        }

        if reply.match_index > last_index {
            warn!("Ignoring append reply from {} beyond last index {last_index}", reply.src);
            return Ok(());
        }
        progress.match_index = progress.match_index.max(reply.match_index);
        progress.next = progress.next.max(progress.match_index + 1);
        let send_more = reply.last_send_index == progress.last_send_index
            && progress.match_index < last_index;

        self.maybe_commit_and_apply()?;
        if send_more {
            self.send_log(reply.src)?;
        }
        Ok(())
    }

    /// Handles a follower's heartbeat reply. If the follower hasn't caught
    /// up, replication resumes from its match index.
    fn receive_heartbeat_reply(&mut self, reply: HeartbeatReply) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let Some(progress) = self.role.progress.get_mut(&reply.src) else {
            debug!("Ignoring heartbeat reply from unknown peer {}", reply.src);
            return Ok(());
        };
        if reply.private_term != progress.private_term {
            debug!("Ignoring heartbeat reply from {} with stale private term", reply.src);
            return Ok(());
        }
        progress.last_reply = reply.start_time;
        if progress.snapshot.is_none() && progress.match_index < last_index {
            progress.next = progress.match_index + 1;
            return self.send_log(reply.src);
        }
        Ok(())
    }

    /// Ships pending log entries to a peer, starting at its next index. If
    /// the entries have been compacted away, a snapshot transfer is started
    /// instead. Peers with an active snapshot transfer are skipped.
    pub(super) fn send_log(&mut self, peer: RaftId) -> Result<()> {
        let Some(progress) = self.role.progress.get(&peer) else {
            return Ok(());
        };
        if progress.snapshot.is_some() {
            return Ok(());
        }
        let next = progress.next;
        if next < self.log.begin_index() {
            return self.send_pre_snapshot(peer);
        }

        let (last_index, _) = self.log.get_last_index();
        let to = last_index.min(next + self.opts.max_append_entries as Index - 1);
        let mut entries = self.log.scan(next, to)?;
        let prev_log_index = next - 1;
        let prev_log_term = match self.log.term_at(prev_log_index)? {
            Some(term) => term,
            None => panic!("missing base entry {prev_log_index}"),
        };
        let last_send_index = prev_log_index + entries.len() as Index;
        if let Some(progress) = self.role.progress.get_mut(&peer) {
            progress.last_send_index = last_send_index;
            progress.next = last_send_index + 1;
        }
        let private_term = self.role.progress.get(&peer).map_or(self.term, |p| p.private_term);

        debug!("Replicating {} entries at base {prev_log_index} to {peer}", entries.len());
        let commit_index = self.log.get_commit_index();
        let message = if entries.len() <= 1 {
            Message::AppendEntries(AppendEntries {
                src: self.id,
                dest: peer,
                term: self.term,
                prev_log_index,
                prev_log_term,
                commit_index,
                private_term,
                entry: entries.pop(),
            })
        } else {
            Message::AppendEntriesBatch(AppendEntriesBatch {
                src: self.id,
                dest: peer,
                term: self.term,
                prev_log_index,
                prev_log_term,
                commit_index,
                private_term,
                entries,
            })
        };
        self.send(message)
    }

    /// Hands leadership over to the given member, once it has caught up with
    /// our log. We then step down in the current term, and the target
    /// campaigns immediately.
    fn transfer_leadership(mut self, target: RaftId) -> Result<Node> {
        if target == self.id {
            return Ok(self.into());
        }
        let (last_index, _) = self.log.get_last_index();
        match self.role.progress.get(&target) {
            Some(progress) if progress.match_index == last_index => {
                info!("Transferring leadership to {target} in term {}", self.term);
                self.send(Message::LeaderTransfer(LeaderTransfer {
                    src: self.id,
                    dest: target,
                    term: self.term,
                    new_leader: target,
                }))?;
                let term = self.term;
                Ok(self.into_follower(term)?.into())
            }
            Some(_) => {
                warn!("Can't transfer leadership to {target}, log not caught up");
                self.send_log(target)?;
                Ok(self.into())
            }
            None => {
                warn!("Can't transfer leadership to non-member {target}");
                Ok(self.into())
            }
        }
    }
}
