use super::super::{
    AppendEntriesReply, Entry, Envelope, HeartbeatReply, Index, LocalCmd, Log, Message, RaftId,
    RequestVote, RequestVoteReply, State, TimeoutKind, NO_INDEX,
};
use super::snapshot::SnapshotReceiver;
use super::{Candidate, Node, NodeRole, Options, RawNode, Role, Term, Ticks};
use crate::error::Result;
use crate::storage::{ConfigStore, TermStore};

use ::log::{debug, info, warn};

/// A follower replicates log entries from a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Follower {
    /// The leader, or None if just initialized or after a step-down.
    pub(super) leader: Option<RaftId>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
    /// The last index known to match the leader's log in this term. Only
    /// entries up to it may be committed.
    pub(super) match_index: Index,
    /// An inbound snapshot transfer, if any.
    pub(super) snapshot: Option<SnapshotReceiver>,
}

impl Follower {
    /// Creates a new follower role.
    pub(super) fn new(leader: Option<RaftId>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout, match_index: NO_INDEX, snapshot: None }
    }
}

impl Role for Follower {
    const KIND: NodeRole = NodeRole::Follower;
}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower. The term, vote and
    /// membership are loaded from the stores, and the applied index is
    /// recovered from the state machine.
    pub(super) fn new(
        id: RaftId,
        mut log: Log,
        term_store: Box<dyn TermStore>,
        config_store: Box<dyn ConfigStore>,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let (term, voted_for) = term_store.load()?;
        let membership = config_store.current()?;
        let (last_index, _) = log.get_last_index();

        // Entries applied to the state machine are committed.
        let applied_index = state.get_applied_index().max(log.get_base().0);
        if applied_index > log.get_commit_index() && applied_index <= last_index {
            log.commit(applied_index)?;
        }

        let mut node = Self {
            id,
            membership,
            term,
            voted_for,
            log,
            state,
            term_store,
            config_store,
            applied_index,
            min_match_index: NO_INDEX,
            election_clock: 0,
            heartbeat_clock: 0,
            node_tx,
            opts,
            role: Follower::new(None, 0),
        };
        node.role.election_timeout = node.gen_election_timeout();
        info!(
            "Starting node {} in term {} with members {:?}, applied index {applied_index}",
            node.id, node.term, node.membership.members
        );
        Ok(node)
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    pub(super) fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Apply any pending entries, so we're caught up if we win.
        self.maybe_apply()?;
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either a leaderless follower
    /// in a new term or a follower of a leader in the current term.
    pub(super) fn into_follower(mut self, term: Term, leader: Option<RaftId>) -> Result<Self> {
        assert!(term >= self.term, "Term regression {} → {}", self.term, term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(term, self.term, "Can't follow leader in different term");
            assert_eq!(self.role.leader, None, "Already have leader in term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else if term > self.term {
            // We found a new term, but don't yet know who the leader is. The
            // vote is reset along with the term.
            info!("Discovered new term {term}");
            self.persist_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        self.election_clock += 1;
        Ok(self)
    }

    /// Processes an inbound message.
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
                return self.into_follower(term, None)?.step(msg);
            }
        }

        match msg {
            // The leader asserts its leadership, and propagates its commit
            // index. We can only commit entries that we know match its log.
            Message::Heartbeat(hb) => {
                self.follow(hb.src);
                self.min_match_index = hb.min_match_index;
                self.send(Message::HeartbeatReply(HeartbeatReply {
                    src: self.id,
                    dest: hb.src,
                    term: self.term,
                    private_term: hb.private_term,
                    start_time: self.now(),
                }))?;
                self.maybe_commit(hb.commit_index)?;
            }

            Message::AppendEntries(ae) => {
                self.follow(ae.src);
                let entries = ae.entry.into_iter().collect();
                let (prev, commit) = ((ae.prev_log_index, ae.prev_log_term), ae.commit_index);
                self.append(ae.src, prev, commit, ae.private_term, entries)?;
            }

            Message::AppendEntriesBatch(ae) => {
                self.follow(ae.src);
                let (prev, commit) = ((ae.prev_log_index, ae.prev_log_term), ae.commit_index);
                self.append(ae.src, prev, commit, ae.private_term, ae.entries)?;
            }

            Message::RequestVote(rv) => self.vote(rv)?,

            // We may receive votes after losing an election and following
            // the winner. Ignore them.
            Message::RequestVoteReply(_) => {}

            Message::PreSnapshot(pre) => {
                self.follow(pre.src);
                self.receive_pre_snapshot(pre)?;
            }

            Message::SnapshotSend(frame) => {
                self.follow(frame.src);
                self.receive_snapshot(frame)?;
            }

            Message::LeaderTransfer(_) if local => {
                warn!("Can't transfer leadership from follower, ignoring");
            }

            // The leader hands leadership over to us. Campaign immediately.
            Message::LeaderTransfer(lt) => {
                self.follow(lt.src);
                if lt.new_leader == self.id {
                    info!("Leader {} transferred leadership, campaigning", lt.src);
                    return self.into_candidate()?.maybe_win();
                }
                warn!("Ignoring leader transfer to {}", lt.new_leader);
            }

            Message::ClientRequest(_) | Message::ClientRequestBatch(_) => {
                self.reject_requests(&msg, self.role.leader)?;
            }

            Message::LocalCmd(LocalCmd::StepDown { new_term }) => {
                if new_term > self.term {
                    return Ok(self.into_follower(new_term, None)?.into());
                }
            }

            Message::LocalCmd(LocalCmd::FollowerCommit { commit_index }) => {
                self.maybe_commit(commit_index)?;
            }

            Message::Timeout(t) => {
                if t.kind == TimeoutKind::Election && self.timeout_is_current(&t) {
                    return self.election_timeout();
                }
            }

            // Replies to requests we sent as leader earlier in this term,
            // before stepping down.
            Message::AppendEntriesReply(_)
            | Message::HeartbeatReply(_)
            | Message::PreSnapshotReply(_)
            | Message::SnapshotRsp(_) => {
                debug!("Ignoring leader reply as follower: {msg:?}");
            }

            Message::Ping(_) | Message::PingReply(_) | Message::ClientRequestReply(_) => {
                unreachable!("handled by step_common")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return self.election_timeout();
        }
        Ok(self.into())
    }

    /// Campaigns for leadership once the leader has been silent for too long.
    /// Nodes that aren't group members never campaign.
    fn election_timeout(mut self) -> Result<Node> {
        if !self.membership.contains(&self.id) {
            debug!("Not a group member, not campaigning");
            self.reset_election_timer();
            return Ok(self.into());
        }
        self.into_candidate()?.maybe_win()
    }

    /// Resets the election timer, cancelling any pending election Timeout.
    fn reset_election_timer(&mut self) {
        self.role.leader_seen = 0;
        self.election_clock += 1;
    }

    /// Records a message from the leader of the current term.
    fn follow(&mut self, leader: RaftId) {
        match self.role.leader {
            Some(current) => assert_eq!(current, leader, "Multiple leaders in term {}", self.term),
            None => {
                info!("Following leader {leader} in term {}", self.term);
                self.role.leader = Some(leader);
            }
        }
        self.reset_election_timer();
    }

    /// Commits entries up to the given index, limited to entries known to
    /// match the leader's log, and applies them.
    fn maybe_commit(&mut self, commit_index: Index) -> Result<()> {
        let index = commit_index.min(self.role.match_index).min(self.log.get_last_index().0);
        if index > self.log.get_commit_index() {
            self.log.commit(index)?;
            self.maybe_apply()?;
        }
        Ok(())
    }

    /// Splices replicated entries into the log, if it contains the base
    /// entry, and replies to the leader. On a mismatch, the reply carries a
    /// conflict hint: the last index we could possibly share with the leader.
    fn append(
        &mut self,
        leader: RaftId,
        (prev_log_index, prev_log_term): (Index, Term),
        commit_index: Index,
        private_term: Term,
        entries: Vec<Entry>,
    ) -> Result<()> {
        if !self.valid_entries((prev_log_index, prev_log_term), &entries)? {
            return Ok(());
        }
        let last_send_index = prev_log_index + entries.len() as Index;
        let base_index = self.log.get_base().0;
        let (id, term, start_time) = (self.id, self.term, self.now());
        let reply = |success, match_index| {
            Message::AppendEntriesReply(AppendEntriesReply {
                src: id,
                dest: leader,
                term,
                private_term,
                success,
                match_index,
                last_send_index,
                start_time,
            })
        };

        // Entries at or below the base are committed, and thus match.
        if prev_log_index > base_index && !self.log.has(prev_log_index, prev_log_term)? {
            let commit = self.log.get_commit_index();
            let hint = match self.log.term_at(prev_log_index)? {
                // A divergent uncommitted entry: drop it and everything after.
                Some(_) if prev_log_index > commit => {
                    self.log.truncate_from(prev_log_index)?;
                    prev_log_index - 1
                }
                Some(_) => commit,
                // We don't have the base entry at all.
                None => self.log.get_last_index().0,
            };
            debug!("Rejecting entries at base {prev_log_index}, conflict hint {hint}");
            return self.send(reply(false, hint));
        }

        self.log.splice(entries)?;
        let last_new = last_send_index.max(base_index);
        self.role.match_index = self.role.match_index.max(last_new);
        self.send(reply(true, self.role.match_index))?;
        self.maybe_commit(commit_index)
    }

    /// Checks that shipped entries form a log suffix following the base
    /// entry: contiguous indexes, non-decreasing terms no later than ours, and
    /// no conflicts with committed entries. Invalid messages are dropped.
    fn valid_entries(
        &self,
        (prev_index, prev_term): (Index, Term),
        entries: &[Entry],
    ) -> Result<bool> {
        if prev_index < NO_INDEX {
            warn!("Dropping append with invalid base index {prev_index}");
            return Ok(false);
        }
        let commit_index = self.log.get_commit_index();
        let (mut index, mut term) = (prev_index + 1, prev_term);
        for entry in entries {
            if entry.index != index || entry.term < term || entry.term > self.term {
                let (got, prev) = ((entry.index, entry.term), (index - 1, term));
                warn!("Dropping append with invalid entry {got:?} after {prev:?}");
                return Ok(false);
            }
            if entry.index <= commit_index {
                if let Some(committed) = self.log.term_at(entry.index)? {
                    if committed != entry.term {
                        warn!("Dropping append conflicting with committed entry {}", entry.index);
                        return Ok(false);
                    }
                }
            }
            (index, term) = (entry.index + 1, entry.term);
        }
        Ok(true)
    }

    /// Votes for a candidate if we haven't voted for someone else in this
    /// term, and its log is at least as up-to-date as ours.
    fn vote(&mut self, rv: RequestVote) -> Result<()> {
        let (last_index, last_term) = self.log.get_last_index();
        let up_to_date = (rv.last_log_term, rv.last_log_index) >= (last_term, last_index);
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(rv.src);
        let vote_granted = can_vote && up_to_date;
        if vote_granted {
            info!("Voting for {} in term {} election", rv.src, self.term);
            self.persist_term(self.term, Some(rv.src))?;
            self.reset_election_timer();
        } else {
            debug!("Rejecting vote for {} in term {}", rv.src, self.term);
        }
        self.send(Message::RequestVoteReply(RequestVoteReply {
            src: self.id,
            dest: rv.src,
            term: self.term,
            vote_granted,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::{
        code, AppendEntries, AppendEntriesBatch, Heartbeat, LeaderTransfer, Timeout,
    };
    use super::super::tests::*;
    use super::*;
    use crate::storage::FileLog;
    use pretty_assertions::assert_eq;

    /// Creates a follower of node 2 in term 3, with entries [1, 1, 2] of
    /// which the first is committed.
    fn setup() -> Result<(RawNode<Follower>, Harness)> {
        let (mut node, harness) = setup_rawnode(log_with_terms(&[1, 1, 2])?, 3)?;
        node.log.commit(0)?;
        node.applied_index = 0;
        let node = node.into_follower(3, Some(id(2)))?;
        Ok((node, harness))
    }

    fn append(prev: (Index, Term), commit: Index, entries: Vec<Entry>) -> Envelope {
        envelope(Message::AppendEntriesBatch(AppendEntriesBatch {
            src: id(2),
            dest: id(1),
            term: 3,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            commit_index: commit,
            private_term: 3,
            entries,
        }))
    }

    fn append_reply(success: bool, match_index: Index, last_send_index: Index) -> Envelope {
        envelope(Message::AppendEntriesReply(AppendEntriesReply {
            src: id(1),
            dest: id(2),
            term: 3,
            private_term: 3,
            success,
            match_index,
            last_send_index,
            start_time: 0,
        }))
    }

    fn entry(index: Index, term: Term, data: &[u8]) -> Entry {
        Entry::from_request(index, term, request(index as u64, false, data))
    }

    fn heartbeat(term: Term, commit_index: Index) -> Envelope {
        envelope(Message::Heartbeat(Heartbeat {
            src: id(2),
            dest: id(1),
            term,
            commit_index,
            private_term: 3,
            min_match_index: NO_INDEX,
        }))
    }

    fn request_vote(src: RaftId, term: Term, last: (Index, Term)) -> Envelope {
        envelope(Message::RequestVote(RequestVote {
            src,
            dest: id(1),
            term,
            last_log_index: last.0,
            last_log_term: last.1,
        }))
    }

    fn vote_reply(dest: RaftId, term: Term, vote_granted: bool) -> Envelope {
        let reply = RequestVoteReply { src: id(1), dest, term, vote_granted };
        envelope(Message::RequestVoteReply(reply))
    }

    #[test]
    // Heartbeats are answered, but only commit entries known to match the
    // leader's log.
    fn step_heartbeat() -> Result<()> {
        let (follower, harness) = setup()?;
        let mut node = Node::from(follower).step(heartbeat(3, 2))?;
        assert_node(&node).is_follower().term(3).leader(Some(id(2))).committed(0);
        assert_messages(
            &harness.node_rx,
            vec![envelope(Message::HeartbeatReply(HeartbeatReply {
                src: id(1),
                dest: id(2),
                term: 3,
                private_term: 3,
                start_time: 0,
            }))],
        );

        // Once an append confirms the log, the next heartbeat commits it.
        node = node.step(append((2, 2), 0, vec![]))?;
        assert_messages(&harness.node_rx, vec![append_reply(true, 2, 2)]);
        node = node.step(heartbeat(3, 2))?;
        assert_node(&node).committed(2).applied(2);
        assert_eq!(applied(&harness), vec![(1, vec![1]), (2, vec![2])]);
        Ok(())
    }

    #[test]
    // A heartbeat from a new term's leader is followed, and resets the vote.
    fn step_heartbeat_future_term() -> Result<()> {
        let (mut follower, harness) = setup_rawnode(log_with_terms(&[1])?, 3)?;
        follower.persist_term(3, Some(id(3)))?;
        let node = Node::from(follower).step(heartbeat(5, NO_INDEX))?;
        assert_node(&node).is_follower().term(5).voted_for(None).leader(Some(id(2)));
        assert_eq!(harness.term_store.load()?, (5, None));
        Ok(())
    }

    #[test]
    // Appends with a matching base are spliced into the log, and commit up to
    // the leader's commit index.
    fn step_appendentries() -> Result<()> {
        let (follower, harness) = setup()?;
        let entries = vec![entry(3, 3, b"x"), entry(4, 3, b"y")];
        let node = Node::from(follower).step(append((2, 2), 3, entries))?;
        assert_node(&node)
            .is_follower()
            .last(4)
            .committed(3)
            .applied(3)
            .entry_terms(vec![1, 1, 2, 3, 3]);
        assert_messages(&harness.node_rx, vec![append_reply(true, 4, 4)]);
        assert_eq!(applied(&harness), vec![(1, vec![1]), (2, vec![2]), (3, b"x".to_vec())]);
        Ok(())
    }

    #[test]
    // A missing base entry is rejected with our last index as hint.
    fn step_appendentries_missing_base() -> Result<()> {
        let (follower, harness) = setup()?;
        let node = Node::from(follower).step(append((5, 3), 3, vec![entry(6, 3, b"x")]))?;
        assert_node(&node).is_follower().last(2).committed(0);
        assert_messages(&harness.node_rx, vec![append_reply(false, 2, 6)]);
        Ok(())
    }

    #[test]
    // A divergent uncommitted base entry is truncated, along with everything
    // after it, and the hint points before it.
    fn step_appendentries_conflict_truncates() -> Result<()> {
        let (follower, harness) = setup()?;
        let mut node = Node::from(follower).step(append((2, 3), 0, vec![entry(3, 3, b"x")]))?;
        assert_node(&node).is_follower().last(1).entry_terms(vec![1, 1]);
        assert_messages(&harness.node_rx, vec![append_reply(false, 1, 3)]);

        // The leader retries from the hint, which succeeds.
        node = node.step(append((1, 1), 0, vec![entry(2, 3, b"w"), entry(3, 3, b"x")]))?;
        assert_node(&node).last(3).entry_terms(vec![1, 1, 3, 3]);
        assert_messages(&harness.node_rx, vec![append_reply(true, 3, 3)]);
        Ok(())
    }

    #[test]
    // A conflict at a committed index hints at the commit index, without
    // truncating.
    fn step_appendentries_conflict_committed() -> Result<()> {
        let (follower, harness) = setup()?;
        let node = Node::from(follower).step(append((0, 2), 0, vec![]))?;
        assert_node(&node).last(2).entry_terms(vec![1, 1, 2]);
        assert_messages(&harness.node_rx, vec![append_reply(false, 0, 0)]);
        Ok(())
    }

    #[test]
    // Malformed appends are dropped without a reply or log changes: gaps,
    // term regressions, terms beyond ours and conflicts with committed
    // entries.
    fn step_appendentries_invalid_dropped() -> Result<()> {
        let (follower, harness) = setup()?;
        let mut node = Node::from(follower);
        for (prev, entries) in [
            ((2, 2), vec![entry(3, 3, b"a"), entry(5, 3, b"b")]),
            ((2, 2), vec![entry(4, 3, b"a")]),
            ((1, 1), vec![entry(2, 3, b"a"), entry(3, 2, b"b")]),
            ((2, 2), vec![entry(3, 1, b"a")]),
            ((2, 2), vec![entry(3, 4, b"a")]),
            ((NO_INDEX, 0), vec![entry(0, 3, b"a")]),
            ((-7, 0), vec![]),
        ] {
            node = node.step(append(prev, 2, entries))?;
            assert_node(&node).is_follower().term(3).last(2).committed(0);
            assert_node(&node).entry_terms(vec![1, 1, 2]);
            assert_messages(&harness.node_rx, vec![]);
        }

        // A valid append is still accepted.
        node = node.step(append((2, 2), 0, vec![entry(3, 3, b"x")]))?;
        assert_node(&node).last(3);
        assert_messages(&harness.node_rx, vec![append_reply(true, 3, 3)]);
        Ok(())
    }

    #[test]
    // A batch is equivalent to shipping its entries one by one.
    fn step_appendentries_batch_equivalent() -> Result<()> {
        let entries = vec![entry(3, 3, b"a"), entry(4, 3, b"b"), entry(5, 3, b"c")];

        let (batched, _h1) = setup()?;
        let batched = Node::from(batched).step(append((2, 2), 4, entries.clone()))?;

        let (single, _h2) = setup()?;
        let mut single = Node::from(single);
        for (i, e) in entries.into_iter().enumerate() {
            single = single.step(envelope(Message::AppendEntries(AppendEntries {
                src: id(2),
                dest: id(1),
                term: 3,
                prev_log_index: 2 + i as Index,
                prev_log_term: if i == 0 { 2 } else { 3 },
                commit_index: 4,
                private_term: 3,
                entry: Some(e),
            })))?;
        }

        let (Node::Follower(b), Node::Follower(s)) = (&batched, &single) else {
            panic!("expected followers");
        };
        assert_eq!(b.log.scan(0, 5)?, s.log.scan(0, 5)?);
        assert_node(&batched).last(5).committed(4).applied(4);
        assert_node(&single).last(5).committed(4).applied(4);
        Ok(())
    }

    #[test]
    // The commit index never regresses, even if the leader sends a lower one.
    fn step_commit_monotonic() -> Result<()> {
        let (follower, _harness) = setup()?;
        let mut node = Node::from(follower).step(append((2, 2), 2, vec![]))?;
        assert_node(&node).committed(2);
        node = node.step(heartbeat(3, 1))?;
        assert_node(&node).committed(2).applied(2);
        Ok(())
    }

    #[test]
    // A vote is granted once per term to an up-to-date candidate. A second
    // candidate in the same term is rejected.
    fn step_requestvote() -> Result<()> {
        let (follower, harness) = setup_rawnode(log_with_terms(&[1, 1, 2])?, 5)?;
        let mut node = Node::from(follower);

        node = node.step(request_vote(id(2), 5, (2, 2)))?;
        assert_node(&node).is_follower().term(5).voted_for(Some(id(2)));
        assert_messages(&harness.node_rx, vec![vote_reply(id(2), 5, true)]);

        node = node.step(request_vote(id(3), 5, (5, 4)))?;
        assert_node(&node).term(5).voted_for(Some(id(2)));
        assert_messages(&harness.node_rx, vec![vote_reply(id(3), 5, false)]);

        // Retransmits from the same candidate are granted again.
        node = node.step(request_vote(id(2), 5, (2, 2)))?;
        assert_messages(&harness.node_rx, vec![vote_reply(id(2), 5, true)]);
        assert_node(&node).voted_for(Some(id(2)));
        Ok(())
    }

    #[test]
    // A restarted node recovers its log from durable storage, and won't vote
    // for a candidate that is missing its entries.
    fn restart_recovers_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log");
        let open = || -> Result<Log> { Log::new(Box::new(FileLog::open(&path)?)) };

        let (follower, _harness) = setup_rawnode(open()?, 3)?;
        let entries = vec![entry(0, 3, b"a"), entry(1, 3, b"b")];
        let node = Node::from(follower).step(append((NO_INDEX, 0), NO_INDEX, entries))?;
        assert_node(&node).last(1);
        drop(node);

        let (follower, harness) = setup_rawnode(open()?, 3)?;
        let node = Node::from(follower);
        assert_node(&node).is_follower().last(1).entry_terms(vec![3, 3]);
        let node = node.step(request_vote(id(3), 4, (0, 3)))?;
        assert_node(&node).term(4).voted_for(None);
        assert_messages(&harness.node_rx, vec![vote_reply(id(3), 4, false)]);
        Ok(())
    }

    #[test]
    // A known leader doesn't prevent a vote in the same term, as long as the
    // vote hasn't been cast for someone else.
    fn step_requestvote_known_leader() -> Result<()> {
        let (follower, harness) = setup()?;
        let mut node = Node::from(follower).step(heartbeat(3, NO_INDEX))?;
        assert_node(&node).is_follower().term(3).leader(Some(id(2))).voted_for(None);
        harness.node_rx.try_iter().for_each(drop);

        node = node.step(request_vote(id(3), 3, (5, 3)))?;
        assert_node(&node).is_follower().term(3).voted_for(Some(id(3)));
        assert_messages(&harness.node_rx, vec![vote_reply(id(3), 3, true)]);
        assert_eq!(harness.term_store.load()?, (3, Some(id(3))));

        node = node.step(request_vote(id(2), 3, (5, 3)))?;
        assert_node(&node).voted_for(Some(id(3)));
        assert_messages(&harness.node_rx, vec![vote_reply(id(2), 3, false)]);
        Ok(())
    }

    #[test]
    // Candidates with outdated logs don't get a vote.
    fn step_requestvote_outdated_log() -> Result<()> {
        let (follower, harness) = setup_rawnode(log_with_terms(&[1, 1, 2])?, 5)?;
        let mut node = Node::from(follower);

        // Lower last term.
        node = node.step(request_vote(id(2), 5, (9, 1)))?;
        assert_messages(&harness.node_rx, vec![vote_reply(id(2), 5, false)]);

        // Same last term, shorter log.
        node = node.step(request_vote(id(2), 5, (1, 2)))?;
        assert_messages(&harness.node_rx, vec![vote_reply(id(2), 5, false)]);
        assert_node(&node).voted_for(None);

        // A future term is adopted even if the vote is rejected.
        node = node.step(request_vote(id(3), 6, (1, 2)))?;
        assert_node(&node).term(6).voted_for(None);
        assert_messages(&harness.node_rx, vec![vote_reply(id(3), 6, false)]);
        Ok(())
    }

    #[test]
    // A follower times out after the election timeout and campaigns.
    fn tick_election_timeout() -> Result<()> {
        let (follower, harness) = setup()?;
        let mut node = Node::from(follower);
        for _ in 0..9 {
            node = node.tick()?;
            assert_node(&node).is_follower();
        }
        node = node.tick()?;
        assert_node(&node).is_candidate().term(4).voted_for(Some(id(1)));
        assert_messages(
            &harness.node_rx,
            vec![
                envelope(Message::RequestVote(RequestVote {
                    src: id(1),
                    dest: id(2),
                    term: 4,
                    last_log_index: 2,
                    last_log_term: 2,
                })),
                envelope(Message::RequestVote(RequestVote {
                    src: id(1),
                    dest: id(3),
                    term: 4,
                    last_log_index: 2,
                    last_log_term: 2,
                })),
            ],
        );
        Ok(())
    }

    #[test]
    // Leader messages reset the election timer.
    fn tick_leader_resets_timer() -> Result<()> {
        let (follower, _harness) = setup()?;
        let mut node = Node::from(follower);
        for _ in 0..3 {
            for _ in 0..9 {
                node = node.tick()?;
            }
            node = node.step(heartbeat(3, 0))?;
        }
        assert_node(&node).is_follower().term(3);
        Ok(())
    }

    #[test]
    // Election timeouts are only honored for the current timer arming.
    fn step_timeout_clock() -> Result<()> {
        let (follower, _harness) = setup()?;
        let clock = follower.election_clock;
        let timeout = |logic_clock| {
            envelope(Message::Timeout(Timeout {
                kind: TimeoutKind::Election,
                logic_clock,
                timer_ms: 1000,
            }))
        };

        let mut node = Node::from(follower).step(timeout(clock - 1))?;
        assert_node(&node).is_follower().term(3);
        node = node.step(timeout(clock))?;
        assert_node(&node).is_candidate().term(4);
        Ok(())
    }

    #[test]
    // Nodes outside the membership never campaign.
    fn tick_non_member() -> Result<()> {
        let (follower, harness) =
            setup_rawnode_members(log_with_terms(&[1])?, 1, vec![id(2), id(3)])?;
        let mut node = Node::from(follower);
        for _ in 0..30 {
            node = node.tick()?;
        }
        assert_node(&node).is_follower().term(1);
        assert_messages(&harness.node_rx, vec![]);
        Ok(())
    }

    #[test]
    // A leader transfer from the current leader makes us campaign at once.
    fn step_leadertransfer() -> Result<()> {
        let (follower, harness) = setup()?;
        let node = Node::from(follower).step(envelope(Message::LeaderTransfer(LeaderTransfer {
            src: id(2),
            dest: id(1),
            term: 3,
            new_leader: id(1),
        })))?;
        assert_node(&node).is_candidate().term(4).voted_for(Some(id(1)));
        assert_eq!(harness.node_rx.try_iter().count(), 2);
        Ok(())
    }

    #[test]
    // Local commands can force a term change or a commit.
    fn step_localcmd() -> Result<()> {
        let (follower, _harness) = setup()?;
        let mut node = Node::from(follower).step(append((2, 2), 0, vec![]))?;

        let commit = LocalCmd::FollowerCommit { commit_index: 9 };
        node = node.step(envelope(Message::LocalCmd(commit)))?;
        assert_node(&node).committed(2).applied(2);

        node = node.step(envelope(Message::LocalCmd(LocalCmd::StepDown { new_term: 2 })))?;
        assert_node(&node).is_follower().term(3).leader(Some(id(2)));

        node = node.step(envelope(Message::LocalCmd(LocalCmd::StepDown { new_term: 7 })))?;
        assert_node(&node).is_follower().term(7).leader(None);
        Ok(())
    }

    #[test]
    // Client requests are rejected with the leader as hint.
    fn step_clientrequest() -> Result<()> {
        let (follower, harness) = setup()?;
        let node =
            Node::from(follower).step(envelope(Message::ClientRequest(request(4, false, b"a"))))?;
        assert_node(&node).is_follower().last(2);
        assert_messages(&harness.node_rx, vec![reply(4, code::NOT_LEADER, Some(id(2)), vec![])]);
        Ok(())
    }
}
