use super::super::{
    noop_request, LocalCmd, Message, RaftId, RequestVote, RequestVoteReply, TimeoutKind,
};
use super::{Follower, Leader, Node, NodeRole, RawNode, Role, Term, Ticks};
use crate::error::Result;

use ::log::{debug, info, warn};
use std::collections::HashSet;

/// A candidate is campaigning to become a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Votes received (including ourself).
    votes: HashSet<RaftId>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    pub(super) fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {
    const KIND: NodeRole = NodeRole::Candidate;
}

impl RawNode<Candidate> {
    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    pub(super) fn into_follower(
        mut self,
        term: Term,
        leader: Option<RaftId>,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "Term regression {} → {}", self.term, term);

        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term, "Can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
        } else if term > self.term {
            // We found a new term, but don't know who the leader is yet.
            info!("Discovered new term {term}");
            self.persist_term(term, None)?;
        } else {
            info!("Abandoning election in term {term}");
        }
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Follower::new(leader, election_timeout));
        node.election_clock += 1;
        Ok(node)
    }

    /// Transitions the candidate to a leader. We won the election.
    pub(super) fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let peers = self.peers();
        let (last_index, _) = self.log.get_last_index();
        let session = self.term;
        let mut node = self.into_role(Leader::new(peers, last_index, session));

        // Propose a noop entry to commit entries from previous terms, and
        // assert leadership with an immediate heartbeat.
        node.propose(vec![noop_request()])?;
        node.heartbeat()?;
        node.maybe_commit_and_apply()?;
        Ok(node)
    }

    /// Becomes leader if we have a quorum of votes from current members.
    pub(super) fn maybe_win(self) -> Result<Node> {
        let votes = self.role.votes.iter().filter(|v| self.membership.contains(v)).count();
        if votes >= self.membership.quorum_size() {
            return Ok(self.into_leader()?.into());
        }
        Ok(self.into())
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
                return self.into_follower(term, None)?.step(msg);
            }
        }

        match msg {
            // We already voted for ourself in this term.
            Message::RequestVote(rv) => {
                debug!("Rejecting vote for {} in term {}, voted for self", rv.src, self.term);
                self.send(Message::RequestVoteReply(RequestVoteReply {
                    src: self.id,
                    dest: rv.src,
                    term: self.term,
                    vote_granted: false,
                }))?;
            }

            Message::RequestVoteReply(reply) if reply.vote_granted => {
                debug!("Received vote from {} in term {}", reply.src, self.term);
                self.role.votes.insert(reply.src);
                return self.maybe_win();
            }

            Message::RequestVoteReply(_) => {}

            Message::LeaderTransfer(_) if local => {
                warn!("Can't transfer leadership from candidate, ignoring");
            }

            // Someone else won the election in this term. Follow them, and
            // process the message as a follower.
            Message::Heartbeat(_)
            | Message::AppendEntries(_)
            | Message::AppendEntriesBatch(_)
            | Message::PreSnapshot(_)
            | Message::SnapshotSend(_)
            | Message::LeaderTransfer(_) => {
                let (term, leader) = (self.term, msg.src());
                return self.into_follower(term, leader)?.step(msg);
            }

            // There is no leader to redirect to.
            Message::ClientRequest(_) | Message::ClientRequestBatch(_) => {
                self.reject_requests(&msg, None)?;
            }

            Message::LocalCmd(LocalCmd::StepDown { new_term }) => {
                let term = new_term.max(self.term);
                return Ok(self.into_follower(term, None)?.into());
            }

            Message::LocalCmd(LocalCmd::FollowerCommit { .. }) => {
                debug!("Ignoring follower commit as candidate");
            }

            Message::Timeout(t) => {
                if t.kind == TimeoutKind::Election && self.timeout_is_current(&t) {
                    self.campaign()?;
                    return self.maybe_win();
                }
            }

            // Replies to a leadership we no longer hold.
            Message::AppendEntriesReply(_)
            | Message::HeartbeatReply(_)
            | Message::PreSnapshotReply(_)
            | Message::SnapshotRsp(_) => {
                debug!("Ignoring leader reply as candidate: {msg:?}");
            }

            Message::Ping(_) | Message::PingReply(_) | Message::ClientRequestReply(_) => {
                unreachable!("handled by step_common")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. If the election times out without a
    /// winner, a new election is held in the next term.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
            return self.maybe_win();
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by increasing the term, voting for ourself,
    /// and soliciting votes from all peers. The vote is persisted before any
    /// request is sent.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id);
        self.persist_term(term, Some(self.id))?;
        self.election_clock += 1;

        let (last_log_index, last_log_term) = self.log.get_last_index();
        self.broadcast(|peer| {
            Message::RequestVote(RequestVote {
                src: self.id,
                dest: peer,
                term,
                last_log_index,
                last_log_term,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::{
        code, AppendEntriesReply, Envelope, Heartbeat, HeartbeatReply, Index, MsgType, Timeout,
        NO_INDEX,
    };
    use super::super::tests::*;
    use super::*;
    use pretty_assertions::assert_eq;

    /// Creates a candidate in term 2 with log entries [1, 1, 2], campaigning
    /// in a 3-node group. The RequestVote messages are drained.
    fn setup() -> Result<(RawNode<Candidate>, Harness)> {
        setup_members(vec![id(1), id(2), id(3)])
    }

    fn setup_members(members: Vec<RaftId>) -> Result<(RawNode<Candidate>, Harness)> {
        let (node, harness) = setup_rawnode_members(log_with_terms(&[1, 1, 2])?, 1, members)?;
        let node = node.into_candidate()?;
        harness.node_rx.try_iter().for_each(drop);
        Ok((node, harness))
    }

    fn vote(src: RaftId, term: Term, vote_granted: bool) -> Envelope {
        let reply = RequestVoteReply { src, dest: id(1), term, vote_granted };
        envelope(Message::RequestVoteReply(reply))
    }

    fn heartbeat(src: RaftId, term: Term, commit_index: Index) -> Envelope {
        envelope(Message::Heartbeat(Heartbeat {
            src,
            dest: id(1),
            term,
            commit_index,
            private_term: term,
            min_match_index: NO_INDEX,
        }))
    }

    #[test]
    // Campaigning bumps the term, votes for ourself and solicits votes.
    fn campaign() -> Result<()> {
        let (node, harness) = setup_rawnode(log_with_terms(&[1, 1, 2])?, 1)?;
        let node = Node::from(node.into_candidate()?);
        assert_node(&node).is_candidate().term(2).voted_for(Some(id(1)));
        assert_messages(
            &harness.node_rx,
            [2, 3]
                .into_iter()
                .map(|peer| {
                    envelope(Message::RequestVote(RequestVote {
                        src: id(1),
                        dest: id(peer),
                        term: 2,
                        last_log_index: 2,
                        last_log_term: 2,
                    }))
                })
                .collect(),
        );
        Ok(())
    }

    #[test]
    // A quorum of votes wins the election. The new leader proposes a noop
    // and heartbeats its peers.
    fn step_requestvotereply_wins() -> Result<()> {
        let (candidate, harness) = setup()?;
        let mut node = Node::from(candidate);

        node = node.step(vote(id(3), 2, false))?;
        assert_node(&node).is_candidate();

        node = node.step(vote(id(2), 2, true))?;
        assert_node(&node)
            .is_leader()
            .term(2)
            .last(3)
            .committed(NO_INDEX)
            .entry_terms(vec![1, 1, 2, 2]);
        let types: Vec<_> = harness.node_rx.try_iter().map(|e| e.message.msg_type()).collect();
        assert_eq!(
            types,
            vec![
                MsgType::AppendEntries,
                MsgType::AppendEntries,
                MsgType::Heartbeat,
                MsgType::Heartbeat,
            ]
        );
        Ok(())
    }

    #[test]
    // Duplicate votes and votes from non-members don't count.
    fn step_requestvotereply_duplicates() -> Result<()> {
        let (candidate, _harness) = setup_members(vec![id(1), id(2), id(3), id(4), id(5)])?;
        let mut node = Node::from(candidate);
        node = node.step(vote(id(2), 2, true))?;
        node = node.step(vote(id(2), 2, true))?;
        node = node.step(vote(id(9), 2, true))?;
        assert_node(&node).is_candidate();
        node = node.step(vote(id(4), 2, true))?;
        assert_node(&node).is_leader();
        Ok(())
    }

    #[test]
    // A heartbeat from another leader in the same term makes us follow it.
    fn step_heartbeat_same_term() -> Result<()> {
        let (candidate, harness) = setup()?;
        let node = Node::from(candidate).step(heartbeat(id(3), 2, NO_INDEX))?;
        assert_node(&node).is_follower().term(2).voted_for(Some(id(1))).leader(Some(id(3)));
        assert_messages(
            &harness.node_rx,
            vec![envelope(Message::HeartbeatReply(HeartbeatReply {
                src: id(1),
                dest: id(3),
                term: 2,
                private_term: 2,
                start_time: 0,
            }))],
        );
        Ok(())
    }

    #[test]
    // A message from a future term makes us a leaderless follower in that
    // term, which then processes it.
    fn step_future_term() -> Result<()> {
        let (candidate, harness) = setup()?;
        let node = Node::from(candidate).step(vote(id(2), 4, false))?;
        assert_node(&node).is_follower().term(4).voted_for(None).leader(None);
        assert_messages(&harness.node_rx, vec![]);
        Ok(())
    }

    #[test]
    // Other candidates in the same term don't get our vote.
    fn step_requestvote() -> Result<()> {
        let (candidate, harness) = setup()?;
        let node = Node::from(candidate).step(envelope(Message::RequestVote(RequestVote {
            src: id(3),
            dest: id(1),
            term: 2,
            last_log_index: 9,
            last_log_term: 2,
        })))?;
        assert_node(&node).is_candidate().term(2).voted_for(Some(id(1)));
        assert_messages(
            &harness.node_rx,
            vec![envelope(Message::RequestVoteReply(RequestVoteReply {
                src: id(1),
                dest: id(3),
                term: 2,
                vote_granted: false,
            }))],
        );
        Ok(())
    }

    #[test]
    // An election timeout without a winner starts a new election.
    fn tick_election_timeout() -> Result<()> {
        let (candidate, harness) = setup()?;
        let mut node = Node::from(candidate);
        for _ in 0..9 {
            node = node.tick()?;
            assert_node(&node).is_candidate().term(2);
        }
        node = node.tick()?;
        assert_node(&node).is_candidate().term(3).voted_for(Some(id(1)));
        assert_eq!(harness.node_rx.try_iter().count(), 2);

        // Stale election timeouts are ignored, current ones campaign.
        let Node::Candidate(n) = &node else { panic!("expected candidate") };
        let clock = n.election_clock;
        let timeout = |logic_clock| {
            envelope(Message::Timeout(Timeout {
                kind: TimeoutKind::Election,
                logic_clock,
                timer_ms: 1,
            }))
        };
        node = node.step(timeout(clock - 1))?;
        assert_node(&node).term(3);
        node = node.step(timeout(clock))?;
        assert_node(&node).is_candidate().term(4);
        Ok(())
    }

    #[test]
    // Candidates reject client requests without a leader hint, ignore stray
    // leader replies, and step down on request.
    fn step_misc() -> Result<()> {
        let (candidate, harness) = setup()?;
        let mut node =
            Node::from(candidate).step(envelope(Message::ClientRequest(request(3, true, b"x"))))?;
        assert_messages(&harness.node_rx, vec![reply(3, code::NOT_LEADER, None, vec![])]);

        node = node.step(envelope(Message::AppendEntriesReply(AppendEntriesReply {
            src: id(2),
            dest: id(1),
            term: 2,
            private_term: 2,
            success: true,
            match_index: 2,
            last_send_index: 2,
            start_time: 0,
        })))?;
        assert_node(&node).is_candidate();

        node = node.step(envelope(Message::LocalCmd(LocalCmd::StepDown { new_term: 0 })))?;
        assert_node(&node).is_follower().term(2).leader(None);
        Ok(())
    }
}
