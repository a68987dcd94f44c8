//! Snapshot transfers, for peers that have fallen behind the leader's
//! retained log window.
//!
//! The leader announces a transfer with PreSnapshot, and the receiver replies
//! with the index it wants the transfer to begin at. If the leader still has
//! that entry, it resumes plain log replication. Otherwise, it snapshots its
//! state machine and ships it as a stop-and-wait sequence of SnapshotSend
//! frames, each of which must be acknowledged before the next is sent:
//!
//! BEGIN (metadata only) → chunk 0 → chunk 1 → ... → END
//!
//! On END, the receiver installs the state machine snapshot, resets its log
//! base to the snapshot's last index and term, and adopts the snapshot's
//! membership. Any error code or a timeout aborts the transfer, which is then
//! restarted from PreSnapshot. Each attempt is identified by its start time,
//! which strictly increases per peer, so acknowledgements of an earlier
//! attempt are ignored.

use super::super::{
    code, seq, Index, Membership, Message, PreSnapshot, PreSnapshotReply, RaftId, Snapshot,
    SnapshotRsp, SnapshotSend, NO_INDEX,
};
use super::{Follower, Leader, RawNode, Term, Ticks};
use crate::error::{Error, Result};

use ::log::{debug, info, warn};

/// An outbound snapshot transfer, tracked in the leader's peer progress.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct SnapshotSender {
    /// Ticks since the last acknowledgement. The transfer is aborted once
    /// this reaches the snapshot timeout.
    idle: Ticks,
    /// The transfer, once the receiver has replied to PreSnapshot.
    transfer: Option<Transfer>,
}

#[derive(Clone, Debug, PartialEq)]
struct Transfer {
    term: Term,
    /// The index the receiver asked the transfer to begin at.
    begin_index: Index,
    last_index: Index,
    last_term: Term,
    /// The membership as of last_index.
    last_config: Membership,
    start_time: i64,
    /// The last frame sent, awaiting acknowledgement.
    seq: i32,
    data: Vec<u8>,
}

impl Transfer {
    /// Returns the number of data chunks.
    fn chunks(&self, chunk_size: usize) -> usize {
        self.data.len().div_ceil(chunk_size.max(1))
    }

    /// Builds the frame with the given seq.
    fn frame(&self, src: RaftId, dest: RaftId, seq: i32, chunk_size: usize) -> Message {
        let data = match seq {
            seq::BEGIN | seq::END => vec![],
            chunk => {
                let start = (chunk as usize * chunk_size).min(self.data.len());
                let end = (start + chunk_size).min(self.data.len());
                self.data[start..end].to_vec()
            }
        };
        Message::SnapshotSend(SnapshotSend {
            src,
            dest,
            term: self.term,
            begin_index: self.begin_index,
            last_index: self.last_index,
            last_term: self.last_term,
            last_config_index: self.last_config.last_config_index,
            last_config: self.last_config.clone(),
            start_time: self.start_time,
            seq,
            data,
        })
    }
}

/// An inbound snapshot transfer, tracked by the follower.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct SnapshotReceiver {
    term: Term,
    begin_index: Index,
    last_index: Index,
    last_term: Term,
    last_config: Membership,
    start_time: i64,
    /// The next expected chunk.
    next_seq: i32,
    data: Vec<u8>,
}

impl SnapshotReceiver {
    /// Whether a frame belongs to this transfer. Frames from another leader
    /// term or attempt don't.
    fn matches(&self, frame: &SnapshotSend) -> bool {
        self.term == frame.term && self.start_time == frame.start_time
    }
}

impl RawNode<Leader> {
    /// Announces a snapshot transfer to a peer whose next index precedes our
    /// retained log window.
    pub(super) fn send_pre_snapshot(&mut self, peer: RaftId) -> Result<()> {
        let Some(progress) = self.role.progress.get_mut(&peer) else {
            return Ok(());
        };
        info!("Peer {peer} needs compacted index {}, starting snapshot transfer", progress.next);
        progress.private_term += 1;
        progress.snapshot = Some(SnapshotSender { idle: 0, transfer: None });
        self.send(Message::PreSnapshot(PreSnapshot { src: self.id, dest: peer, term: self.term }))
    }

    /// Handles the receiver's reply to PreSnapshot. If we still have the
    /// entry it wants to begin at, log replication resumes from there.
    /// Otherwise, we snapshot the state machine and send the BEGIN frame.
    pub(super) fn receive_pre_snapshot_reply(&mut self, reply: PreSnapshotReply) -> Result<()> {
        let peer = reply.src;
        let awaiting = self
            .role
            .progress
            .get(&peer)
            .and_then(|p| p.snapshot.as_ref())
            .is_some_and(|s| s.transfer.is_none());
        if !awaiting {
            debug!("Ignoring unexpected pre-snapshot reply from {peer}");
            return Ok(());
        }

        let (last_index, _) = self.log.get_last_index();
        if reply.snap_start >= self.log.begin_index() {
            info!("Peer {peer} has entries before {}, resuming log replication", reply.snap_start);
            if let Some(progress) = self.role.progress.get_mut(&peer) {
                // Everything the receiver committed matches our log.
                progress.snapshot = None;
                progress.private_term += 1;
                let matched = (reply.snap_start - 1).min(last_index);
                progress.match_index = progress.match_index.max(matched);
                progress.next = reply.snap_start.min(last_index + 1).max(progress.match_index + 1);
            }
            return self.send_log(peer);
        }

        let snapshot = self.state.snapshot()?;
        let applied_index = self.applied_index;
        let Some(last_term) = self.log.term_at(applied_index)? else {
            return Err(Error::Internal(format!("missing term for applied index {applied_index}")));
        };
        let last_snapshot_start =
            self.role.progress.get(&peer).map_or(0, |p| p.last_snapshot_start);
        let transfer = Transfer {
            term: self.term,
            begin_index: reply.snap_start,
            last_index: applied_index,
            last_term,
            last_config: self.membership.clone(),
            start_time: self.now().max(last_snapshot_start + 1),
            seq: seq::BEGIN,
            data: snapshot.data,
        };
        info!(
            "Sending snapshot at index {applied_index} to {peer} ({} bytes, start time {})",
            transfer.data.len(),
            transfer.start_time
        );
        let frame = transfer.frame(self.id, peer, seq::BEGIN, self.opts.snapshot_chunk_size);
        if let Some(progress) = self.role.progress.get_mut(&peer) {
            progress.last_snapshot_start = transfer.start_time;
            progress.snapshot = Some(SnapshotSender { idle: 0, transfer: Some(transfer) });
        }
        self.send(frame)
    }

    /// Handles a snapshot frame acknowledgement, sending the next frame. Once
    /// END is acknowledged, the peer matches the snapshot's last index and
    /// log replication resumes.
    pub(super) fn receive_snapshot_rsp(&mut self, rsp: SnapshotRsp) -> Result<()> {
        let peer = rsp.src;
        let chunk_size = self.opts.snapshot_chunk_size;
        let Some(progress) = self.role.progress.get_mut(&peer) else {
            return Ok(());
        };
        let Some(sender) = progress.snapshot.as_mut() else {
            debug!("Ignoring snapshot ack from {peer} without transfer");
            return Ok(());
        };
        let Some(transfer) = sender.transfer.as_mut() else {
            debug!("Ignoring snapshot ack from {peer} before transfer start");
            return Ok(());
        };
        if rsp.start_time != transfer.start_time || rsp.ack != transfer.seq {
            debug!("Ignoring stale snapshot ack {} from {peer}", rsp.ack);
            return Ok(());
        }
        if rsp.code != code::OK {
            warn!("Snapshot transfer to {peer} failed at seq {} with code {}", rsp.ack, rsp.code);
            return self.abort_snapshot(peer);
        }
        sender.idle = 0;

        let next_seq = match rsp.ack {
            seq::END => {
                let last_index = transfer.last_index;
                info!("Snapshot transfer to {peer} completed at index {last_index}");
                progress.snapshot = None;
                progress.private_term += 1;
                progress.match_index = progress.match_index.max(last_index);
                progress.next = progress.match_index + 1;
                self.maybe_commit_and_apply()?;
                return self.send_log(peer);
            }
            seq::BEGIN => 0,
            chunk => chunk + 1,
        };
        let seq = match next_seq as usize {
            n if n < transfer.chunks(chunk_size) => next_seq,
            _ => seq::END,
        };
        transfer.seq = seq;
        let frame = transfer.frame(self.id, peer, seq, chunk_size);
        self.send(frame)
    }

    /// Aborts a snapshot transfer and restarts replication, which typically
    /// restarts the transfer with a new PreSnapshot.
    fn abort_snapshot(&mut self, peer: RaftId) -> Result<()> {
        if let Some(progress) = self.role.progress.get_mut(&peer) {
            progress.snapshot = None;
            progress.private_term += 1;
            progress.next = progress.match_index + 1;
        }
        self.send_log(peer)
    }

    /// Advances snapshot transfer timers, aborting idle transfers.
    pub(super) fn tick_snapshots(&mut self) -> Result<()> {
        let timeout = self.opts.snapshot_timeout;
        let mut expired = Vec::new();
        for (peer, progress) in self.role.progress.iter_mut() {
            if let Some(sender) = progress.snapshot.as_mut() {
                sender.idle += 1;
                if sender.idle >= timeout {
                    expired.push(*peer);
                }
            }
        }
        for peer in expired {
            warn!("Snapshot transfer to {peer} timed out, restarting");
            self.abort_snapshot(peer)?;
        }
        Ok(())
    }
}

impl RawNode<Follower> {
    /// Answers a transfer announcement with the index the transfer should
    /// begin at: everything before it is committed here. Any partial
    /// transfer is discarded.
    pub(super) fn receive_pre_snapshot(&mut self, pre: PreSnapshot) -> Result<()> {
        if self.role.snapshot.take().is_some() {
            debug!("Discarding partial snapshot transfer");
        }
        self.send(Message::PreSnapshotReply(PreSnapshotReply {
            src: self.id,
            dest: pre.src,
            term: self.term,
            snap_start: self.log.get_commit_index() + 1,
        }))
    }

    /// Handles a snapshot frame. BEGIN starts a new transfer, chunks must
    /// arrive in sequence, and END installs the snapshot.
    pub(super) fn receive_snapshot(&mut self, frame: SnapshotSend) -> Result<()> {
        let (id, term, start_time) = (self.id, self.term, frame.start_time);
        let (dest, last_index, last_term) = (frame.src, frame.last_index, frame.last_term);
        let rsp = |code, ack, snap_begin_index| {
            Message::SnapshotRsp(SnapshotRsp {
                src: id,
                dest,
                term,
                last_index,
                last_term,
                start_time,
                ack,
                code,
                snap_begin_index,
            })
        };

        match frame.seq {
            seq::BEGIN => {
                debug!("Receiving snapshot at index {last_index} from {dest}");
                let begin_index = frame.begin_index;
                self.role.snapshot = Some(SnapshotReceiver {
                    term: frame.term,
                    begin_index,
                    last_index,
                    last_term,
                    last_config: frame.last_config,
                    start_time,
                    next_seq: 0,
                    data: Vec::new(),
                });
                self.send(rsp(code::OK, seq::BEGIN, begin_index))
            }

            seq::END => {
                let receiver = match self.role.snapshot.take() {
                    Some(receiver) if receiver.matches(&frame) => receiver,
                    other => {
                        self.role.snapshot = other;
                        warn!("Snapshot END from {dest} without matching transfer");
                        return self.send(rsp(code::SNAPSHOT_OUT_OF_ORDER, seq::END, NO_INDEX));
                    }
                };
                let code = self.install_snapshot(receiver)?;
                self.send(rsp(code, seq::END, NO_INDEX))
            }

            chunk if chunk >= 0 => {
                let receiver = self.role.snapshot.as_mut();
                let Some(receiver) = receiver.filter(|r| r.matches(&frame)) else {
                    warn!("Snapshot chunk {chunk} from {dest} without matching transfer");
                    return self.send(rsp(code::SNAPSHOT_OUT_OF_ORDER, chunk, NO_INDEX));
                };
                if chunk == receiver.next_seq {
                    receiver.data.extend(frame.data);
                    receiver.next_seq += 1;
                } else if chunk > receiver.next_seq {
                    let expect = receiver.next_seq;
                    warn!("Snapshot chunk {chunk} from {dest} out of order, expected {expect}");
                    self.role.snapshot = None;
                    return self.send(rsp(code::SNAPSHOT_OUT_OF_ORDER, chunk, NO_INDEX));
                }
                // Duplicate chunks are acknowledged again.
                self.send(rsp(code::OK, chunk, NO_INDEX))
            }

            invalid => {
                warn!("Invalid snapshot seq {invalid} from {dest}");
                self.send(rsp(code::SNAPSHOT_OUT_OF_ORDER, seq::INVALID, NO_INDEX))
            }
        }
    }

    /// Installs a received snapshot: the state machine, the log base and the
    /// membership. Returns the acknowledgement code. Snapshots we've already
    /// applied past are acknowledged without installing.
    fn install_snapshot(&mut self, receiver: SnapshotReceiver) -> Result<i32> {
        let SnapshotReceiver { term, begin_index, last_index, last_term, last_config, data, .. } =
            receiver;
        if last_index > self.applied_index {
            info!("Installing snapshot at index {last_index} term {last_term} from term {term}");
            debug!("Snapshot transfer was requested from index {begin_index}");
            if let Err(err) = self.state.restore(Snapshot { last_index, data }) {
                warn!("Failed installing snapshot at index {last_index}: {err}");
                return Ok(code::SNAPSHOT_INSTALL_FAILED);
            }
            self.log.install_snapshot(last_index, last_term)?;
            self.applied_index = last_index;
            self.apply_config(last_config)?;
        } else {
            debug!("Snapshot at index {last_index} already applied");
        }
        self.role.match_index = self.role.match_index.max(last_index);
        Ok(code::OK)
    }
}
