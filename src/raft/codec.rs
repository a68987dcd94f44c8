//! The Raft wire codec. Every message is encoded as a fixed header followed by
//! the message fields in a fixed order, with variable-length data prefixed by
//! its length. All integers are little-endian.
//!
//! Header | Type | Description
//! -------|------|-----------------------------------------------------------
//! bytes  | u32  | total message length, including the header
//! group  | i32  | the group ID
//! type   | u32  | the message type, see [`MsgType`]
//!
//! Batch messages keep per-item metadata in a count-prefixed array ahead of the
//! concatenated item bodies, so the metadata can be scanned without touching
//! the payloads:
//!
//! * ClientRequestBatch: count, body length, `(seq_num, is_weak)` × count, then
//!   `(original_type, length, data)` × count.
//! * AppendEntriesBatch: the AppendEntries fields, count, body length,
//!   `(offset, length)` × count, then the encoded entries.
//!
//! Timeout and LocalCmd messages are local to a process and can't be encoded.

use super::{
    AppendEntries, AppendEntriesBatch, AppendEntriesReply, ClientRequest, ClientRequestBatch,
    ClientRequestReply, Entry, Envelope, Heartbeat, HeartbeatReply, LeaderTransfer, Membership,
    Message, MsgType, Ping, PreSnapshot, PreSnapshotReply, RaftId, RequestVote, RequestVoteReply,
    SnapshotRsp, SnapshotSend,
};
use crate::error::{Error, Result};

use bytes::{Buf as _, BufMut as _, BytesMut};
use std::io::{Read, Write};

/// The header length: bytes, group_id and msg_type.
pub const HEADER_LEN: usize = 12;

/// The maximum accepted frame length. Larger frames are rejected without
/// reading them.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

impl Envelope {
    /// Encodes the envelope into a self-delimiting frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let msg_type = self.message.msg_type();
        if msg_type.is_local() {
            return Err(Error::InvalidInput(format!("can't encode local message {msg_type:?}")));
        }
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0); // length placeholder
        buf.put_i32_le(self.group_id);
        buf.put_u32_le(msg_type as u32);
        encode_message(&mut buf, &self.message)?;

        let len = u32::try_from(buf.len())
            .map_err(|_| Error::InvalidInput(format!("message too large ({} bytes)", buf.len())))?;
        buf[0..4].copy_from_slice(&len.to_le_bytes());
        Ok(buf.to_vec())
    }

    /// Decodes an envelope from a complete frame. The frame's length field must
    /// match the buffer length exactly.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = Reader::new(frame);
        let len = r.u32()? as usize;
        if len != frame.len() {
            return Err(Error::Decode(format!(
                "length field {len} does not match buffer length {}",
                frame.len()
            )));
        }
        let group_id = r.i32()?;
        let raw_type = r.u32()?;
        let msg_type = MsgType::try_from(raw_type)
            .map_err(|t| Error::Decode(format!("unknown message type {t}")))?;
        if msg_type.is_local() {
            return Err(Error::Decode(format!("local message type {msg_type:?} on the wire")));
        }
        let message = decode_message(&mut r, msg_type)?;
        r.finish()?;
        Ok(Self { group_id, message })
    }
}

/// Writes an envelope as a frame.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    writer.write_all(&envelope.encode()?)?;
    Ok(())
}

/// Reads a frame and decodes it. Returns None if the reader is at EOF before
/// the frame starts.
///
/// A frame that can't be decoded is returned as an Error::Decode, after it has
/// been consumed in full, so the caller can drop it and keep reading. IO
/// errors and invalid frame lengths leave the stream unusable.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_buf = [0; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
        return Err(Error::IO(format!("invalid frame length {len}")));
    }
    let mut frame = vec![0; len];
    frame[0..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[4..])?;
    Envelope::decode(&frame).map(Some)
}

fn encode_message(buf: &mut BytesMut, message: &Message) -> Result<()> {
    match message {
        Message::Ping(m) | Message::PingReply(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            put_data(buf, &m.data)?;
        }

        Message::ClientRequest(m) => {
            buf.put_u32_le(m.original_type);
            buf.put_u64_le(m.seq_num);
            buf.put_u8(m.is_weak as u8);
            put_data(buf, &m.data)?;
        }

        Message::ClientRequestBatch(m) => {
            let mut body = BytesMut::new();
            for request in &m.requests {
                body.put_u32_le(request.original_type);
                put_data(&mut body, &request.data)?;
            }
            put_len(buf, m.requests.len())?;
            put_len(buf, body.len())?;
            for request in &m.requests {
                buf.put_u64_le(request.seq_num);
                buf.put_u8(request.is_weak as u8);
            }
            buf.put_slice(&body);
        }

        Message::ClientRequestReply(m) => {
            buf.put_u64_le(m.seq_num);
            buf.put_i32_le(m.err_code);
            put_optional_id(buf, &m.leader_hint);
            put_data(buf, &m.data)?;
        }

        Message::RequestVote(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_i64_le(m.last_log_index);
            buf.put_u64_le(m.last_log_term);
        }

        Message::RequestVoteReply(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_u8(m.vote_granted as u8);
        }

        Message::AppendEntries(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_i64_le(m.prev_log_index);
            buf.put_u64_le(m.prev_log_term);
            buf.put_i64_le(m.commit_index);
            buf.put_u64_le(m.private_term);
            match &m.entry {
                Some(entry) => {
                    buf.put_u8(1);
                    put_entry(buf, entry)?;
                }
                None => buf.put_u8(0),
            }
        }

        Message::AppendEntriesBatch(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_i64_le(m.prev_log_index);
            buf.put_u64_le(m.prev_log_term);
            buf.put_i64_le(m.commit_index);
            buf.put_u64_le(m.private_term);

            let mut body = BytesMut::new();
            let mut descriptors = Vec::with_capacity(m.entries.len());
            for entry in &m.entries {
                let offset = body.len();
                put_entry(&mut body, entry)?;
                descriptors.push((offset, body.len() - offset));
            }
            put_len(buf, m.entries.len())?;
            put_len(buf, body.len())?;
            for (offset, len) in descriptors {
                put_len(buf, offset)?;
                put_len(buf, len)?;
            }
            buf.put_slice(&body);
        }

        Message::AppendEntriesReply(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_u64_le(m.private_term);
            buf.put_u8(m.success as u8);
            buf.put_i64_le(m.match_index);
            buf.put_i64_le(m.last_send_index);
            buf.put_i64_le(m.start_time);
        }

        Message::Heartbeat(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_i64_le(m.commit_index);
            buf.put_u64_le(m.private_term);
            buf.put_i64_le(m.min_match_index);
        }

        Message::HeartbeatReply(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_u64_le(m.private_term);
            buf.put_i64_le(m.start_time);
        }

        Message::PreSnapshot(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
        }

        Message::PreSnapshotReply(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_i64_le(m.snap_start);
        }

        Message::SnapshotSend(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_i64_le(m.begin_index);
            buf.put_i64_le(m.last_index);
            buf.put_u64_le(m.last_term);
            buf.put_i64_le(m.last_config_index);
            put_membership(buf, &m.last_config)?;
            buf.put_i64_le(m.start_time);
            buf.put_i32_le(m.seq);
            put_data(buf, &m.data)?;
        }

        Message::SnapshotRsp(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            buf.put_i64_le(m.last_index);
            buf.put_u64_le(m.last_term);
            buf.put_i64_le(m.start_time);
            buf.put_i32_le(m.ack);
            buf.put_i32_le(m.code);
            buf.put_i64_le(m.snap_begin_index);
        }

        Message::LeaderTransfer(m) => {
            put_id(buf, &m.src);
            put_id(buf, &m.dest);
            buf.put_u64_le(m.term);
            put_id(buf, &m.new_leader);
        }

        Message::Timeout(_) | Message::LocalCmd(_) => {
            return Err(Error::InvalidInput(format!("can't encode local message {message:?}")))
        }
    }
    Ok(())
}

fn decode_message(r: &mut Reader, msg_type: MsgType) -> Result<Message> {
    Ok(match msg_type {
        MsgType::Ping => Message::Ping(Ping { src: r.id()?, dest: r.id()?, data: r.data()? }),
        MsgType::PingReply => {
            Message::PingReply(Ping { src: r.id()?, dest: r.id()?, data: r.data()? })
        }

        MsgType::ClientRequest => Message::ClientRequest(ClientRequest {
            original_type: r.u32()?,
            seq_num: r.u64()?,
            is_weak: r.bool()?,
            data: r.data()?,
        }),

        MsgType::ClientRequestBatch => {
            let count = r.u32()? as usize;
            let body_len = r.u32()? as usize;
            r.check_items(count, 9)?;
            let mut metas = Vec::with_capacity(count);
            for _ in 0..count {
                metas.push((r.u64()?, r.bool()?));
            }
            let mut body = Reader::new(r.slice(body_len)?);
            let mut requests = Vec::with_capacity(count);
            for (seq_num, is_weak) in metas {
                let original_type = body.u32()?;
                let data = body.data()?;
                requests.push(ClientRequest { original_type, seq_num, is_weak, data });
            }
            body.finish()?;
            Message::ClientRequestBatch(ClientRequestBatch { requests })
        }

        MsgType::ClientRequestReply => Message::ClientRequestReply(ClientRequestReply {
            seq_num: r.u64()?,
            err_code: r.i32()?,
            leader_hint: r.optional_id()?,
            data: r.data()?,
        }),

        MsgType::RequestVote => Message::RequestVote(RequestVote {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            last_log_index: r.i64()?,
            last_log_term: r.u64()?,
        }),

        MsgType::RequestVoteReply => Message::RequestVoteReply(RequestVoteReply {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            vote_granted: r.bool()?,
        }),

        MsgType::AppendEntries => Message::AppendEntries(AppendEntries {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            prev_log_index: r.i64()?,
            prev_log_term: r.u64()?,
            commit_index: r.i64()?,
            private_term: r.u64()?,
            entry: match r.bool()? {
                true => Some(r.entry()?),
                false => None,
            },
        }),

        MsgType::AppendEntriesBatch => {
            let (src, dest, term) = (r.id()?, r.id()?, r.u64()?);
            let (prev_log_index, prev_log_term) = (r.i64()?, r.u64()?);
            let (commit_index, private_term) = (r.i64()?, r.u64()?);
            let count = r.u32()? as usize;
            let body_len = r.u32()? as usize;
            r.check_items(count, 8)?;
            let mut descriptors = Vec::with_capacity(count);
            for _ in 0..count {
                descriptors.push((r.u32()? as usize, r.u32()? as usize));
            }
            let body = r.slice(body_len)?;
            let mut entries = Vec::with_capacity(count);
            for (offset, len) in descriptors {
                let end = offset
                    .checked_add(len)
                    .filter(|end| *end <= body.len())
                    .ok_or_else(|| Error::Decode(format!("entry {offset}+{len} out of bounds")))?;
                let mut entry = Reader::new(&body[offset..end]);
                entries.push(entry.entry()?);
                entry.finish()?;
            }
            Message::AppendEntriesBatch(AppendEntriesBatch {
                src,
                dest,
                term,
                prev_log_index,
                prev_log_term,
                commit_index,
                private_term,
                entries,
            })
        }

        MsgType::AppendEntriesReply => Message::AppendEntriesReply(AppendEntriesReply {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            private_term: r.u64()?,
            success: r.bool()?,
            match_index: r.i64()?,
            last_send_index: r.i64()?,
            start_time: r.i64()?,
        }),

        MsgType::Heartbeat => Message::Heartbeat(Heartbeat {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            commit_index: r.i64()?,
            private_term: r.u64()?,
            min_match_index: r.i64()?,
        }),

        MsgType::HeartbeatReply => Message::HeartbeatReply(HeartbeatReply {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            private_term: r.u64()?,
            start_time: r.i64()?,
        }),

        MsgType::PreSnapshot => {
            Message::PreSnapshot(PreSnapshot { src: r.id()?, dest: r.id()?, term: r.u64()? })
        }

        MsgType::PreSnapshotReply => Message::PreSnapshotReply(PreSnapshotReply {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            snap_start: r.i64()?,
        }),

        MsgType::SnapshotSend => Message::SnapshotSend(SnapshotSend {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            begin_index: r.i64()?,
            last_index: r.i64()?,
            last_term: r.u64()?,
            last_config_index: r.i64()?,
            last_config: r.membership()?,
            start_time: r.i64()?,
            seq: r.i32()?,
            data: r.data()?,
        }),

        MsgType::SnapshotRsp => Message::SnapshotRsp(SnapshotRsp {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            last_index: r.i64()?,
            last_term: r.u64()?,
            start_time: r.i64()?,
            ack: r.i32()?,
            code: r.i32()?,
            snap_begin_index: r.i64()?,
        }),

        MsgType::LeaderTransfer => Message::LeaderTransfer(LeaderTransfer {
            src: r.id()?,
            dest: r.id()?,
            term: r.u64()?,
            new_leader: r.id()?,
        }),

        MsgType::Timeout | MsgType::LocalCmd => {
            return Err(Error::Decode(format!("local message type {msg_type:?} on the wire")))
        }
    })
}

/// Encodes a length as u32.
fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len =
        u32::try_from(len).map_err(|_| Error::InvalidInput(format!("length {len} too large")))?;
    buf.put_u32_le(len);
    Ok(())
}

fn put_data(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    put_len(buf, data.len())?;
    buf.put_slice(data);
    Ok(())
}

fn put_id(buf: &mut BytesMut, id: &RaftId) {
    buf.put_u64_le(id.address);
    buf.put_i32_le(id.group_id);
}

fn put_optional_id(buf: &mut BytesMut, id: &Option<RaftId>) {
    match id {
        Some(id) => {
            buf.put_u8(1);
            put_id(buf, id);
        }
        None => buf.put_u8(0),
    }
}

fn put_entry(buf: &mut BytesMut, entry: &Entry) -> Result<()> {
    buf.put_i64_le(entry.index);
    buf.put_u64_le(entry.term);
    buf.put_u32_le(entry.original_type);
    buf.put_u64_le(entry.seq_num);
    buf.put_u8(entry.is_weak as u8);
    put_data(buf, &entry.data)
}

fn put_membership(buf: &mut BytesMut, membership: &Membership) -> Result<()> {
    buf.put_i64_le(membership.last_config_index);
    put_len(buf, membership.members.len())?;
    for member in &membership.members {
        put_id(buf, member);
    }
    Ok(())
}

/// A bounds-checked decoder over a byte slice. The bytes::Buf getters panic
/// on underflow, so every read checks the remaining length first.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Decode(format!(
                "unexpected end of message: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Errors if a count-prefixed array of items can't possibly fit in the
    /// remaining buffer, before allocating for it.
    fn check_items(&self, count: usize, item_size: usize) -> Result<()> {
        match count.checked_mul(item_size) {
            Some(size) => self.need(size),
            None => Err(Error::Decode(format!("invalid item count {count}"))),
        }
    }

    /// Errors if there are unread bytes left.
    fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(Error::Decode(format!("{} trailing bytes", self.buf.remaining())));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::Decode(format!("invalid boolean {v}"))),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn data(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.slice(len)?.to_vec())
    }

    fn id(&mut self) -> Result<RaftId> {
        Ok(RaftId { address: self.u64()?, group_id: self.i32()? })
    }

    fn optional_id(&mut self) -> Result<Option<RaftId>> {
        Ok(match self.bool()? {
            true => Some(self.id()?),
            false => None,
        })
    }

    fn entry(&mut self) -> Result<Entry> {
        Ok(Entry {
            index: self.i64()?,
            term: self.u64()?,
            original_type: self.u32()?,
            seq_num: self.u64()?,
            is_weak: self.bool()?,
            data: self.data()?,
        })
    }

    fn membership(&mut self) -> Result<Membership> {
        let last_config_index = self.i64()?;
        let count = self.u32()? as usize;
        self.check_items(count, 12)?;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(self.id()?);
        }
        Ok(Membership { members, last_config_index })
    }
}
