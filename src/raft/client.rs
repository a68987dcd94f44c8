use super::{Index, RaftId, Status, Term};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;

/// A request to a group's decision loop, submitted via a Client.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Writes an opaque storage engine request through the replicated log.
    Write { original_type: u32, data: Vec<u8>, is_weak: bool },
    /// Replaces the group membership with the given members.
    ChangeConfig(Vec<RaftId>),
    /// Steps down to follower, adopting the given term if it is newer.
    StepDown(Term),
    /// Commits entries a follower already holds, up to the given index.
    ForceCommit(Index),
    /// Transfers leadership to the given member.
    TransferLeader(RaftId),
    /// Fires the election timer, making a follower campaign right away.
    Campaign,
    /// Fetches the node status.
    Status,
}

/// A response to a Request.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The state machine result of a write or config change.
    Write(Vec<u8>),
    /// A local command was processed.
    Done,
    Status(Status),
}

/// The request channel of a group's decision loop, carrying a response
/// channel with each request.
pub type RequestSender = Sender<(Request, Sender<Result<Response>>)>;

/// A client for a local Raft group, served by a Server. Requests block until
/// a response is received.
#[derive(Clone)]
pub struct Client {
    request_tx: RequestSender,
}

impl Client {
    /// Creates a new Raft client.
    pub fn new(request_tx: RequestSender) -> Self {
        Self { request_tx }
    }

    /// Executes a request against the Raft group.
    fn request(&self, request: Request) -> Result<Response> {
        let (response_tx, response_rx) = crossbeam::channel::bounded(1);
        self.request_tx.send((request, response_tx))?;
        response_rx.recv()?
    }

    /// Writes a request through the replicated log, returning the state
    /// machine result. Weak writes return once appended to the leader's log,
    /// with an empty result. Fails with Error::NotLeader if the local node
    /// isn't the leader.
    pub fn write(&self, original_type: u32, data: Vec<u8>, is_weak: bool) -> Result<Vec<u8>> {
        match self.request(Request::Write { original_type, data, is_weak })? {
            Response::Write(result) => Ok(result),
            resp => Err(Error::Internal(format!("Unexpected Raft write response {resp:?}"))),
        }
    }

    /// Replaces the group membership, once the change is committed.
    pub fn change_config(&self, members: Vec<RaftId>) -> Result<()> {
        match self.request(Request::ChangeConfig(members))? {
            Response::Write(_) => Ok(()),
            resp => Err(Error::Internal(format!("Unexpected Raft config response {resp:?}"))),
        }
    }

    /// Makes the local node step down to follower.
    pub fn step_down(&self, new_term: Term) -> Result<()> {
        self.command(Request::StepDown(new_term))
    }

    /// Makes a follower commit entries it already holds.
    pub fn force_commit(&self, commit_index: Index) -> Result<()> {
        self.command(Request::ForceCommit(commit_index))
    }

    /// Asks the local leader to hand leadership over to the given member.
    pub fn transfer_leader(&self, target: RaftId) -> Result<()> {
        self.command(Request::TransferLeader(target))
    }

    /// Makes a local follower or candidate start an election now.
    pub fn campaign(&self) -> Result<()> {
        self.command(Request::Campaign)
    }

    /// Fetches the local node's status.
    pub fn status(&self) -> Result<Status> {
        match self.request(Request::Status)? {
            Response::Status(status) => Ok(status),
            resp => Err(Error::Internal(format!("Unexpected Raft status response {resp:?}"))),
        }
    }

    fn command(&self, request: Request) -> Result<()> {
        match self.request(request)? {
            Response::Done => Ok(()),
            resp => Err(Error::Internal(format!("Unexpected Raft command response {resp:?}"))),
        }
    }
}
