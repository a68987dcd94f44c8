use super::client::RequestSender;
use super::{
    code, config_change_request, Client, ClientRequest, ClientRequestBatch, ClientRequestReply,
    Envelope, GroupId, LeaderTransfer, LocalCmd, Message, Node, Request, Response, Timeout,
    TimeoutKind, Transport, TICK_INTERVAL,
};
use crate::error::{Error, Result};

use ::log::{debug, error, info, warn};
use crossbeam::channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type ClientReceiver = Receiver<(Request, Sender<Result<Response>>)>;

/// A group hosted by the server.
struct Group {
    node: Node,
    node_rx: Receiver<Envelope>,
    client_rx: ClientReceiver,
    /// Keeps the request channel open when all clients are dropped.
    _request_tx: RequestSender,
    max_batch: usize,
}

/// A Raft server, hosting any number of groups on a shared transport. Each
/// group runs its own decision loop thread, which serializes all inputs to
/// the group's node: inbound messages, ticks and client requests.
pub struct Server {
    transport: Arc<dyn Transport>,
    groups: Vec<Group>,
    tick_interval: Duration,
    ping_interval: Option<Duration>,
}

impl Server {
    /// Creates a new server on the given transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, groups: Vec::new(), tick_interval: TICK_INTERVAL, ping_interval: None }
    }

    /// Sets the tick interval.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Makes every group ping its peers at the given interval.
    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = Some(ping_interval);
        self
    }

    /// Adds a group, given its node and the receiving end of the node's
    /// outbound channel. Up to max_batch queued client writes are appended
    /// as a single batch. Returns a client for the group.
    pub fn add_group(
        &mut self,
        node: Node,
        node_rx: Receiver<Envelope>,
        max_batch: usize,
    ) -> Client {
        let (request_tx, client_rx) = crossbeam::channel::unbounded();
        self.groups.push(Group {
            node,
            node_rx,
            client_rx,
            _request_tx: request_tx.clone(),
            max_batch: max_batch.max(1),
        });
        Client::new(request_tx)
    }

    /// Serves all groups. Returns once every decision loop has stopped, with
    /// the first error. Groups are independent: a failed group stops, while
    /// the others keep running.
    pub fn serve(self) -> Result<()> {
        let mut inbound_txs: HashMap<GroupId, Sender<Envelope>> = HashMap::new();
        let mut loops = Vec::new();
        for group in self.groups {
            let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded();
            if inbound_txs.insert(group.node.group_id(), inbound_tx).is_some() {
                let group_id = group.node.group_id();
                return Err(Error::InvalidInput(format!("duplicate group {group_id}")));
            }
            loops.push((group, inbound_rx));
        }
        info!("Serving {} groups", loops.len());

        let transport = self.transport;
        let (tick_interval, ping_interval) = (self.tick_interval, self.ping_interval);
        let inbound_rx = transport.receiver();
        std::thread::Builder::new()
            .name("router".into())
            .spawn(move || Self::route(inbound_rx, inbound_txs))?;

        std::thread::scope(|s| {
            let handles = loops
                .into_iter()
                .map(|(group, inbound_rx)| {
                    let transport = transport.as_ref();
                    s.spawn(move || {
                        let group_id = group.node.group_id();
                        let timers = (tick_interval, ping_interval);
                        let result = Self::eventloop(group, inbound_rx, transport, timers);
                        if let Err(err) = &result {
                            error!("Group {group_id} event loop failed: {err}");
                        }
                        result
                    })
                })
                .collect::<Vec<_>>();
            let mut result = Ok(());
            for handle in handles {
                let joined = handle.join().unwrap_or_else(|_| Err(Error::Internal("panic".into())));
                result = result.and(joined);
            }
            result
        })
    }

    /// Routes inbound messages to their group's decision loop.
    fn route(inbound_rx: Receiver<Envelope>, inbound_txs: HashMap<GroupId, Sender<Envelope>>) {
        for envelope in inbound_rx {
            match inbound_txs.get(&envelope.group_id) {
                Some(tx) => {
                    if tx.send(envelope).is_err() {
                        debug!("Dropping message for stopped group");
                    }
                }
                None => warn!("Dropping message for unknown group {}", envelope.group_id),
            }
        }
    }

    /// Runs a group's event loop.
    fn eventloop(
        group: Group,
        inbound_rx: Receiver<Envelope>,
        transport: &dyn Transport,
        (tick_interval, ping_interval): (Duration, Option<Duration>),
    ) -> Result<()> {
        let Group { mut node, node_rx, client_rx, max_batch, .. } = group;
        let ticker = crossbeam::channel::tick(tick_interval);
        let pinger = match ping_interval {
            Some(interval) => crossbeam::channel::tick(interval),
            None => crossbeam::channel::never(),
        };
        let mut requests = HashMap::<u64, Sender<Result<Response>>>::new();
        let mut next_seq: u64 = 1;

        loop {
            crossbeam::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(pinger) -> _ => node = Self::timeout(node, TimeoutKind::Ping)?,

                recv(inbound_rx) -> envelope => node = node.step(envelope?)?,

                recv(node_rx) -> envelope => {
                    let envelope = envelope?;
                    match (envelope.message.dest(), envelope.message) {
                        (Some(dest), message) => {
                            let envelope = Envelope { group_id: envelope.group_id, message };
                            transport.send(dest.address, envelope)?
                        }
                        (None, Message::ClientRequestReply(reply)) => {
                            if let Some(response_tx) = requests.remove(&reply.seq_num) {
                                // The client may have gone away.
                                response_tx.send(Self::response(reply)).ok();
                            }
                        }
                        (None, message) => {
                            return Err(Error::Internal(format!("Unexpected message {message:?}")))
                        }
                    }
                }

                recv(client_rx) -> call => {
                    // Batch any queued requests.
                    let mut calls = vec![call?];
                    calls.extend(client_rx.try_iter().take(max_batch - 1));
                    node = Self::submit(node, calls, &mut requests, &mut next_seq)?;
                }
            }
        }
    }

    /// Submits client requests to the node. Writes are tagged with a sequence
    /// number and stepped as a batch, other requests are processed in order.
    fn submit(
        mut node: Node,
        calls: Vec<(Request, Sender<Result<Response>>)>,
        requests: &mut HashMap<u64, Sender<Result<Response>>>,
        next_seq: &mut u64,
    ) -> Result<Node> {
        let mut batch = Vec::new();
        for (request, response_tx) in calls {
            let seq_num = *next_seq;
            let write = match request {
                Request::Write { original_type, data, is_weak } => {
                    Ok(ClientRequest { original_type, seq_num, is_weak, data })
                }
                Request::ChangeConfig(members) => config_change_request(seq_num, &members),
                request => {
                    // Flush pending writes first, to preserve order.
                    node = Self::step_batch(node, std::mem::take(&mut batch))?;
                    let (next, response) = Self::execute(node, request)?;
                    node = next;
                    response_tx.send(Ok(response)).ok();
                    continue;
                }
            };
            match write {
                Ok(write) => {
                    *next_seq += 1;
                    requests.insert(seq_num, response_tx);
                    batch.push(write);
                }
                Err(err) => {
                    response_tx.send(Err(err)).ok();
                }
            }
        }
        Self::step_batch(node, batch)
    }

    /// Executes a local command or status request.
    fn execute(node: Node, request: Request) -> Result<(Node, Response)> {
        let message = match request {
            Request::StepDown(new_term) => Message::LocalCmd(LocalCmd::StepDown { new_term }),
            Request::ForceCommit(commit_index) => {
                Message::LocalCmd(LocalCmd::FollowerCommit { commit_index })
            }
            Request::TransferLeader(new_leader) => {
                let (id, term) = (node.id(), node.term());
                Message::LeaderTransfer(LeaderTransfer { src: id, dest: id, term, new_leader })
            }
            Request::Campaign => {
                return Ok((Self::timeout(node, TimeoutKind::Election)?, Response::Done));
            }
            Request::Status => {
                let status = node.status();
                return Ok((node, Response::Status(status)));
            }
            Request::Write { .. } | Request::ChangeConfig(_) => {
                return Err(Error::Internal("writes must be batched".into()))
            }
        };
        let envelope = Self::local(&node, message);
        Ok((node.step(envelope)?, Response::Done))
    }

    /// Fires a local timer on the node, armed at the node's current clock.
    fn timeout(node: Node, kind: TimeoutKind) -> Result<Node> {
        let status = node.status();
        let logic_clock = match kind {
            TimeoutKind::Election => status.election_clock,
            TimeoutKind::Heartbeat => status.heartbeat_clock,
            TimeoutKind::Ping => 0,
        };
        let timeout = Timeout { kind, logic_clock, timer_ms: 0 };
        let envelope = Self::local(&node, Message::Timeout(timeout));
        node.step(envelope)
    }

    /// Steps a batch of client writes.
    fn step_batch(node: Node, mut batch: Vec<ClientRequest>) -> Result<Node> {
        let message = match batch.len() {
            0 => return Ok(node),
            1 => Message::ClientRequest(batch.remove(0)),
            _ => Message::ClientRequestBatch(ClientRequestBatch { requests: batch }),
        };
        let envelope = Self::local(&node, message);
        node.step(envelope)
    }

    /// Wraps a local message for the node's group.
    fn local(node: &Node, message: Message) -> Envelope {
        Envelope { group_id: node.group_id(), message }
    }

    /// Converts a client reply into a response.
    fn response(reply: ClientRequestReply) -> Result<Response> {
        match reply.err_code {
            code::OK => Ok(Response::Write(reply.data)),
            code::NOT_LEADER => Err(Error::NotLeader(reply.leader_hint)),
            code::ABORTED => Err(Error::Abort),
            code::APPLY_FAILED => Err(Error::Internal(String::from_utf8_lossy(&reply.data).into())),
            code::INVALID_REQUEST => Err(Error::InvalidInput("invalid request".into())),
            code => Err(Error::Internal(format!("unexpected reply code {code}"))),
        }
    }
}
