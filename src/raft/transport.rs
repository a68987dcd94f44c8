use super::Envelope;
use crate::error::{Error, Result};

use ::log::{debug, error, warn};
use crossbeam::channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Carries messages between the nodes of a cluster. A process shares a
/// single transport across all of its groups: outbound messages are
/// addressed by node address, and inbound messages are demultiplexed by the
/// envelope's group ID.
pub trait Transport: Send + Sync {
    /// Sends a message to the node with the given address. Must not block:
    /// if the message can't be buffered it is dropped, and Raft will retry.
    fn send(&self, to: u64, envelope: Envelope) -> Result<()>;

    /// Returns a channel for receiving inbound messages.
    fn receiver(&self) -> Receiver<Envelope>;
}

/// An in-process network of channel transports, used for tests and local
/// clusters. Messages are passed through the wire codec, so they are subject
/// to the same encoding as over TCP. Nodes can be partitioned away from the
/// rest of the network and healed again.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<u64, Sender<Envelope>>,
    partitioned: HashSet<u64>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a node with the given address to the network, returning its
    /// transport. Reconnecting an address replaces the previous transport.
    pub fn connect(&self, address: u64) -> Result<ChannelTransport> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.lock()?.nodes.insert(address, tx);
        Ok(ChannelTransport { address, network: self.clone(), rx })
    }

    /// Isolates a node: all messages to or from it are dropped.
    pub fn partition(&self, address: u64) -> Result<()> {
        debug!("Partitioning node {address}");
        self.lock()?.partitioned.insert(address);
        Ok(())
    }

    /// Reconnects a partitioned node.
    pub fn heal(&self, address: u64) -> Result<()> {
        debug!("Healing node {address}");
        self.lock()?.partitioned.remove(&address);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NetworkInner>> {
        self.inner.lock().map_err(|e| Error::Internal(e.to_string()))
    }
}

/// A node's connection to a ChannelNetwork.
pub struct ChannelTransport {
    address: u64,
    network: ChannelNetwork,
    rx: Receiver<Envelope>,
}

impl Transport for ChannelTransport {
    fn send(&self, to: u64, envelope: Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        let inner = self.network.lock()?;
        if inner.partitioned.contains(&self.address) || inner.partitioned.contains(&to) {
            return Ok(());
        }
        let Some(tx) = inner.nodes.get(&to) else {
            warn!("Dropping message for unknown node {to}");
            return Ok(());
        };
        match Envelope::decode(&frame) {
            // A disconnected node is the same as a lost message.
            Ok(envelope) => tx.send(envelope).unwrap_or_else(|_| debug!("Node {to} is gone")),
            Err(err) => warn!("Dropping undecodable message: {err}"),
        }
        Ok(())
    }

    fn receiver(&self) -> Receiver<Envelope> {
        self.rx.clone()
    }
}

/// A TCP transport. Inbound connections are accepted on the given listener,
/// and each peer has a dedicated outbound connection which is continuously
/// reconnected. Messages are framed with the wire codec.
pub struct TcpTransport {
    peers: HashMap<u64, Sender<Envelope>>,
    rx: Receiver<Envelope>,
}

impl TcpTransport {
    /// The outbound buffer size per peer, in messages.
    const SEND_BUFFER: usize = 1000;

    /// The delay between reconnection attempts.
    const RECONNECT_DELAY: Duration = Duration::from_millis(1000);

    /// Creates a TCP transport, spawning background threads for the listener
    /// and for each peer connection. Peers are given as address → host:port.
    pub fn new(listener: TcpListener, peers: HashMap<u64, String>) -> Result<Self> {
        let (in_tx, rx) = crossbeam::channel::unbounded();
        std::thread::Builder::new()
            .name("tcp-receive".into())
            .spawn(move || Self::tcp_receive(listener, in_tx))?;

        let mut peer_txs = HashMap::new();
        for (address, addr) in peers {
            let (tx, rx) = crossbeam::channel::bounded(Self::SEND_BUFFER);
            peer_txs.insert(address, tx);
            std::thread::Builder::new()
                .name(format!("tcp-send-{address}"))
                .spawn(move || Self::tcp_send_peer(addr, rx))?;
        }
        Ok(Self { peers: peer_txs, rx })
    }

    /// Receives inbound messages from peers via TCP.
    fn tcp_receive(listener: TcpListener, in_tx: Sender<Envelope>) {
        std::thread::scope(|s| loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Connection failed: {err}");
                    continue;
                }
            };
            let in_tx = in_tx.clone();
            s.spawn(move || {
                debug!("Raft peer {peer} connected");
                match Self::tcp_receive_peer(socket, in_tx) {
                    Ok(()) => debug!("Raft peer {peer} disconnected"),
                    Err(err) => error!("Raft peer {peer} error: {err}"),
                }
            });
        });
    }

    /// Receives inbound messages from a peer via TCP. Undecodable messages
    /// are dropped.
    fn tcp_receive_peer(socket: TcpStream, in_tx: Sender<Envelope>) -> Result<()> {
        let mut reader = std::io::BufReader::new(socket);
        loop {
            match super::read_frame(&mut reader) {
                Ok(Some(envelope)) => in_tx.send(envelope)?,
                Ok(None) => return Ok(()),
                Err(Error::Decode(err)) => warn!("Dropping undecodable message: {err}"),
                Err(err) => return Err(err),
            }
        }
    }

    /// Sends outbound messages to a peer, continuously reconnecting.
    fn tcp_send_peer(addr: String, out_rx: Receiver<Envelope>) {
        loop {
            match TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to Raft peer {addr}");
                    match Self::tcp_send_peer_session(socket, &out_rx) {
                        Ok(()) => break,
                        Err(err) => error!("Failed sending to Raft peer {addr}: {err}"),
                    }
                }
                Err(err) => error!("Failed connecting to Raft peer {addr}: {err}"),
            }
            std::thread::sleep(Self::RECONNECT_DELAY);
        }
        debug!("Disconnected from Raft peer {addr}");
    }

    /// Sends outbound messages to a peer via a TCP session. Returns when the
    /// transport is dropped.
    fn tcp_send_peer_session(socket: TcpStream, out_rx: &Receiver<Envelope>) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut writer = std::io::BufWriter::new(socket);
        while let Ok(envelope) = out_rx.recv() {
            super::write_frame(&mut writer, &envelope)?;
            // Coalesce queued messages into a single write.
            for envelope in out_rx.try_iter() {
                super::write_frame(&mut writer, &envelope)?;
            }
            std::io::Write::flush(&mut writer)?;
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: u64, envelope: Envelope) -> Result<()> {
        let Some(tx) = self.peers.get(&to) else {
            error!("Received outbound message for unknown peer {to}");
            return Ok(());
        };
        if tx.try_send(envelope).is_err() {
            error!("Full send buffer for peer {to}, discarding message");
        }
        Ok(())
    }

    fn receiver(&self) -> Receiver<Envelope> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Message, Ping, RaftId, Timeout, TimeoutKind};
    use super::*;
    use pretty_assertions::assert_eq;

    fn ping(from: u64, to: u64, data: &[u8]) -> Envelope {
        Envelope {
            group_id: 1,
            message: Message::Ping(Ping {
                src: RaftId::new(from, 1),
                dest: RaftId::new(to, 1),
                data: data.to_vec(),
            }),
        }
    }

    #[test]
    // Messages are delivered through the codec, and partitions drop them in
    // both directions until healed.
    fn channel_network() -> Result<()> {
        let network = ChannelNetwork::new();
        let a = network.connect(1)?;
        let b = network.connect(2)?;

        a.send(2, ping(1, 2, b"x"))?;
        assert_eq!(b.receiver().try_recv().ok(), Some(ping(1, 2, b"x")));

        network.partition(2)?;
        a.send(2, ping(1, 2, b"y"))?;
        b.send(1, ping(2, 1, b"z"))?;
        assert!(b.receiver().try_recv().is_err());
        assert!(a.receiver().try_recv().is_err());

        network.heal(2)?;
        b.send(1, ping(2, 1, b"z"))?;
        assert_eq!(a.receiver().try_recv().ok(), Some(ping(2, 1, b"z")));

        // Unknown nodes are ignored.
        a.send(7, ping(1, 7, b""))?;
        Ok(())
    }

    #[test]
    // Local messages can't be sent over the network.
    fn channel_network_local_message() -> Result<()> {
        let network = ChannelNetwork::new();
        let a = network.connect(1)?;
        let timeout = Timeout { kind: TimeoutKind::Election, logic_clock: 1, timer_ms: 1 };
        let envelope = Envelope { group_id: 1, message: Message::Timeout(timeout) };
        assert!(matches!(a.send(1, envelope), Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    // Messages are framed over TCP, and the sender reconnects until the
    // receiver is listening.
    fn tcp() -> Result<()> {
        let listener_a = TcpListener::bind("127.0.0.1:0")?;
        let listener_b = TcpListener::bind("127.0.0.1:0")?;
        let addr_a = listener_a.local_addr()?.to_string();
        let addr_b = listener_b.local_addr()?.to_string();

        let a = TcpTransport::new(listener_a, HashMap::from([(2, addr_b)]))?;
        let b = TcpTransport::new(listener_b, HashMap::from([(1, addr_a)]))?;

        a.send(2, ping(1, 2, b"hello"))?;
        a.send(2, ping(1, 2, &[7; 100_000]))?;
        let rx = b.receiver();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).ok(), Some(ping(1, 2, b"hello")));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).ok(), Some(ping(1, 2, &[7; 100_000])));

        b.send(1, ping(2, 1, b""))?;
        assert_eq!(a.receiver().recv_timeout(Duration::from_secs(5)).ok(), Some(ping(2, 1, b"")));
        Ok(())
    }
}
