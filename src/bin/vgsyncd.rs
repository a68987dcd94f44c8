//! The vgsync server. Takes configuration from a config file (default
//! /etc/vgsync.yaml) or corresponding VGSYNC_ environment variables. Hosts a
//! Raft node for each configured storage group, all sharing one TCP
//! transport. Every node of the cluster hosts every group.
//!
//! The log, term, vote and membership of each group are stored durably under
//! the data directory. The state machine is an in-memory stand-in for the
//! storage engine.

#![warn(clippy::all)]

use vgsync::error::{Error, Result};
use vgsync::raft::{self, GroupId, Log, Node, RaftId, Server, TcpTransport};
use vgsync::storage::{FileConfigStore, FileLog, FileTermStore, MemoryState};

use clap::Parser as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}")
    }
}

/// The vgsync server configuration.
#[derive(Debug, Deserialize)]
struct Config {
    /// The node address, unique across the cluster.
    id: u64,
    listen: String,
    log_level: String,
    data_dir: String,
    /// Peer node addresses and their host:port.
    #[serde(default)]
    peers: HashMap<String, String>,
    groups: Vec<GroupId>,
    heartbeat_interval: raft::Ticks,
    election_timeout_min: raft::Ticks,
    election_timeout_max: raft::Ticks,
    snapshot_chunk_size: usize,
    snapshot_timeout: raft::Ticks,
    #[serde(default)]
    log_retention: Option<u64>,
    max_batch: usize,
    /// Ticks between liveness pings to peers, or 0 to disable pings.
    #[serde(default)]
    ping_interval: raft::Ticks,
    #[serde(default)]
    trace_messages: bool,
}

impl Config {
    /// Loads the configuration from the given file.
    fn load(file: &str) -> Result<Self> {
        let election = raft::ELECTION_TIMEOUT_RANGE;
        Ok(config::Config::builder()
            .set_default("id", 1i64)?
            .set_default("listen", "0.0.0.0:9705")?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .set_default("groups", vec![0i64])?
            .set_default("heartbeat_interval", raft::HEARTBEAT_INTERVAL as i64)?
            .set_default("election_timeout_min", election.start as i64)?
            .set_default("election_timeout_max", election.end as i64)?
            .set_default("snapshot_chunk_size", raft::SNAPSHOT_CHUNK_SIZE as i64)?
            .set_default("snapshot_timeout", raft::SNAPSHOT_TIMEOUT as i64)?
            .set_default("max_batch", raft::MAX_BATCH as i64)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("VGSYNC"))
            .build()?
            .try_deserialize()?)
    }

    /// Parses the peer addresses.
    fn peers(&self) -> Result<HashMap<u64, String>> {
        let mut peers = HashMap::new();
        for (address, host) in &self.peers {
            let address: u64 = address.parse()?;
            if address == self.id {
                return Err(Error::InvalidInput(format!("node {address} can't be its own peer")));
            }
            peers.insert(address, host.clone());
        }
        Ok(peers)
    }

    /// Returns the Raft node options.
    fn options(&self) -> Result<raft::Options> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(Error::InvalidInput("election timeout range is empty".into()));
        }
        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(Error::InvalidInput("election timeout must exceed heartbeats".into()));
        }
        Ok(raft::Options {
            heartbeat_interval: self.heartbeat_interval,
            election_timeout_range: self.election_timeout_min..self.election_timeout_max,
            snapshot_chunk_size: self.snapshot_chunk_size,
            snapshot_timeout: self.snapshot_timeout,
            log_retention: self.log_retention,
            trace_messages: self.trace_messages,
            ..raft::Options::default()
        })
    }
}

/// The vgsync server command.
#[derive(clap::Parser)]
#[command(about = "Starts a vgsync server.", version, propagate_version = true)]
struct Command {
    /// The configuration file path.
    #[arg(short = 'c', long, default_value = "/etc/vgsync.yaml")]
    config: String,
}

impl Command {
    /// Runs the server.
    fn run(self) -> Result<()> {
        let cfg = Config::load(&self.config)?;

        // Initialize logging.
        let loglevel = cfg.log_level.parse()?;
        let mut logconfig = simplelog::ConfigBuilder::new();
        if loglevel != simplelog::LevelFilter::Debug {
            logconfig.add_filter_allow_str("vgsync");
        }
        simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

        let peers = cfg.peers()?;
        let opts = cfg.options()?;
        let mut addresses: Vec<u64> = peers.keys().copied().collect();
        addresses.push(cfg.id);

        // Start the transport, and a node for each group.
        let listener = std::net::TcpListener::bind(&cfg.listen)?;
        log::info!("Listening on {} as node {}", listener.local_addr()?, cfg.id);
        let transport = Arc::new(TcpTransport::new(listener, peers)?);
        let mut server = Server::new(transport);
        if cfg.ping_interval > 0 {
            server = server.with_ping_interval(raft::TICK_INTERVAL * cfg.ping_interval as u32);
        }
        for group_id in &cfg.groups {
            let id = RaftId::new(cfg.id, *group_id);
            let dir = Path::new(&cfg.data_dir).join(format!("group-{group_id}"));
            let members = addresses.iter().map(|address| RaftId::new(*address, *group_id));
            let (node_tx, node_rx) = crossbeam::channel::unbounded();
            let node = Node::new(
                id,
                Log::new(Box::new(FileLog::open(dir.join("log"))?))?,
                Box::new(FileTermStore::open(dir.join("term"))?),
                Box::new(FileConfigStore::open(dir.join("config"), members)?),
                Box::new(MemoryState::new()),
                node_tx,
                opts.clone(),
            )?;
            server.add_group(node, node_rx, cfg.max_batch);
        }
        server.serve()
    }
}
