//! Runs in-process clusters over the channel transport, with a decision loop
//! thread per node, and checks that they elect leaders, replicate writes,
//! recover from partitions and bring new members up to date.

use vgsync::raft::{
    ChannelNetwork, Client, GroupId, Index, Log, Node, NodeRole, Options, RaftId, Server, Status,
};
use vgsync::storage::{MemoryConfigStore, MemoryLog, MemoryState, MemoryTermStore};
use vgsync::{Error, Result};

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GROUP: GroupId = 3;

/// The tick interval. Election timeouts are 10-20 ticks.
const TICK: Duration = Duration::from_millis(10);

/// How long to wait for the cluster to converge.
const TIMEOUT: Duration = Duration::from_secs(10);

/// A cluster of nodes hosting a single group, each on its own server.
struct TestCluster {
    network: ChannelNetwork,
    clients: BTreeMap<u64, Client>,
    opts: Options,
}

impl TestCluster {
    /// Starts a cluster with the given node addresses as members.
    fn run(members: &[u64], opts: Options) -> Result<Self> {
        let mut cluster = Self { network: ChannelNetwork::new(), clients: BTreeMap::new(), opts };
        for address in members {
            cluster.start(*address, members)?;
        }
        Ok(cluster)
    }

    /// Starts a node with the given initial members.
    fn start(&mut self, address: u64, members: &[u64]) -> Result<()> {
        let transport = Arc::new(self.network.connect(address)?);
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(
            RaftId::new(address, GROUP),
            Log::new(Box::new(MemoryLog::new()))?,
            Box::new(MemoryTermStore::new()),
            Box::new(MemoryConfigStore::new(members.iter().map(|a| RaftId::new(*a, GROUP)))),
            Box::new(MemoryState::new()),
            node_tx,
            self.opts.clone(),
        )?;
        let mut server = Server::new(transport).with_tick_interval(TICK);
        self.clients.insert(address, server.add_group(node, node_rx, 16));
        std::thread::spawn(move || server.serve());
        Ok(())
    }

    fn status(&self, address: u64) -> Result<Status> {
        self.clients[&address].status()
    }

    /// Waits until the node's status satisfies the predicate.
    fn wait_for(&self, address: u64, predicate: impl Fn(&Status) -> bool) -> Result<Status> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let status = self.status(address)?;
            if predicate(&status) {
                return Ok(status);
            }
            if Instant::now() > deadline {
                let message = format!("timed out waiting for node {address}: {status:?}");
                return Err(Error::Internal(message));
            }
            std::thread::sleep(TICK);
        }
    }

    /// Waits for a leader among the given nodes, returning its address. If
    /// several nodes believe they're leader, the one with the highest term
    /// is the real one.
    fn leader(&self, among: &[u64]) -> Result<u64> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let statuses = among.iter().map(|a| self.status(*a)).collect::<Result<Vec<_>>>()?;
            let max_term = statuses.iter().map(|s| s.term).max().unwrap_or(0);
            let leader = statuses.iter().find(|s| s.role == NodeRole::Leader && s.term == max_term);
            if let Some(leader) = leader {
                return Ok(leader.id.address);
            }
            if Instant::now() > deadline {
                return Err(Error::Internal(format!("no leader among {among:?}")));
            }
            std::thread::sleep(TICK);
        }
    }

    /// Writes via the leader among the given nodes, retrying on leader
    /// changes. Returns the write's log index.
    fn write(&self, among: &[u64], data: &[u8]) -> Result<Index> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let leader = self.leader(among)?;
            match self.clients[&leader].write(1, data.to_vec(), false) {
                Ok(result) => {
                    let bytes = result.try_into().map_err(|_| Error::InvalidData("result".into()))?;
                    return Ok(Index::from_be_bytes(bytes));
                }
                Err(Error::NotLeader(_) | Error::Abort) if Instant::now() < deadline => {
                    std::thread::sleep(TICK)
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Waits until all given nodes have applied the given index.
    fn wait_applied(&self, among: &[u64], index: Index) -> Result<()> {
        for address in among {
            self.wait_for(*address, |s| s.applied_index >= index)?;
        }
        Ok(())
    }
}

#[test]
// A leader is elected, and writes are replicated to all nodes. Followers
// redirect writes to the leader.
fn election_and_replication() -> Result<()> {
    let nodes = [1, 2, 3];
    let cluster = TestCluster::run(&nodes, Options::default())?;
    let leader = cluster.leader(&nodes)?;

    let mut last = 0;
    for i in 0..5u8 {
        let index = cluster.write(&nodes, &[i])?;
        assert!(index > last, "write indexes must increase");
        last = index;
    }
    cluster.wait_applied(&nodes, last)?;

    let term = cluster.status(leader)?.term;
    for address in nodes {
        let status = cluster.status(address)?;
        assert_eq!(status.term, term);
        assert_eq!(status.members, nodes.map(|a| RaftId::new(a, GROUP)).to_vec());
    }

    let follower = nodes.into_iter().find(|a| *a != leader).unwrap();
    cluster.wait_for(follower, |s| s.leader == Some(RaftId::new(leader, GROUP)))?;
    assert_eq!(
        cluster.clients[&follower].write(1, b"x".to_vec(), false),
        Err(Error::NotLeader(Some(RaftId::new(leader, GROUP))))
    );
    Ok(())
}

#[test]
// A partitioned leader is replaced by a new leader in a later term. When the
// partition heals, the old leader steps down and catches up.
fn partition_leader_change() -> Result<()> {
    let nodes = [1, 2, 3];
    let cluster = TestCluster::run(&nodes, Options::default())?;
    let old_leader = cluster.leader(&nodes)?;
    let index = cluster.write(&nodes, b"a")?;
    cluster.wait_applied(&nodes, index)?;
    let old_term = cluster.status(old_leader)?.term;

    cluster.network.partition(old_leader)?;
    let majority = nodes.into_iter().filter(|a| *a != old_leader).collect::<Vec<_>>();
    let new_leader = cluster.leader(&majority)?;
    assert_ne!(new_leader, old_leader);
    assert!(cluster.status(new_leader)?.term > old_term);

    let index = cluster.write(&majority, b"b")?;
    cluster.wait_applied(&majority, index)?;

    cluster.network.heal(old_leader)?;
    cluster.wait_applied(&[old_leader], index)?;
    let status = cluster.wait_for(old_leader, |s| s.role == NodeRole::Follower)?;
    assert!(status.term > old_term);
    Ok(())
}

#[test]
// A new member is added to a group whose log has been compacted, and is
// brought up to date with a chunked snapshot transfer.
fn snapshot_new_member() -> Result<()> {
    let opts = Options { log_retention: Some(2), snapshot_chunk_size: 8, ..Options::default() };
    let nodes = [1, 2];
    let mut cluster = TestCluster::run(&nodes, opts)?;

    let mut last = 0;
    for i in 0..10u8 {
        last = cluster.write(&nodes, &[i])?;
    }
    cluster.wait_applied(&nodes, last)?;
    let leader = cluster.leader(&nodes)?;
    assert!(cluster.status(leader)?.begin_index > 0, "leader log not compacted");

    // The new node doesn't know about the group yet, and waits to be
    // contacted by the leader.
    cluster.start(3, &[])?;
    let all = [1, 2, 3];
    let members = all.map(|a| RaftId::new(a, GROUP)).to_vec();
    cluster.clients[&leader].change_config(members.clone())?;

    let status = cluster.wait_for(3, |s| s.members == members)?;
    assert!(status.begin_index > 0, "expected snapshot install");
    let index = cluster.write(&all, b"after")?;
    cluster.wait_applied(&all, index)?;

    let leader = cluster.leader(&all)?;
    cluster.wait_for(leader, |s| s.match_index.get(&RaftId::new(3, GROUP)) == Some(&index))?;
    Ok(())
}

#[test]
// Across repeated leader partitions and re-elections, no two nodes are ever
// seen leading, or being followed as leader, in the same term.
fn election_safety() -> Result<()> {
    let nodes = [1, 2, 3, 4, 5];
    let cluster = TestCluster::run(&nodes, Options::default())?;
    let mut leaders: BTreeMap<u64, std::collections::BTreeSet<RaftId>> = BTreeMap::new();
    let mut sample = |cluster: &TestCluster| -> Result<()> {
        for address in nodes {
            let status = cluster.status(address)?;
            if status.role == NodeRole::Leader {
                leaders.entry(status.term).or_default().insert(status.id);
            }
            if let Some(leader) = status.leader {
                leaders.entry(status.term).or_default().insert(leader);
            }
        }
        Ok(())
    };

    let mut connected = nodes.to_vec();
    for round in 0..3u8 {
        let leader = cluster.leader(&connected)?;
        let index = cluster.write(&connected, &[round])?;
        cluster.wait_applied(&connected, index)?;
        sample(&cluster)?;

        let term = cluster.status(leader)?.term;
        cluster.network.partition(leader)?;
        connected.retain(|a| *a != leader);
        let deadline = Instant::now() + TIMEOUT;
        loop {
            sample(&cluster)?;
            let status = cluster.status(connected[0])?;
            if status.term > term && status.leader.is_some() {
                break;
            }
            if Instant::now() > deadline {
                return Err(Error::Internal(format!("no new leader after term {term}")));
            }
            std::thread::sleep(TICK);
        }
        for _ in 0..20 {
            sample(&cluster)?;
            std::thread::sleep(TICK);
        }

        cluster.network.heal(leader)?;
        connected.push(leader);
        for _ in 0..20 {
            sample(&cluster)?;
            std::thread::sleep(TICK);
        }
    }

    assert!(leaders.len() >= 4, "expected several elected terms, got {leaders:?}");
    for (term, ids) in &leaders {
        assert_eq!(ids.len(), 1, "multiple leaders in term {term}: {ids:?}");
    }
    Ok(())
}

#[test]
// A new member partitioned away partway through a snapshot transfer gets a
// restarted transfer once it reconnects, and converges with the group.
fn snapshot_interrupted() -> Result<()> {
    let opts = Options {
        log_retention: Some(2),
        snapshot_chunk_size: 1,
        snapshot_timeout: 5,
        ..Options::default()
    };
    let nodes = [1, 2];
    let mut cluster = TestCluster::run(&nodes, opts)?;
    let mut last = 0;
    for i in 0..20u8 {
        last = cluster.write(&nodes, &[i; 64])?;
    }
    cluster.wait_applied(&nodes, last)?;
    let leader = cluster.leader(&nodes)?;

    cluster.start(3, &[])?;
    let all = [1, 2, 3];
    let members = all.map(|a| RaftId::new(a, GROUP)).to_vec();
    cluster.clients[&leader].change_config(members.clone())?;
    cluster.network.partition(3)?;

    // The rest of the group keeps going while the transfer is cut off.
    let index = cluster.write(&nodes, b"during")?;
    cluster.wait_applied(&nodes, index)?;
    std::thread::sleep(TICK * 10);
    assert!(cluster.status(3)?.applied_index < index, "partitioned node caught up");

    cluster.network.heal(3)?;
    let status = cluster.wait_for(3, |s| s.members == members && s.applied_index >= index)?;
    assert!(status.begin_index > 0, "expected snapshot install");

    let index = cluster.write(&all, b"after")?;
    cluster.wait_applied(&all, index)?;
    let leader = cluster.leader(&all)?;
    cluster.wait_for(leader, |s| s.match_index.get(&RaftId::new(3, GROUP)) == Some(&index))?;
    Ok(())
}
