//! The tend cycle
//!
//! One cycle releases what the previous cycle retired, seeds an empty
//! cluster, refreshes every active node, follows the peers they gossip and
//! finally publishes at most one removal and one addition. All mutation of
//! the published node set and partition tables happens here, while the
//! caller holds the [`TendState`] lock.

use crate::config::{ClusterConfig, Host};
use crate::error::{ClusterError, ErrorCategory, Result};
use crate::info::request_host;
use crate::node::{Node, NodeContext};
use crate::node_set::NodeSet;
use crate::partition::{PartitionTables, Replica};
use crate::peers::{Peer, PeerList};
use crate::policy::{self, NodeHealth, Verdict};
use crate::reclaim::{ReclaimStats, Reclaimer, Retired};
use crate::snapshot::{self, SnapshotPublisher, SnapshotReader};
use crate::transport::Transport;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of one tend cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct TendReport {
    /// Nodes published at the end of the cycle
    pub node_count: usize,
    /// Nodes refreshed successfully
    pub refresh_count: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    #[serde(skip)]
    pub reclaimed: ReclaimStats,
}

/// State owned by whoever is tending. Holding it is the single-writer right.
#[derive(Debug)]
pub(crate) struct TendState {
    nodes: SnapshotPublisher<NodeSet>,
    partitions: SnapshotPublisher<PartitionTables>,
    seeds: Vec<Host>,
    reclaimer: Reclaimer,
}

impl TendState {
    pub(crate) fn seeds(&self) -> &[Host] {
        &self.seeds
    }
}

/// Shared core of a cluster handle
pub(crate) struct ClusterCore {
    pub(crate) config: ClusterConfig,
    pub(crate) context: Arc<NodeContext>,
    pub(crate) nodes: SnapshotReader<NodeSet>,
    pub(crate) partitions: SnapshotReader<PartitionTables>,
    pub(crate) valid: AtomicBool,
    pub(crate) state: tokio::sync::Mutex<TendState>,
}

impl ClusterCore {
    pub(crate) fn new(config: ClusterConfig, transport: Arc<dyn Transport>) -> Self {
        let context = Arc::new(NodeContext::new(transport, &config));
        let (nodes, node_publisher) = snapshot::channel(NodeSet::default());
        let (partitions, partition_publisher) = snapshot::channel(PartitionTables::default());

        let state = TendState {
            nodes: node_publisher,
            partitions: partition_publisher,
            seeds: config.hosts.clone(),
            reclaimer: Reclaimer::new(),
        };

        Self {
            config,
            context,
            nodes,
            partitions,
            valid: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(state),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Run one tend cycle
    pub(crate) async fn tend(&self, state: &mut TendState, enable_seed_warnings: bool) -> Result<TendReport> {
        let mut report = TendReport {
            reclaimed: state.reclaimer.collect(),
            ..TendReport::default()
        };

        if state.nodes.current().is_empty() {
            let seeded = self.seed_nodes(&state.seeds, enable_seed_warnings).await?;
            report.added.extend(seeded.iter().map(|n| n.name().to_string()));
            self.add_nodes(state, seeded);
        }

        if state.partitions.current().partition_count() == 0 {
            let n_partitions = self.fetch_partition_count(&state.nodes.current()).await?;
            info!("Cluster has {} partitions", n_partitions);
            let old = state.partitions.publish(PartitionTables::new(n_partitions));
            state.reclaimer.retire(Retired::Partitions(old));
        }

        let nodes = state.nodes.current();
        for node in nodes.iter() {
            node.reset_friends();
        }

        let base = state.partitions.current();
        let mut working: Option<PartitionTables> = None;
        let mut peers = PeerList::new();

        for node in nodes.iter().filter(|n| n.is_active()) {
            match self.refresh_node(node, &nodes, &base, &mut working, &mut peers).await {
                Ok(()) => {
                    node.record_success();
                    report.refresh_count += 1;
                }
                Err(e) => {
                    let failures = node.record_failure();
                    match e.category() {
                        ErrorCategory::Connection | ErrorCategory::Unreachable => {
                            debug!("Node {} refresh failed ({} in a row): {}", node, failures, e)
                        }
                        _ => info!("Node {} refresh failed ({} in a row): {}", node, failures, e),
                    }
                }
            }
        }

        if let Some(next) = working {
            let old = state.partitions.publish(next);
            state.reclaimer.retire(Retired::Partitions(old));
        }

        let mut to_add = self.find_nodes_to_add(&peers, &nodes).await;
        let tables = state.partitions.current();
        let to_remove = self
            .find_nodes_to_remove(&nodes, &tables, report.refresh_count, &state.seeds, &mut to_add)
            .await;
        drop(tables);

        if !to_remove.is_empty() {
            report.removed.extend(to_remove.iter().map(|n| n.name().to_string()));
            self.remove_nodes(state, &to_remove);
        }
        if !to_add.is_empty() {
            report.added.extend(to_add.iter().map(|n| n.name().to_string()));
            self.add_nodes(state, to_add);
        }

        report.node_count = state.nodes.current().len();
        Ok(report)
    }

    async fn refresh_node(
        &self,
        node: &Arc<Node>,
        nodes: &NodeSet,
        base: &PartitionTables,
        working: &mut Option<PartitionTables>,
        peers: &mut PeerList,
    ) -> Result<()> {
        let refresh = node.refresh().await?;

        for peer in refresh.peers {
            match nodes.find_by_address(self.peer_address(&peer)) {
                Some(friend) => friend.add_friend(),
                None => {
                    peers.insert(peer);
                }
            }
        }

        if refresh.generation_changed && base.partition_count() > 0 {
            let update = node.fetch_partitions().await?;
            let tables = working.get_or_insert_with(|| base.clone());

            if let Some(master) = &update.master {
                tables.update(node, master, Replica::Master);
            }
            if let Some(prole) = &update.prole {
                tables.update(node, prole, Replica::Prole);
            }
            if let Some(generation) = update.generation {
                debug!("Node {} partition generation {}", node, generation);
                node.set_partition_generation(generation);
            }
        }
        Ok(())
    }

    /// Address a gossiped peer is reached at once the address map is applied
    fn peer_address(&self, peer: &Peer) -> SocketAddr {
        match self.config.translate(&peer.host.name).parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, peer.addr.port()),
            Err(_) => peer.addr,
        }
    }

    /// Resolve a host, applying the address map first
    async fn lookup(&self, host: &Host) -> Result<Vec<SocketAddr>> {
        let name = self.config.translate(&host.name);
        if name != host.name {
            debug!("Translated {} to {}", host.name, name);
        }
        self.context.transport().resolve(name, host.port).await
    }

    async fn request_name(&self, addr: SocketAddr) -> Result<String> {
        let credentials = self.context.credentials();
        let name = request_host(
            self.context.transport(),
            addr,
            "node",
            credentials.as_deref(),
            self.context.conn_timeout(),
        )
        .await?;

        if name.is_empty() {
            return Err(ClusterError::protocol(format!("Server {} returned an empty name", addr)));
        }
        Ok(name)
    }

    /// Create a node for every distinct name reachable through the seeds
    async fn seed_nodes(&self, seeds: &[Host], enable_warnings: bool) -> Result<Vec<Arc<Node>>> {
        let mut found: Vec<Arc<Node>> = Vec::new();
        let mut first_error = None;

        for seed in seeds {
            let addrs = match self.lookup(seed).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    if enable_warnings {
                        warn!("Failed to lookup seed {}: {}", seed, e);
                    }
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            for addr in addrs {
                match self.request_name(addr).await {
                    Ok(name) => match found.iter().find(|n| n.name() == name) {
                        Some(node) => node.add_address(addr),
                        None => {
                            info!("Add seed node {} {}", name, addr);
                            found.push(Arc::new(Node::new(name, addr, self.context.clone())));
                        }
                    },
                    Err(e) => {
                        if enable_warnings {
                            warn!("Failed to connect to seed {} {}: {}", seed, addr, e);
                        }
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if found.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| ClusterError::unreachable("No seed hosts configured")));
        }
        Ok(found)
    }

    async fn fetch_partition_count(&self, nodes: &NodeSet) -> Result<usize> {
        let credentials = self.context.credentials();
        let mut first_error = None;

        for node in nodes.iter().filter(|n| n.is_active()) {
            let result = request_host(
                self.context.transport(),
                node.primary_address(),
                "partitions",
                credentials.as_deref(),
                self.context.conn_timeout(),
            )
            .await;

            let error = match result {
                Ok(value) => match value.trim().parse::<usize>() {
                    Ok(n) if n > 0 => return Ok(n),
                    _ => ClusterError::protocol(format!("Invalid partition count: {}", value)),
                },
                Err(e) => e,
            };
            warn!("Failed to get partition count from {}: {}", node, error);
            first_error.get_or_insert(error);
        }

        Err(first_error.unwrap_or_else(|| ClusterError::unreachable("No node to ask for partitions")))
    }

    /// Turn gossiped peers into new nodes, or aliases of known ones
    async fn find_nodes_to_add(&self, peers: &PeerList, nodes: &NodeSet) -> Vec<Arc<Node>> {
        let mut to_add: Vec<Arc<Node>> = Vec::new();

        for peer in peers.iter() {
            let addrs = match self.lookup(&peer.host).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!("Failed to lookup peer {}: {}", peer.host, e);
                    continue;
                }
            };

            for addr in addrs {
                let name = match self.request_name(addr).await {
                    Ok(name) => name,
                    Err(e) => {
                        warn!("Add node {} failed: {}", addr, e);
                        continue;
                    }
                };

                if let Some(existing) = nodes.find_by_name(&name) {
                    existing.add_address(addr);
                    existing.add_friend();
                } else if let Some(pending) = to_add.iter().find(|n| n.name() == name) {
                    pending.add_address(addr);
                } else {
                    to_add.push(Arc::new(Node::new(name, addr, self.context.clone())));
                }
            }
        }
        to_add
    }

    async fn find_nodes_to_remove(
        &self,
        nodes: &NodeSet,
        tables: &PartitionTables,
        refresh_count: usize,
        seeds: &[Host],
        to_add: &mut Vec<Arc<Node>>,
    ) -> Vec<Arc<Node>> {
        let mut to_remove = Vec::new();

        for node in nodes.iter() {
            let health = NodeHealth {
                active: node.is_active(),
                failures: node.failures(),
                friends: node.friends(),
                owns_partitions: tables.contains_node(node),
            };

            match policy::evaluate(nodes.len(), health, refresh_count) {
                Verdict::Keep => {}
                Verdict::Remove => to_remove.push(node.clone()),
                Verdict::RemoveIfReseeded => match self.seed_nodes(seeds, false).await {
                    Ok(seeded) => {
                        info!("Replacing unresponsive node {} through the seeds", node);
                        for candidate in seeded {
                            if !to_add.iter().any(|n| n.name() == candidate.name()) {
                                to_add.push(candidate);
                            }
                        }
                        to_remove.push(node.clone());
                    }
                    Err(e) => debug!("Reseed failed, keeping node {}: {}", node, e),
                },
            }
        }
        to_remove
    }

    fn add_nodes(&self, state: &mut TendState, to_add: Vec<Arc<Node>>) {
        for node in &to_add {
            info!("Add node {}", node);
        }
        let next = state.nodes.current().with_added(&to_add);
        let old = state.nodes.publish(next);
        state.reclaimer.retire(Retired::NodeSet(old));
    }

    fn remove_nodes(&self, state: &mut TendState, to_remove: &[Arc<Node>]) {
        for node in to_remove {
            info!("Remove node {}", node);
            node.deactivate();
        }

        let next = state.nodes.current().without(to_remove);
        let old = state.nodes.publish(next);
        state.reclaimer.retire(Retired::NodeSet(old));

        let tables = state.partitions.current();
        if to_remove.iter().any(|node| tables.contains_node(node)) {
            let mut next = PartitionTables::clone(&tables);
            drop(tables);
            next.purge(to_remove);
            let old = state.partitions.publish(next);
            state.reclaimer.retire(Retired::Partitions(old));
        }

        for node in to_remove {
            state.reclaimer.retire(Retired::Node(node.clone()));
        }
    }

    /// Add the primary address of every node to the seed list
    pub(crate) fn add_seeds(&self, state: &mut TendState) {
        let nodes = state.nodes.current();
        for node in nodes.iter() {
            let addr = node.primary_address();
            let host = Host::new(addr.ip().to_string(), addr.port());
            if !state.seeds.contains(&host) {
                debug!("Add seed {}", host);
                state.seeds.push(host);
            }
        }
    }

    /// Unpublish and release every node
    pub(crate) async fn release_all(&self) {
        let mut state = self.state.lock().await;
        let nodes = state.nodes.current();

        for node in nodes.iter() {
            node.deactivate();
        }

        let old = state.partitions.publish(PartitionTables::default());
        state.reclaimer.retire(Retired::Partitions(old));
        let old = state.nodes.publish(NodeSet::default());
        state.reclaimer.retire(Retired::NodeSet(old));
        for node in nodes.iter() {
            state.reclaimer.retire(Retired::Node(node.clone()));
        }
        drop(nodes);

        let stats = state.reclaimer.collect();
        state.seeds.clear();
        debug!(
            "Released cluster: {} nodes destroyed, {} still reserved",
            stats.destroyed, stats.deferred
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::parse_services;
    use crate::transport::MockTransport;

    fn core_with(transport: MockTransport, hosts: Vec<Host>) -> ClusterCore {
        let config = ClusterConfig {
            hosts,
            ..ClusterConfig::default()
        };
        ClusterCore::new(config, Arc::new(transport))
    }

    #[tokio::test]
    async fn test_seed_failure_returns_first_error() {
        let mut transport = MockTransport::new();
        transport
            .expect_resolve()
            .returning(|host, _| match host {
                "bad.example" => Err(ClusterError::unreachable("Invalid host bad.example")),
                _ => Ok(vec!["10.0.0.1:3000".parse().unwrap()]),
            });
        transport
            .expect_connect()
            .returning(|addr, _| Err(ClusterError::timeout(format!("Connect to {} timed out", addr))));

        let core = core_with(
            transport,
            vec![Host::new("bad.example", 3000), Host::new("10.0.0.1", 3000)],
        );
        let mut state = core.state.lock().await;
        let err = core.tend(&mut state, false).await.unwrap_err();

        assert!(matches!(err, ClusterError::Unreachable(_)));
        assert!(core.nodes.reserve().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_applies_address_map() {
        let mut transport = MockTransport::new();
        transport
            .expect_resolve()
            .withf(|host, port| host == "10.1.1.1" && *port == 3000)
            .times(1)
            .returning(|_, _| Ok(vec!["10.1.1.1:3000".parse().unwrap()]));

        let mut config = ClusterConfig::with_host("internal", 3000);
        config.ip_map.insert("internal".to_string(), "10.1.1.1".to_string());
        let core = ClusterCore::new(config, Arc::new(transport));

        let addrs = core.lookup(&Host::new("internal", 3000)).await.unwrap();
        assert_eq!(addrs, vec!["10.1.1.1:3000".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_gossiped_alias_matches_known_node() {
        let mut config = ClusterConfig::with_host("10.2.2.2", 3000);
        config.ip_map.insert("10.1.1.1".to_string(), "10.2.2.2".to_string());
        let core = ClusterCore::new(config, Arc::new(MockTransport::new()));

        let known = Arc::new(Node::new("A1", "10.2.2.2:3000".parse().unwrap(), core.context.clone()));
        let nodes = NodeSet::new(vec![known.clone()]);

        let mapped = parse_services("10.1.1.1:3000;").remove(0);
        let found = nodes.find_by_address(core.peer_address(&mapped)).unwrap();
        assert!(Arc::ptr_eq(found, &known));

        let unmapped = parse_services("10.3.3.3:3000;").remove(0);
        assert_eq!(core.peer_address(&unmapped), unmapped.addr);
        assert!(nodes.find_by_address(core.peer_address(&unmapped)).is_none());
    }

    #[tokio::test]
    async fn test_add_seeds_unions_node_addresses() {
        let core = core_with(MockTransport::new(), vec![Host::new("127.0.0.1", 3000)]);
        let mut state = core.state.lock().await;

        let a = Arc::new(Node::new("A1", "127.0.0.1:3000".parse().unwrap(), core.context.clone()));
        let b = Arc::new(Node::new("B2", "127.0.0.2:3000".parse().unwrap(), core.context.clone()));
        core.add_nodes(&mut state, vec![a, b]);
        core.add_seeds(&mut state);

        assert_eq!(
            state.seeds(),
            &[Host::new("127.0.0.1", 3000), Host::new("127.0.0.2", 3000)]
        );
    }

    #[tokio::test]
    async fn test_removal_is_published_once_and_reclaimed_next_cycle() {
        let core = core_with(MockTransport::new(), vec![Host::new("127.0.0.1", 3000)]);
        let mut state = core.state.lock().await;

        let a = Arc::new(Node::new("A1", "127.0.0.1:3000".parse().unwrap(), core.context.clone()));
        let b = Arc::new(Node::new("B2", "127.0.0.2:3000".parse().unwrap(), core.context.clone()));
        core.add_nodes(&mut state, vec![a.clone(), b.clone()]);
        state.reclaimer.collect();

        let reserved = core.nodes.reserve();
        let weak = Arc::downgrade(&a);
        core.remove_nodes(&mut state, &[a.clone()]);
        drop(a);

        assert!(!weak.upgrade().unwrap().is_active());
        assert_eq!(core.nodes.reserve().names(), vec!["B2"]);
        assert_eq!(reserved.len(), 2);

        let stats = state.reclaimer.collect();
        assert_eq!(stats.deferred, 1);
        assert!(weak.upgrade().is_some());

        drop(reserved);
        assert!(weak.upgrade().is_none());
    }
}
