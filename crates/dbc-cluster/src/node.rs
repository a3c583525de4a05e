//! Cluster node handle
//!
//! A node is identified by the name the server reports, not by address: one
//! server may be reachable through several addresses (aliases). Nodes are
//! shared between the tender and client tasks through `Arc`, so all mutable
//! state is atomic or behind a lock.

use crate::config::{ClusterConfig, Credentials};
use crate::error::{ClusterError, Result};
use crate::info::{parse_multi_response, InfoConnection};
use crate::peers::{parse_services, Peer};
use crate::pool::SocketPool;
use crate::transport::Transport;
use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Generation value meaning "partitions never fetched"
const UNKNOWN_GENERATION: u32 = u32::MAX;

/// Settings and primitives shared by every node of one cluster
pub struct NodeContext {
    transport: Arc<dyn Transport>,
    credentials: ArcSwapOption<Credentials>,
    conn_timeout: Duration,
    pool_capacity: usize,
}

impl NodeContext {
    pub fn new(transport: Arc<dyn Transport>, config: &ClusterConfig) -> Self {
        Self {
            transport,
            credentials: ArcSwapOption::from(config.credentials().map(Arc::new)),
            conn_timeout: config.conn_timeout(),
            pool_capacity: config.max_conns_per_node,
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn credentials(&self) -> Option<Arc<Credentials>> {
        self.credentials.load_full()
    }

    pub fn conn_timeout(&self) -> Duration {
        self.conn_timeout
    }

    /// Replace the password of the configured user.
    ///
    /// Accepted when no user is set yet or when `user` matches the current
    /// one. Returns whether the credentials were replaced.
    pub fn change_password(&self, user: &str, password_hash: &str) -> bool {
        if user.is_empty() {
            return false;
        }

        if let Some(current) = self.credentials.load_full() {
            if current.user != user {
                return false;
            }
        }

        self.credentials.store(Some(Arc::new(Credentials {
            user: user.to_string(),
            password_hash: password_hash.to_string(),
        })));
        true
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("credentials", &self.credentials.load_full())
            .field("conn_timeout", &self.conn_timeout)
            .field("pool_capacity", &self.pool_capacity)
            .finish()
    }
}

/// What a successful refresh learned about the node
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub generation_changed: bool,
    pub peers: Vec<Peer>,
}

/// Partition data fetched after a generation change
#[derive(Debug, Clone, Default)]
pub struct PartitionUpdate {
    pub generation: Option<u32>,
    pub master: Option<String>,
    pub prole: Option<String>,
}

/// Point in time view of a node, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub name: String,
    pub addresses: Vec<String>,
    pub active: bool,
    pub friends: u32,
    pub failures: u32,
    pub idle_connections: usize,
    pub partition_generation: Option<u32>,
}

/// A server in the cluster
pub struct Node {
    name: String,
    addresses: ArcSwap<Vec<SocketAddr>>,
    address_index: AtomicUsize,
    pool: SocketPool,
    info: tokio::sync::Mutex<Option<InfoConnection>>,
    friends: AtomicU32,
    failures: AtomicU32,
    active: AtomicBool,
    partition_generation: AtomicU32,
    context: Arc<NodeContext>,
}

impl Node {
    pub fn new<T: Into<String>>(name: T, addr: SocketAddr, context: Arc<NodeContext>) -> Self {
        let name = name.into();
        debug!("Creating node {} at {}", name, addr);

        Self {
            name,
            addresses: ArcSwap::from_pointee(vec![addr]),
            address_index: AtomicUsize::new(0),
            pool: SocketPool::new(context.pool_capacity),
            info: tokio::sync::Mutex::new(None),
            friends: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            active: AtomicBool::new(true),
            partition_generation: AtomicU32::new(UNKNOWN_GENERATION),
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> Arc<Vec<SocketAddr>> {
        self.addresses.load_full()
    }

    /// Address new connections try first
    pub fn primary_address(&self) -> SocketAddr {
        let addresses = self.addresses.load();
        let index = self.address_index.load(Ordering::Relaxed);
        addresses.get(index).copied().unwrap_or(addresses[0])
    }

    pub fn has_address(&self, addr: SocketAddr) -> bool {
        self.addresses.load().contains(&addr)
    }

    /// Record another address of this node. Only the tender calls this.
    pub fn add_address(&self, addr: SocketAddr) {
        if self.has_address(addr) {
            return;
        }
        info!("Node {} has alias {}", self.name, addr);

        let mut next = Vec::clone(&self.addresses.load());
        next.push(addr);
        self.addresses.store(Arc::new(next));
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the node unusable. Safe to call more than once.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("Node {} deactivated", self.name);
        }
    }

    pub fn friends(&self) -> u32 {
        self.friends.load(Ordering::Relaxed)
    }

    pub fn add_friend(&self) {
        self.friends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_friends(&self) {
        self.friends.store(0, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Count a failed refresh, returning the new total
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last applied partition generation, `None` before the first fetch
    pub fn partition_generation(&self) -> Option<u32> {
        match self.partition_generation.load(Ordering::Relaxed) {
            UNKNOWN_GENERATION => None,
            generation => Some(generation),
        }
    }

    pub fn set_partition_generation(&self, generation: u32) {
        self.partition_generation.store(generation, Ordering::Relaxed);
    }

    pub fn idle_connections(&self) -> usize {
        self.pool.len()
    }

    /// Get a connection for a client request, reusing an idle one if possible
    pub async fn get_connection(&self) -> Result<TcpStream> {
        if let Some(stream) = self.pool.checkout() {
            return Ok(stream);
        }
        self.create_connection().await
    }

    /// Return a connection after a successful request
    pub fn put_connection(&self, stream: TcpStream) {
        if !self.is_active() {
            debug!("Node {} inactive, closing returned connection", self.name);
            return;
        }
        if !self.pool.checkin(stream) {
            debug!("Node {} pool full, closing returned connection", self.name);
        }
    }

    async fn create_connection(&self) -> Result<TcpStream> {
        let addresses = self.addresses.load_full();
        let primary = match self.address_index.load(Ordering::Relaxed) {
            index if index < addresses.len() => index,
            _ => 0,
        };
        let timeout = self.context.conn_timeout;
        let order = std::iter::once(primary).chain((0..addresses.len()).filter(|&i| i != primary));

        let mut last_error = None;
        for index in order {
            let addr = addresses[index];
            match self.context.transport.connect(addr, timeout).await {
                Ok(mut stream) => {
                    if index != primary {
                        info!("Node {} switched to address {}", self.name, addr);
                        self.address_index.store(index, Ordering::Relaxed);
                    }
                    if let Some(credentials) = self.context.credentials() {
                        self.context
                            .transport
                            .authenticate(&mut stream, &credentials, timeout)
                            .await?;
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Node {} failed to connect to {}: {}", self.name, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ClusterError::unreachable(format!("Node {} has no addresses", self.name))
        }))
    }

    /// Query identity, partition generation and peers over the info connection.
    ///
    /// The info connection is closed on any failure. A changed name
    /// deactivates the node.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let mut info = self.info.lock().await;
        let result = self.refresh_on(&mut info).await;
        if result.is_err() {
            info.take();
        }
        result
    }

    async fn refresh_on(&self, slot: &mut Option<InfoConnection>) -> Result<RefreshReport> {
        let conn = self.info_connection(slot).await?;
        let response = conn
            .request(
                &["node", "partition-generation", "services"],
                self.context.conn_timeout,
            )
            .await?;

        let mut report = RefreshReport::default();
        let mut name_seen = false;

        for (field, value) in parse_multi_response(response.as_str()?) {
            match field {
                "node" => {
                    self.verify_name(value)?;
                    name_seen = true;
                }
                "partition-generation" => {
                    let generation: u32 = value.trim().parse().map_err(|_| {
                        ClusterError::protocol(format!("Invalid partition generation: {}", value))
                    })?;
                    report.generation_changed = self.partition_generation() != Some(generation);
                }
                "services" => report.peers = parse_services(value),
                _ => warn!("Node {} did not request info '{}'", self.name, field),
            }
        }

        if !name_seen {
            return Err(ClusterError::protocol(format!(
                "Node {} did not report its name",
                self.name
            )));
        }
        Ok(report)
    }

    fn verify_name(&self, reported: &str) -> Result<()> {
        if reported.is_empty() {
            return Err(ClusterError::protocol(format!(
                "Node {} returned an empty name",
                self.name
            )));
        }

        if reported != self.name {
            warn!(
                "Node name has changed. Old={} New={} This may be normal if a node was replaced",
                self.name, reported
            );
            self.deactivate();
            return Err(ClusterError::NameMismatch {
                expected: self.name.clone(),
                actual: reported.to_string(),
            });
        }
        Ok(())
    }

    /// Fetch the partition generation and both replica lists
    pub async fn fetch_partitions(&self) -> Result<PartitionUpdate> {
        let mut info = self.info.lock().await;
        let result = self.fetch_partitions_on(&mut info).await;
        if result.is_err() {
            info.take();
        }
        result
    }

    async fn fetch_partitions_on(&self, slot: &mut Option<InfoConnection>) -> Result<PartitionUpdate> {
        let conn = self.info_connection(slot).await?;
        let response = conn
            .request(
                &["partition-generation", "replicas-master", "replicas-prole"],
                self.context.conn_timeout,
            )
            .await?;

        let mut update = PartitionUpdate::default();
        for (field, value) in parse_multi_response(response.as_str()?) {
            match field {
                "partition-generation" => {
                    update.generation = Some(value.trim().parse().map_err(|_| {
                        ClusterError::protocol(format!("Invalid partition generation: {}", value))
                    })?);
                }
                "replicas-master" => update.master = Some(value.to_string()),
                "replicas-prole" => update.prole = Some(value.to_string()),
                _ => warn!("Node {} did not request info '{}'", self.name, field),
            }
        }
        Ok(update)
    }

    async fn info_connection<'a>(
        &self,
        slot: &'a mut Option<InfoConnection>,
    ) -> Result<&'a mut InfoConnection> {
        if slot.is_none() {
            let stream = self.create_connection().await?;
            *slot = Some(InfoConnection::new(stream));
        }
        slot.as_mut()
            .ok_or_else(|| ClusterError::client(format!("Node {} has no info connection", self.name)))
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            name: self.name.clone(),
            addresses: self.addresses().iter().map(ToString::to_string).collect(),
            active: self.is_active(),
            friends: self.friends(),
            failures: self.failures(),
            idle_connections: self.idle_connections(),
            partition_generation: self.partition_generation(),
        }
    }

    /// Close every connection owned by the node
    pub fn destroy(self) {
        let closed = self.pool.drain();
        let had_info = self.info.into_inner().is_some();
        debug!(
            "Node {} destroyed, closed {} idle connections{}",
            self.name,
            closed,
            if had_info { " and its info connection" } else { "" }
        );
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addresses", &self.addresses.load_full())
            .field("active", &self.is_active())
            .field("failures", &self.failures())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.primary_address())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::transport::TcpTransport;

    pub(crate) fn test_context() -> Arc<NodeContext> {
        Arc::new(NodeContext::new(
            Arc::new(TcpTransport),
            &ClusterConfig::default(),
        ))
    }

    pub(crate) fn test_node(name: &str) -> Node {
        Node::new(name, "127.0.0.1:3000".parse().unwrap(), test_context())
    }
}
