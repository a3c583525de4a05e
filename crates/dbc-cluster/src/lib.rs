//! Database Cluster Client
//!
//! This crate discovers the servers of a database cluster from a few seed
//! hosts and keeps an up-to-date view of them: which nodes exist, how to
//! reach them, and which node owns each data partition. A background tender
//! refreshes that view while request paths read it without locking.

pub mod config;
pub mod error;
pub mod info;
pub mod node;
pub mod node_set;
pub mod partition;
pub mod peers;
pub mod policy;
pub mod pool;
pub mod reclaim;
pub mod snapshot;
pub mod tend;
mod tender;
pub mod transport;

pub use config::{ClusterConfig, Credentials, Host};
pub use error::{ClusterError, ErrorCategory, Result};
pub use node::{Node, NodeStats};
pub use node_set::NodeSet;
pub use partition::{PartitionTables, Replica};
pub use tend::TendReport;
pub use transport::{TcpTransport, Transport};

use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tend::ClusterCore;
use tender::Tender;
use tracing::{info, warn};

/// Diagnostic view of the whole cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub valid: bool,
    pub partition_count: usize,
    pub namespaces: Vec<String>,
    pub seeds: Vec<String>,
    pub nodes: Vec<NodeStats>,
}

/// Client handle on a database cluster
pub struct Cluster {
    core: Arc<ClusterCore>,
    tender: Option<Tender>,
    node_index: AtomicUsize,
}

impl Cluster {
    /// Connect to the cluster over plain TCP
    pub async fn create(config: ClusterConfig) -> Result<Self> {
        Self::create_with_transport(config, Arc::new(TcpTransport)).await
    }

    /// Connect to the cluster using the given transport.
    ///
    /// Tends synchronously until the node count settles, then starts the
    /// background tender. Fails if no seed answers and
    /// `fail_if_not_connected` is set.
    pub async fn create_with_transport(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let interval = config.tend_interval();
        let fail_if_not_connected = config.fail_if_not_connected;
        let core = Arc::new(ClusterCore::new(config, transport));

        {
            let mut state = core.state.lock().await;
            match tender::wait_till_stabilized(&core, &mut state).await {
                Ok(()) => {}
                Err(e) if fail_if_not_connected => {
                    drop(state);
                    core.release_all().await;
                    return Err(e);
                }
                Err(e) => warn!("Cluster is not connected yet: {}", e),
            }
            core.add_seeds(&mut state);
        }

        core.valid.store(true, Ordering::Release);
        let tender = Tender::spawn(core.clone(), interval);
        info!("Cluster created with {} nodes", core.nodes.reserve().len());

        Ok(Self {
            core,
            tender: Some(tender),
            node_index: AtomicUsize::new(rand::thread_rng().gen()),
        })
    }

    /// Stop the tender and close every connection
    pub async fn destroy(mut self) {
        self.core.valid.store(false, Ordering::Release);
        if let Some(tender) = self.tender.take() {
            tender.shutdown().await;
        }
        self.core.release_all().await;
        info!("Cluster destroyed");
    }

    pub fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    /// Whether the cluster is valid and has at least one active node
    pub fn is_connected(&self) -> bool {
        self.is_valid() && self.core.nodes.reserve().iter().any(|n| n.is_active())
    }

    /// Reserve the current node set
    pub fn nodes(&self) -> Arc<NodeSet> {
        self.core.nodes.reserve()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.core.nodes.reserve().names()
    }

    pub fn node_by_name(&self, name: &str) -> Result<Arc<Node>> {
        self.core
            .nodes
            .reserve()
            .find_by_name(name)
            .cloned()
            .ok_or_else(|| ClusterError::node_not_found(name))
    }

    /// Pick an active node, rotating through the set
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.core.nodes.reserve();
        let size = nodes.len();

        for _ in 0..size {
            let index = self.node_index.fetch_add(1, Ordering::Relaxed) % size;
            if let Some(node) = nodes.get(index).filter(|n| n.is_active()) {
                return Ok(node.clone());
            }
        }
        Err(ClusterError::unreachable("No active node in cluster"))
    }

    /// Owner of a partition, falling back to a random node when unknown
    pub fn partition_node(&self, namespace: &str, partition: usize, replica: Replica) -> Result<Arc<Node>> {
        match self.core.partitions.reserve().node_for(namespace, partition, replica) {
            Some(node) if node.is_active() => Ok(node),
            _ => self.random_node(),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.core.partitions.reserve().partition_count()
    }

    /// Reserve the current partition tables
    pub fn partitions(&self) -> Arc<PartitionTables> {
        self.core.partitions.reserve()
    }

    /// Replace the password used for new connections
    pub fn change_password(&self, user: &str, password_hash: &str) -> Result<()> {
        if self.core.context.change_password(user, password_hash) {
            Ok(())
        } else {
            Err(ClusterError::client(format!(
                "Cannot change password of user '{}'",
                user
            )))
        }
    }

    /// Current seed list, including addresses learned from the cluster
    pub async fn seeds(&self) -> Vec<Host> {
        self.core.state.lock().await.seeds().to_vec()
    }

    /// Run a tend cycle now instead of waiting for the tender
    pub async fn tend_now(&self) -> Result<TendReport> {
        if !self.is_valid() {
            return Err(ClusterError::InvalidCluster);
        }
        let mut state = self.core.state.lock().await;
        self.core.tend(&mut state, false).await
    }

    pub async fn stats(&self) -> ClusterStats {
        let tables = self.core.partitions.reserve();
        ClusterStats {
            valid: self.is_valid(),
            partition_count: tables.partition_count(),
            namespaces: tables.namespaces(),
            seeds: self.seeds().await.iter().map(ToString::to_string).collect(),
            nodes: self.core.nodes.reserve().iter().map(|n| n.stats()).collect(),
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(tender) = self.tender.take() {
            self.core.valid.store(false, Ordering::Release);
            tender.cancel();
        }
    }
}
