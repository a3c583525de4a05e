//! Deferred release of retired snapshots and nodes
//!
//! Whatever the tender unpublishes during a cycle is queued here and
//! released at the start of the next cycle, one tend interval later.
//! Readers that still hold a reservation at that point keep their copy
//! alive; the last of them frees it.

use crate::node::Node;
use crate::node_set::NodeSet;
use crate::partition::PartitionTables;
use std::sync::Arc;
use tracing::debug;

/// Something unpublished by the tender
#[derive(Debug)]
pub enum Retired {
    NodeSet(Arc<NodeSet>),
    Partitions(Arc<PartitionTables>),
    Node(Arc<Node>),
}

/// Outcome of one release pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Entries released
    pub released: usize,
    /// Nodes whose connections were closed here
    pub destroyed: usize,
    /// Nodes still reserved by a reader
    pub deferred: usize,
}

#[derive(Debug, Default)]
pub struct Reclaimer {
    pending: Vec<Retired>,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&mut self, item: Retired) {
        self.pending.push(item);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Release everything retired so far
    pub fn collect(&mut self) -> ReclaimStats {
        let mut stats = ReclaimStats::default();
        let mut nodes = Vec::new();

        // Retired sets and tables still point at retired nodes; drop them first.
        for item in self.pending.drain(..) {
            stats.released += 1;
            match item {
                Retired::NodeSet(set) => drop(set),
                Retired::Partitions(tables) => drop(tables),
                Retired::Node(node) => nodes.push(node),
            }
        }

        for node in nodes {
            let name = node.name().to_string();
            match Arc::try_unwrap(node) {
                Ok(node) => {
                    node.destroy();
                    stats.destroyed += 1;
                }
                Err(_) => {
                    debug!("Node {} still reserved, released by its last holder", name);
                    stats.deferred += 1;
                }
            }
        }

        if stats.released > 0 {
            debug!(
                "Reclaimed {} entries, destroyed {} nodes",
                stats.released, stats.destroyed
            );
        }
        stats
    }
}
