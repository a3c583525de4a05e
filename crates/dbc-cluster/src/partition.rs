//! Partition ownership tables
//!
//! Each node reports the partitions it owns per namespace as a base64
//! bitmap: `ns1:<bitmap>;ns2:<bitmap>;`. Bit `i`, most significant bit
//! first within each byte, marks partition `i` as owned by the reporter.
//! Tables are immutable once published; the tender updates a private copy
//! and publishes it through the same snapshot container as the node set.

use crate::node::Node;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;
use std::sync::Arc;

/// Namespace names must be shorter than this
pub const MAX_NAMESPACE_SIZE: usize = 32;

/// Which replica list a report or lookup refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replica {
    Master,
    Prole,
}

/// One namespace entry of a replicas report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceOwnership {
    pub namespace: String,
    pub bitmap: Vec<u8>,
}

impl NamespaceOwnership {
    pub fn owns(&self, partition: usize) -> bool {
        self.bitmap
            .get(partition >> 3)
            .map(|byte| byte & (0x80 >> (partition & 7)) != 0)
            .unwrap_or(false)
    }
}

/// Parse a replicas value, skipping malformed namespace entries
pub fn parse_replicas(value: &str, n_partitions: usize) -> Vec<NamespaceOwnership> {
    let min_len = n_partitions.div_ceil(8);

    value
        .split(';')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let Some((namespace, encoded)) = entry.split_once(':') else {
                tracing::warn!("Invalid partition entry: {}", entry);
                return None;
            };

            if namespace.is_empty() || namespace.len() >= MAX_NAMESPACE_SIZE {
                tracing::warn!("Invalid partition namespace: {}", namespace);
                return None;
            }

            let bitmap = match STANDARD.decode(encoded.trim()) {
                Ok(bitmap) => bitmap,
                Err(e) => {
                    tracing::warn!("Invalid partition bitmap for namespace {}: {}", namespace, e);
                    return None;
                }
            };

            if bitmap.len() < min_len {
                tracing::warn!(
                    "Partition bitmap for namespace {} too short: {} < {}",
                    namespace,
                    bitmap.len(),
                    min_len
                );
                return None;
            }

            Some(NamespaceOwnership {
                namespace: namespace.to_string(),
                bitmap,
            })
        })
        .collect()
}

/// Master and prole owners of every partition in one namespace
#[derive(Debug, Clone)]
pub struct PartitionTable {
    master: Vec<Option<Arc<Node>>>,
    prole: Vec<Option<Arc<Node>>>,
}

impl PartitionTable {
    fn new(n_partitions: usize) -> Self {
        Self {
            master: vec![None; n_partitions],
            prole: vec![None; n_partitions],
        }
    }

    fn owners(&self, replica: Replica) -> &[Option<Arc<Node>>] {
        match replica {
            Replica::Master => &self.master,
            Replica::Prole => &self.prole,
        }
    }

    fn owners_mut(&mut self, replica: Replica) -> &mut Vec<Option<Arc<Node>>> {
        match replica {
            Replica::Master => &mut self.master,
            Replica::Prole => &mut self.prole,
        }
    }

    fn references(&self, node: &Arc<Node>) -> bool {
        self.master
            .iter()
            .chain(self.prole.iter())
            .flatten()
            .any(|owner| Arc::ptr_eq(owner, node))
    }
}

/// Partition tables for every namespace the cluster reported
#[derive(Debug, Clone, Default)]
pub struct PartitionTables {
    n_partitions: usize,
    tables: HashMap<String, PartitionTable>,
}

impl PartitionTables {
    pub fn new(n_partitions: usize) -> Self {
        Self {
            n_partitions,
            tables: HashMap::new(),
        }
    }

    /// Partition count, zero until the cluster has been asked
    pub fn partition_count(&self) -> usize {
        self.n_partitions
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Apply one node's report, returning how many partitions were assigned to it
    pub fn update(&mut self, node: &Arc<Node>, value: &str, replica: Replica) -> usize {
        let n_partitions = self.n_partitions;
        let mut assigned = 0;

        for ownership in parse_replicas(value, n_partitions) {
            let table = self
                .tables
                .entry(ownership.namespace.clone())
                .or_insert_with(|| PartitionTable::new(n_partitions));
            let owners = table.owners_mut(replica);

            for (partition, owner) in owners.iter_mut().enumerate() {
                if ownership.owns(partition) {
                    *owner = Some(node.clone());
                    assigned += 1;
                }
            }
        }
        assigned
    }

    /// Whether any master or prole entry points at `node`
    pub fn contains_node(&self, node: &Arc<Node>) -> bool {
        self.tables.values().any(|table| table.references(node))
    }

    /// Clear every entry owned by one of `removed`, returning how many were cleared
    pub fn purge(&mut self, removed: &[Arc<Node>]) -> usize {
        let mut cleared = 0;
        for table in self.tables.values_mut() {
            for owner in table.master.iter_mut().chain(table.prole.iter_mut()) {
                if owner
                    .as_ref()
                    .is_some_and(|n| removed.iter().any(|r| Arc::ptr_eq(n, r)))
                {
                    *owner = None;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Owner of a partition, if one is known
    pub fn node_for(&self, namespace: &str, partition: usize, replica: Replica) -> Option<Arc<Node>> {
        self.tables
            .get(namespace)?
            .owners(replica)
            .get(partition)?
            .clone()
    }
}
