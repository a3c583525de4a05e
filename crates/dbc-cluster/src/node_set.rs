//! Immutable set of cluster nodes
//!
//! A new set is built for every membership change and published as a whole.
//! Membership is by identity (`Arc::ptr_eq`), never by name, so a replaced
//! server with the same name never matches a stale handle.

use crate::node::Node;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct NodeSet {
    nodes: Vec<Arc<Node>>,
}

impl NodeSet {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Node>> {
        self.nodes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter()
    }

    /// A new set with `added` appended
    pub fn with_added(&self, added: &[Arc<Node>]) -> Self {
        let mut nodes = Vec::with_capacity(self.nodes.len() + added.len());
        nodes.extend(self.nodes.iter().cloned());
        nodes.extend(added.iter().cloned());
        Self { nodes }
    }

    /// A new set without any node in `removed`
    pub fn without(&self, removed: &[Arc<Node>]) -> Self {
        let nodes = self
            .nodes
            .iter()
            .filter(|node| !removed.iter().any(|r| Arc::ptr_eq(node, r)))
            .cloned()
            .collect();
        Self { nodes }
    }

    pub fn contains(&self, node: &Arc<Node>) -> bool {
        self.nodes.iter().any(|n| Arc::ptr_eq(n, node))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    /// Find the node that owns `addr` as its primary address or an alias
    pub fn find_by_address(&self, addr: SocketAddr) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.has_address(addr))
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.name().to_string()).collect()
    }
}
