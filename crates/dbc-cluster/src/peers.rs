//! Peer gossip parsing
//!
//! Nodes advertise the service addresses of their peers as
//! `host1:port1;host2:port2;...`. Entries are validated individually so a
//! single bad address never hides the rest of the list.

use crate::config::Host;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A peer address advertised by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Host as it appeared on the wire
    pub host: Host,

    /// Parsed socket address
    pub addr: SocketAddr,
}

/// Parse a services value into its valid peer entries
pub fn parse_services(value: &str) -> Vec<Peer> {
    value
        .split(';')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match parse_entry(entry) {
            Some(peer) => Some(peer),
            None => {
                tracing::warn!("Invalid services address: {}", entry);
                None
            }
        })
        .collect()
}

fn parse_entry(entry: &str) -> Option<Peer> {
    let (host, port) = entry.split_once(':')?;
    let port: u16 = port.trim().parse().ok().filter(|p| *p > 0)?;
    let ip: Ipv4Addr = host.parse().ok()?;

    Some(Peer {
        host: Host::new(host, port),
        addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
    })
}

/// Candidate peers collected during one tend cycle, unique by address
#[derive(Debug, Default)]
pub struct PeerList {
    peers: Vec<Peer>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate, returning false if its address is already listed
    pub fn insert(&mut self, peer: Peer) -> bool {
        if self.peers.iter().any(|p| p.addr == peer.addr) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }
}
