//! Scripted in-process database server answering info requests

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{BufMut, BytesMut};
use dbc_cluster::info::{ProtoHeader, HEADER_SIZE};
use dbc_cluster::{ClusterConfig, Host};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const TEST_PARTITIONS: usize = 16;
pub const TEST_NAMESPACE: &str = "test";

#[derive(Debug)]
struct ServerState {
    name: String,
    generation: u32,
    services: String,
    master: Vec<usize>,
    /// Close every connection instead of answering
    down: bool,
    /// Close connections asked for a refresh, still answer lone name queries
    fail_refresh: bool,
}

/// A fake server listening on an ephemeral localhost port
pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            name: name.to_string(),
            generation: 1,
            services: String::new(),
            master: Vec::new(),
            down: false,
            fail_refresh: false,
        }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> Host {
        Host::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.state.lock().name = name.to_string();
    }

    /// Advertise the given servers as peers
    pub fn set_peers(&self, peers: &[&FakeServer]) {
        let services: String = peers.iter().map(|p| format!("{};", p.addr)).collect();
        self.state.lock().services = services;
    }

    /// Claim master ownership of `partitions`, bumping the generation
    pub fn set_master(&self, partitions: &[usize]) {
        let mut state = self.state.lock();
        state.master = partitions.to_vec();
        state.generation += 1;
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().down = down;
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.state.lock().fail_refresh = fail;
    }

    pub fn config(&self) -> ClusterConfig {
        ClusterConfig {
            tend_interval_ms: 60_000,
            ..ClusterConfig::with_host(self.addr.ip().to_string(), self.addr.port())
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let mut payload = vec![0u8; ProtoHeader::decode(header).size as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }

        let payload = String::from_utf8_lossy(&payload).to_string();
        let names: Vec<&str> = payload.split('\n').filter(|n| !n.is_empty()).collect();

        let body = {
            let state = state.lock();
            if state.down || (state.fail_refresh && names.contains(&"services")) {
                return;
            }
            names
                .iter()
                .map(|name| format!("{}\t{}\n", name, field(&state, name)))
                .collect::<String>()
        };

        let mut reply = BytesMut::new();
        ProtoHeader::info(body.len()).encode(&mut reply);
        reply.put_slice(body.as_bytes());
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn field(state: &ServerState, name: &str) -> String {
    match name {
        "node" => state.name.clone(),
        "partition-generation" => state.generation.to_string(),
        "services" => state.services.clone(),
        "partitions" => TEST_PARTITIONS.to_string(),
        "replicas-master" => format!("{}:{};", TEST_NAMESPACE, bitmap(&state.master)),
        "replicas-prole" => String::new(),
        _ => String::new(),
    }
}

fn bitmap(owned: &[usize]) -> String {
    let mut bytes = vec![0u8; TEST_PARTITIONS.div_ceil(8)];
    for &p in owned {
        bytes[p >> 3] |= 0x80 >> (p & 7);
    }
    STANDARD.encode(bytes)
}

/// An address nothing listens on
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
