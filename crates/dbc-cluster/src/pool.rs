//! Idle connection pool kept per node
//!
//! Connections are checked out most-recently-returned first. A pooled socket
//! may have been dropped by the server while it sat idle, so every checkout
//! probes it with a non-blocking peek before handing it out.

use parking_lot::Mutex;
use std::io;
use std::mem::MaybeUninit;
use tokio::net::TcpStream;

/// Result of probing an idle socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing to read and no error: the normal idle state
    Connected,
    /// The remote end closed the connection
    PeerClosed,
    /// Any other socket error
    LocalError,
    /// The handle itself is no longer valid
    InvalidHandle,
}

/// Classify the outcome of a zero-wait peek
pub fn classify(result: io::Result<usize>) -> Liveness {
    match result {
        Ok(0) => Liveness::PeerClosed,
        // Unsolicited data on an idle socket; still usable.
        Ok(_) => Liveness::Connected,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Liveness::Connected,
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(libc::EBADF) => Liveness::InvalidHandle,
        Err(_) => Liveness::LocalError,
    }
}

/// Probe a socket without blocking and without consuming data
pub fn probe(stream: &TcpStream) -> Liveness {
    let socket = socket2::SockRef::from(stream);
    let mut buf = [MaybeUninit::<u8>::uninit(); 8];
    let result = socket.peek(&mut buf);

    if let Ok(n) = result {
        if n > 0 {
            tracing::info!("Connected check: peek got unexpected data on idle socket");
        }
    }
    classify(result)
}

/// Bounded stack of idle connections
#[derive(Debug)]
pub struct SocketPool {
    idle: Mutex<Vec<TcpStream>>,
    capacity: usize,
}

impl SocketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Take the most recently returned live connection, discarding dead ones
    pub fn checkout(&self) -> Option<TcpStream> {
        loop {
            let stream = self.idle.lock().pop()?;

            match probe(&stream) {
                Liveness::Connected => return Some(stream),
                Liveness::PeerClosed => {
                    tracing::debug!("Connected check: found disconnected socket");
                }
                Liveness::LocalError => {
                    tracing::info!("Connected check: socket error, discarding connection");
                }
                Liveness::InvalidHandle => {
                    tracing::warn!("Found bad socket handle in pool");
                }
            }
        }
    }

    /// Return a connection; it is closed instead when the pool is full
    pub fn checkin(&self, stream: TcpStream) -> bool {
        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(stream);
        true
    }

    /// Close every idle connection, returning how many were closed
    pub fn drain(&self) -> usize {
        let drained: Vec<TcpStream> = std::mem::take(&mut *self.idle.lock());
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
