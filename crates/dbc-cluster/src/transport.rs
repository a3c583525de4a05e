//! Socket primitives used by the cluster engine
//!
//! Name resolution, socket establishment and the security handshake are
//! supplied by the embedding driver through [`Transport`]. The engine only
//! ever sees connected, authenticated streams or an error.

use crate::config::Credentials;
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Network primitives consumed by nodes and the tender
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolve a host name to the socket addresses it serves on
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;

    /// Open a connection to a single address
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<TcpStream>;

    /// Run the security handshake on a freshly opened connection
    async fn authenticate(
        &self,
        stream: &mut TcpStream,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<()>;
}

/// Plain TCP transport with system name resolution
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ClusterError::unreachable(format!("Invalid host {}:{}: {}", host, port, e)))?
            .filter(SocketAddr::is_ipv4)
            .collect();

        if addrs.is_empty() {
            return Err(ClusterError::unreachable(format!(
                "Host {}:{} has no IPv4 address",
                host, port
            )));
        }
        Ok(addrs)
    }

    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClusterError::timeout(format!("Connect to {} timed out", addr)))?
            .map_err(|e| ClusterError::connection(addr, e))?;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn authenticate(
        &self,
        _stream: &mut TcpStream,
        credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<()> {
        tracing::debug!(
            "TCP transport has no security handshake, skipping login for {}",
            credentials.user
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_resolve_localhost_ipv4() {
        let addrs = TcpTransport.resolve("127.0.0.1", 3000).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:3000".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_connect_and_refuse() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpTransport
            .connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);

        drop(listener);
        let err = TcpTransport
            .connect(addr, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
