//! Info protocol used for node discovery
//!
//! Every message starts with an 8 byte big-endian header carrying the
//! protocol version, the message type and a 48 bit payload size. Requests
//! carry newline terminated field names, responses carry one
//! `name\tvalue\n` line per requested field.

use crate::config::Credentials;
use crate::error::{ClusterError, Result};
use crate::transport::Transport;
use bytes::{BufMut, BytesMut};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Protocol version written in every header
pub const PROTO_VERSION: u8 = 2;

/// Message type of info requests and responses
pub const INFO_MESSAGE_TYPE: u8 = 1;

/// Size of the message header
pub const HEADER_SIZE: usize = 8;

/// Largest response body accepted from a server
pub const MAX_RESPONSE_SIZE: u64 = 512 * 1024;

/// Response bodies up to this size are read into the connection's scratch buffer
pub const SCRATCH_SIZE: usize = 16 * 1024;

const SIZE_MASK: u64 = (1 << 48) - 1;

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub msg_type: u8,
    pub size: u64,
}

impl ProtoHeader {
    /// Header for an info message with the given payload size
    pub fn info(size: usize) -> Self {
        Self {
            version: PROTO_VERSION,
            msg_type: INFO_MESSAGE_TYPE,
            size: size as u64,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let word = ((self.version as u64) << 56)
            | ((self.msg_type as u64) << 48)
            | (self.size & SIZE_MASK);
        buf.put_u64(word);
    }

    pub fn decode(bytes: [u8; HEADER_SIZE]) -> Self {
        let word = u64::from_be_bytes(bytes);
        Self {
            version: (word >> 56) as u8,
            msg_type: (word >> 48) as u8,
            size: word & SIZE_MASK,
        }
    }
}

/// Build a complete request for the given field names
pub fn encode_request(names: &[&str]) -> BytesMut {
    let payload_len: usize = names.iter().map(|n| n.len() + 1).sum();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);

    ProtoHeader::info(payload_len).encode(&mut buf);
    for name in names {
        buf.put_slice(name.as_bytes());
        buf.put_u8(b'\n');
    }
    buf
}

/// Response body, borrowed from the scratch buffer when it fits
#[derive(Debug)]
pub struct InfoResponse<'a> {
    body: Cow<'a, [u8]>,
}

impl InfoResponse<'_> {
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| ClusterError::protocol(format!("Info response is not UTF-8: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.body, Cow::Borrowed(_))
    }
}

/// Where a response body ended up after reading
enum BodyLocation {
    Scratch(usize),
    Owned(Vec<u8>),
}

/// Send an info request and read the response within `timeout`
pub async fn request<'a, S>(
    stream: &mut S,
    names: &[&str],
    timeout: Duration,
    scratch: &'a mut Vec<u8>,
) -> Result<InfoResponse<'a>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let location = tokio::time::timeout(timeout, exchange(stream, names, scratch)).await??;

    let body = match location {
        BodyLocation::Scratch(size) => Cow::Borrowed(&scratch[..size]),
        BodyLocation::Owned(body) => Cow::Owned(body),
    };
    Ok(InfoResponse { body })
}

async fn exchange<S>(stream: &mut S, names: &[&str], scratch: &mut Vec<u8>) -> Result<BodyLocation>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream.write_all(&encode_request(names)).await?;

    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let header = ProtoHeader::decode(header);

    if header.size == 0 || header.size > MAX_RESPONSE_SIZE {
        return Err(ClusterError::protocol(format!(
            "Bad info response size {}",
            header.size
        )));
    }

    let size = header.size as usize;
    if size > SCRATCH_SIZE {
        let mut body = vec![0u8; size];
        stream.read_exact(&mut body).await?;
        return Ok(BodyLocation::Owned(body));
    }

    scratch.clear();
    scratch.resize(size, 0);
    stream.read_exact(&mut scratch[..]).await?;
    Ok(BodyLocation::Scratch(size))
}

/// Split a multi-field response into `(name, value)` pairs
pub fn parse_multi_response(body: &str) -> Vec<(&str, &str)> {
    body.split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.split_once('\t').unwrap_or((line, "")))
        .collect()
}

/// Extract the value of a single-field response
pub fn parse_single_response(body: &str) -> Result<&str> {
    let line = body.split('\n').next().unwrap_or_default();
    line.split_once('\t')
        .map(|(_, value)| value)
        .ok_or_else(|| ClusterError::protocol(format!("Invalid info response: {}", line)))
}

/// Persistent info socket kept by the tender for one node
#[derive(Debug)]
pub struct InfoConnection {
    stream: TcpStream,
    scratch: Vec<u8>,
}

impl InfoConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            scratch: Vec::with_capacity(SCRATCH_SIZE),
        }
    }

    pub async fn request(&mut self, names: &[&str], timeout: Duration) -> Result<InfoResponse<'_>> {
        request(&mut self.stream, names, timeout, &mut self.scratch).await
    }
}

/// Query one field on a fresh connection to `addr`
pub async fn request_host(
    transport: &dyn Transport,
    addr: SocketAddr,
    name: &str,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<String> {
    let mut stream = transport.connect(addr, timeout).await?;

    if let Some(credentials) = credentials {
        transport.authenticate(&mut stream, credentials, timeout).await?;
    }

    let mut scratch = Vec::with_capacity(SCRATCH_SIZE);
    let response = request(&mut stream, &[name], timeout, &mut scratch).await?;
    let value = parse_single_response(response.as_str()?)?;
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn respond<S>(server: &mut S, body: &[u8])
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        let request = ProtoHeader::decode(header);
        let mut names = vec![0u8; request.size as usize];
        server.read_exact(&mut names).await.unwrap();

        let mut reply = BytesMut::new();
        ProtoHeader::info(body.len()).encode(&mut reply);
        reply.put_slice(body);
        server.write_all(&reply).await.unwrap();
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        ProtoHeader::info(0x0102_0304).encode(&mut buf);
        assert_eq!(&buf[..], &[2, 1, 0, 0, 1, 2, 3, 4]);

        let decoded = ProtoHeader::decode(buf[..].try_into().unwrap());
        assert_eq!(decoded, ProtoHeader::info(0x0102_0304));
    }

    #[test]
    fn test_encode_request() {
        let buf = encode_request(&["node", "partition-generation", "services"]);
        let header = ProtoHeader::decode(buf[..HEADER_SIZE].try_into().unwrap());

        assert_eq!(header.size as usize, buf.len() - HEADER_SIZE);
        assert_eq!(&buf[HEADER_SIZE..], b"node\npartition-generation\nservices\n");
    }

    #[test]
    fn test_parse_multi_response() {
        let body = "node\tBB9000000000001\npartition-generation\t42\nservices\t\n";
        let values = parse_multi_response(body);

        assert_eq!(
            values,
            vec![
                ("node", "BB9000000000001"),
                ("partition-generation", "42"),
                ("services", ""),
            ]
        );
    }

    #[test]
    fn test_parse_single_response() {
        assert_eq!(parse_single_response("partitions\t4096\n").unwrap(), "4096");
        assert!(parse_single_response("garbage").is_err());
        assert!(parse_single_response("").is_err());
    }

    #[tokio::test]
    async fn test_request_small_body_uses_scratch() {
        let (mut client, mut server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            respond(&mut server, b"node\tA1\n").await;
        });

        let mut scratch = Vec::with_capacity(SCRATCH_SIZE);
        let response = request(&mut client, &["node"], Duration::from_secs(1), &mut scratch)
            .await
            .unwrap();

        assert!(response.is_borrowed());
        assert_eq!(response.as_str().unwrap(), "node\tA1\n");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_large_body_is_owned() {
        let body = format!("replicas-master\t{}\n", "A".repeat(SCRATCH_SIZE * 2));
        let expected = body.clone();
        let (mut client, mut server) = duplex(256 * 1024);
        let server_task = tokio::spawn(async move {
            respond(&mut server, body.as_bytes()).await;
        });

        let mut scratch = Vec::with_capacity(SCRATCH_SIZE);
        let response = request(&mut client, &["replicas-master"], Duration::from_secs(1), &mut scratch)
            .await
            .unwrap();

        assert!(!response.is_borrowed());
        assert_eq!(response.len(), expected.len());
        assert_eq!(response.as_str().unwrap(), expected);
        drop(response);
        assert!(scratch.capacity() < SCRATCH_SIZE * 2);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_rejects_oversized_body() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut header = [0u8; HEADER_SIZE];
            server.read_exact(&mut header).await.unwrap();
            let mut names = vec![0u8; ProtoHeader::decode(header).size as usize];
            server.read_exact(&mut names).await.unwrap();

            let mut reply = BytesMut::new();
            ProtoHeader::info(MAX_RESPONSE_SIZE as usize + 1).encode(&mut reply);
            server.write_all(&reply).await.unwrap();
        });

        let mut scratch = Vec::new();
        let err = request(&mut client, &["node"], Duration::from_secs(1), &mut scratch)
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::Protocol(_)));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_against_scripted_stream() {
        let body = b"partitions\t4096\n";
        let mut reply = BytesMut::new();
        ProtoHeader::info(body.len()).encode(&mut reply);
        reply.put_slice(body);

        let mut stream = tokio_test::io::Builder::new()
            .write(&encode_request(&["partitions"]))
            .read(&reply)
            .build();

        let mut scratch = Vec::with_capacity(SCRATCH_SIZE);
        let response = request(&mut stream, &["partitions"], Duration::from_secs(1), &mut scratch)
            .await
            .unwrap();
        assert_eq!(parse_single_response(response.as_str().unwrap()).unwrap(), "4096");
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (mut client, _server) = duplex(1024);
        let mut scratch = Vec::new();

        let err = request(&mut client, &["node"], Duration::from_millis(50), &mut scratch)
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::Timeout(_)));
    }
}
