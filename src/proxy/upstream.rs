use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::config::{UpstreamKind, UpstreamSettings};

use super::{client_tls, http_connect, sockopt, socks5};

/// Workaround for the restriction `only auto traits can be used as additional
/// traits in a trait object`
pub trait UpstreamIo: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> UpstreamIo for T {}

pub type UpstreamStream = Box<dyn UpstreamIo + Send + Unpin>;

/// Handshake read buffer. Small: only protocol replies go through it before
/// the relay takes over.
const HANDSHAKE_BUF: usize = 4096;

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("upstream rejected the credentials")]
    AuthFailed,
    #[error("upstream refused the connection: {0}")]
    Refused(String),
    #[error("unexpected handshake data: {0}")]
    Protocol(String),
}

impl From<io::Error> for NegotiateError {
    fn from(e: io::Error) -> Self {
        NegotiateError::Unreachable(e.to_string())
    }
}

/// An established, handshake-complete duplex channel to the target (or to a
/// proxy relaying to it).
///
/// The buffered reader wrapped here during construction is the one the
/// handshake read from, and it is the one the relay must keep reading from:
/// the remote end may have pipelined application bytes right behind its last
/// handshake reply, and those sit in this buffer. Re-fetching a fresh view of
/// the socket would silently drop them.
pub struct UpstreamChannel {
    stream: BufReader<UpstreamStream>,
}

impl std::fmt::Debug for UpstreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamChannel").finish_non_exhaustive()
    }
}

impl UpstreamChannel {
    fn new(stream: UpstreamStream) -> Self {
        Self { stream: BufReader::with_capacity(HANDSHAKE_BUF, stream) }
    }

    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    pub fn into_stream(self) -> BufReader<UpstreamStream> {
        self.stream
    }
}

/// Establish a channel to `host:port`, either directly or through the
/// configured upstream proxy, running whatever handshake the upstream kind
/// requires. The timeout bounds every step up to the end of the handshake
/// and nothing after it.
pub async fn connect(
    host: &str,
    port: u16,
    upstream: Option<&UpstreamSettings>,
    timeout: Duration,
) -> Result<UpstreamChannel, NegotiateError> {
    let Some(upstream) = upstream else {
        let stream = open_tcp(host, port, timeout).await?;
        return Ok(UpstreamChannel::new(Box::new(stream)));
    };

    let mut channel = proxy_transport(upstream, timeout).await?;
    let negotiation = async {
        match upstream.kind {
            UpstreamKind::Http | UpstreamKind::Https => {
                http_connect::negotiate(&mut channel.stream, host, port, upstream.credentials())
                    .await
            }
            UpstreamKind::Socks5 => {
                socks5::negotiate(&mut channel.stream, host, port, upstream.credentials()).await
            }
        }
    };
    match tokio::time::timeout(timeout, negotiation).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(NegotiateError::Unreachable(format!(
                "handshake with {}:{} timed out",
                upstream.host, upstream.port
            )))
        }
    }

    Ok(channel)
}

/// Transport-level connection to the upstream proxy itself: tuned TCP, plus a
/// TLS handshake against the upstream's host for the HTTPS kind. No proxy
/// protocol bytes are exchanged here.
pub async fn proxy_transport(
    upstream: &UpstreamSettings,
    timeout: Duration,
) -> Result<UpstreamChannel, NegotiateError> {
    let tcp = open_tcp(&upstream.host, upstream.port, timeout).await?;

    let stream: UpstreamStream = match upstream.kind {
        UpstreamKind::Https => {
            let handshake = client_tls::connect(tcp, &upstream.host, upstream.cacert_file.as_deref());
            let tls = tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| {
                    NegotiateError::Unreachable(format!(
                        "TLS handshake with {}:{} timed out",
                        upstream.host, upstream.port
                    ))
                })?
                .map_err(|e| {
                    NegotiateError::Unreachable(format!(
                        "TLS handshake with {}:{} failed: {e}",
                        upstream.host, upstream.port
                    ))
                })?;
            Box::new(tls)
        }
        _ => Box::new(tcp),
    };

    Ok(UpstreamChannel::new(stream))
}

async fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, NegotiateError> {
    let addr = lookup_host((host, port))
        .await
        .map_err(|e| NegotiateError::Unreachable(format!("resolving {host}:{port} failed: {e}")))?
        .next()
        .ok_or_else(|| NegotiateError::Unreachable(format!("{host}:{port} did not resolve")))?;

    let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }?;
    sockopt::tune_socket(&socket);

    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| NegotiateError::Unreachable(format!("connecting to {host}:{port} timed out")))??;
    sockopt::tune_stream(&stream);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn direct_channel_carries_bytes_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            tokio::io::BufReader::new(&mut socket).read_line(&mut line).await.unwrap();
            assert_eq!(line, "hello\n");
            socket.write_all(b"world\n").await.unwrap();
        });

        let mut channel = connect(&addr.ip().to_string(), addr.port(), None, TIMEOUT)
            .await
            .unwrap();
        channel.send(b"hello\n").await.unwrap();

        let mut reply = String::new();
        channel.into_stream().read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "world\n");
    }

    #[tokio::test]
    async fn closed_port_reports_unreachable() {
        // Bind then drop to find a port with nothing behind it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(&addr.ip().to_string(), addr.port(), None, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiateError::Unreachable(_)));
    }

    #[tokio::test]
    async fn https_kind_fails_cleanly_against_a_plain_tcp_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let upstream = UpstreamSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
            kind: UpstreamKind::Https,
            username: None,
            password: None,
            label: None,
            cacert_file: None,
        };
        let err = proxy_transport(&upstream, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, NegotiateError::Unreachable(_)));
    }

    #[tokio::test]
    async fn socks5_kind_negotiates_through_proxy_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            socket.write_all(&[0x05, 0x00]).await.unwrap();
            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            socket.write_all(b"pipelined").await.unwrap();
        });

        let upstream = UpstreamSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
            kind: UpstreamKind::Socks5,
            username: None,
            password: None,
            label: None,
            cacert_file: None,
        };
        let channel = connect("example.com", 80, Some(&upstream), TIMEOUT).await.unwrap();

        let mut early = [0u8; 9];
        channel.into_stream().read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"pipelined");
    }
}
