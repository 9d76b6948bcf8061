use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::{Settings, UpstreamKind, UpstreamSettings};

mod client_tls;
mod codec;
mod http_connect;
mod sockopt;
mod socks5;
mod tunnel;
mod upstream;

use codec::{ClientRequest, RequestError};
use upstream::NegotiateError;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

#[derive(Debug, Error)]
enum ProxyError {
    #[error("upstream negotiation failed: {0}")]
    Negotiate(#[from] NegotiateError),
    #[error("Failed during I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns the listening socket and the accept loop. The upstream profile is
/// captured at `start` and stays read-only until `stop`; each accepted
/// connection gets its own worker and its own sockets, so no further
/// synchronization is needed.
pub struct ProxyServer {
    settings: Arc<Settings>,
    running: Arc<AtomicBool>,
    state: Mutex<Option<RunState>>,
}

/// What a running instance holds on to; created by `start`, torn down by
/// `stop`. The shutdown signal belongs to one run only, so a late `stop`
/// can never leak into the next run's accept loop.
struct RunState {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl ProxyServer {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Bind and spawn the accept loop. A second call while running is a
    /// no-op. A bind failure is returned to the caller and leaves the server
    /// stopped.
    pub fn start(&self, port: u16, upstream: Option<UpstreamSettings>) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = match self.bind(port) {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        *self.state.lock().unwrap() = Some(RunState { local_addr, shutdown: shutdown.clone() });

        match upstream {
            Some(ref profile) => info!(
                "server started on {local_addr}, chaining through {}:{} ({:?})",
                profile.host, profile.port, profile.kind
            ),
            None => info!("server started on {local_addr}, connecting directly"),
        }

        let running = self.running.clone();
        let settings = self.settings.clone();
        let upstream = Arc::new(upstream);
        tokio::spawn(accept_loop(listener, running, shutdown, settings, upstream));

        Ok(())
    }

    /// Close the listener and stop accepting. In-flight tunnels run to their
    /// natural end. Safe to call repeatedly.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(run) = self.state.lock().unwrap().take() {
            run.shutdown.notify_one();
            if was_running {
                info!("server stopped");
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().map(|run| run.local_addr)
    }

    fn bind(&self, port: u16) -> anyhow::Result<TcpListener> {
        let addr = SocketAddr::new(self.settings.listen_host, port);
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        sockopt::tune_socket(&socket);
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(sockopt::BACKLOG)?)
    }
}

async fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    settings: Arc<Settings>,
    upstream: Arc<Option<UpstreamSettings>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    sockopt::tune_stream(&socket);
                    let settings = settings.clone();
                    let upstream = upstream.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(socket, addr, settings, upstream).await {
                            error!("proxy error from {addr}: {e:?}");
                        }
                    });
                }
                Err(e) => {
                    if running.swap(false, Ordering::SeqCst) {
                        error!("accepting a connection failed: {e}");
                    }
                    break;
                }
            },
        }
    }
    // Dropping the listener closes it; workers own their sockets and keep
    // going.
}

async fn handle_client(
    mut client: TcpStream,
    addr: SocketAddr,
    settings: Arc<Settings>,
    upstream: Arc<Option<UpstreamSettings>>,
) -> Result<(), ProxyError> {
    // One read covers the whole header set in practice. Clients often append
    // payload (the start of a TLS ClientHello) behind the CONNECT headers in
    // the same segment; the codec keeps those bytes aside for forwarding.
    let mut buf = vec![0u8; sockopt::REQUEST_BUF];
    let n = client.read(&mut buf).await?;
    buf.truncate(n);

    let request = match codec::parse(Bytes::from(buf)) {
        Ok(request) => request,
        Err(RequestError::EmptyRead) => {
            debug!("{addr} closed before sending a request");
            return Ok(());
        }
        Err(RequestError::Malformed(line)) => {
            debug!("{addr} sent a malformed request line {line:?}");
            return Ok(());
        }
    };

    let timeout = settings.handshake_timeout_std();
    let upstream: Option<&UpstreamSettings> = (*upstream).as_ref();
    if request.method == "CONNECT" {
        serve_connect(client, addr, request, upstream, timeout).await
    } else {
        serve_plain(client, addr, request, upstream, timeout).await
    }
}

/// CONNECT: negotiate a channel to the requested host, confirm to the
/// client, push any bytes it already sent past the headers, then splice.
async fn serve_connect(
    mut client: TcpStream,
    addr: SocketAddr,
    request: ClientRequest,
    upstream: Option<&UpstreamSettings>,
    timeout: Duration,
) -> Result<(), ProxyError> {
    let (host, port) = codec::connect_target(&request.target);
    debug!("{addr} CONNECT {host}:{port}");

    let mut channel = match upstream::connect(&host, port, upstream, timeout).await {
        Ok(channel) => channel,
        Err(e) => {
            // Best effort; the client may already be gone.
            let _ = client.write_all(BAD_GATEWAY).await;
            return Err(e.into());
        }
    };

    client.write_all(CONNECT_ESTABLISHED).await?;
    if !request.pending.is_empty() {
        channel.send(&request.pending).await?;
    }

    tunnel::relay(client, channel.into_stream()).await;
    debug!("{addr} tunnel to {host}:{port} closed");
    Ok(())
}

/// Any other method: the absolute-form request is replayed to whoever comes
/// next. A chained HTTP/HTTPS proxy understands it as-is (with credentials
/// spliced in when the profile carries them); for SOCKS5 or direct the
/// channel already points at the origin server.
async fn serve_plain(
    client: TcpStream,
    addr: SocketAddr,
    request: ClientRequest,
    upstream: Option<&UpstreamSettings>,
    timeout: Duration,
) -> Result<(), ProxyError> {
    let (host, port) = match codec::origin_target(&request.target) {
        Ok(target) => target,
        Err(e) => {
            debug!("{addr} sent an unusable target: {e}");
            return Ok(());
        }
    };
    debug!("{addr} {} {host}:{port}", request.method);

    let (mut channel, mut initial) = match upstream {
        Some(profile) if matches!(profile.kind, UpstreamKind::Http | UpstreamKind::Https) => {
            let channel = upstream::proxy_transport(profile, timeout).await?;
            let initial = match profile.credentials() {
                Some((username, password)) => codec::insert_proxy_authorization(
                    &request.head,
                    &http_connect::basic_authorization(username, password),
                ),
                None => request.head.to_vec(),
            };
            (channel, initial)
        }
        _ => (
            upstream::connect(&host, port, upstream, timeout).await?,
            request.head.to_vec(),
        ),
    };
    initial.extend_from_slice(&request.pending);
    channel.send(&initial).await?;

    tunnel::relay(client, channel.into_stream()).await;
    debug!("{addr} connection to {host}:{port} closed");
    Ok(())
}
