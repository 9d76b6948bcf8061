use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// 256 KiB tunnel copy buffer; fewer read/write syscalls per second than the
/// usual 8-16 KiB without hoarding memory per connection.
pub const TUNNEL_BUF: usize = 256 * 1024;
/// 16 KiB initial request read, enough for any realistic header set.
pub const REQUEST_BUF: usize = 16 * 1024;
/// 4 MiB socket buffers: ~3x the bandwidth-delay product of a
/// 300 Mbps / 40 ms path.
pub const SOCK_BUF: usize = 4 * 1024 * 1024;
/// Accept backlog.
pub const BACKLOG: u32 = 256;

/// IPTOS_THROUGHPUT
#[cfg(unix)]
const TOS_THROUGHPUT: u32 = 0x08;

/// Buffer hints go on the unconnected socket so the TCP window scale is
/// already negotiated at SYN time.
pub fn tune_socket(socket: &TcpSocket) {
    let sock = SockRef::from(socket);
    attempt("SO_RCVBUF", sock.set_recv_buffer_size(SOCK_BUF));
    attempt("SO_SNDBUF", sock.set_send_buffer_size(SOCK_BUF));
}

/// Re-assert the buffer hints and layer the post-connect options on top:
/// no-delay kills 40-200 ms delayed-ACK batching on multiplexed protocols,
/// keep-alive holds long-lived tunnels open through NAT.
pub fn tune_stream(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    attempt("TCP_NODELAY", sock.set_nodelay(true));
    attempt("SO_RCVBUF", sock.set_recv_buffer_size(SOCK_BUF));
    attempt("SO_SNDBUF", sock.set_send_buffer_size(SOCK_BUF));
    attempt("SO_KEEPALIVE", sock.set_keepalive(true));
    #[cfg(unix)]
    attempt("IP_TOS", sock.set_tos(TOS_THROUGHPUT));
}

/// Every option here is a hint. A kernel that refuses one gets a debug line,
/// never a dropped connection.
fn attempt(name: &str, result: std::io::Result<()>) {
    if let Err(e) = result {
        debug!("setting {name} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tuning_applies_to_a_connected_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let socket = TcpSocket::new_v4().unwrap();
        tune_socket(&socket);
        let client = socket.connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        tune_stream(&client);
        tune_stream(&server);

        assert!(client.nodelay().unwrap());
        assert!(server.nodelay().unwrap());

        // Kernels clamp the hint but must leave a usable value behind.
        let sock = SockRef::from(&client);
        assert!(sock.recv_buffer_size().unwrap() > 0);
        assert!(sock.send_buffer_size().unwrap() > 0);
    }
}
