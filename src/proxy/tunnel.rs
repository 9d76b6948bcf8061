use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::sockopt::TUNNEL_BUF;

/// Full-duplex relay between the client and the negotiated upstream channel.
///
/// Both directions copy independently with no ordering between them. The
/// first direction to reach end-of-stream (or a transport error) tears the
/// whole tunnel down: the other copy is dropped mid-read and both write
/// sides are shut down, so the teardown fires exactly once.
///
/// The upstream side must be the channel's own buffered stream; a fresh view
/// of the socket would lose bytes the handshake already pulled into the
/// buffer.
pub async fn relay<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let client_to_upstream = pipe(&mut client_rd, &mut upstream_wr);
    let upstream_to_client = pipe(&mut upstream_rd, &mut client_wr);

    tokio::select! {
        sent = client_to_upstream => debug!("client side closed after {sent} bytes"),
        received = upstream_to_client => debug!("upstream side closed after {received} bytes"),
    }

    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;
}

/// One direction: read up to a buffer's worth, write it all, repeat. No
/// per-chunk flush. Transport errors are how a peer ends a tunnel, so they
/// terminate the copy like end-of-stream instead of surfacing as failures.
async fn pipe<R, W>(src: &mut R, dst: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUF];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) | Err(_) => return total,
            Ok(n) => n,
        };
        if dst.write_all(&buf[..n]).await.is_err() {
            return total;
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn bytes_cross_in_both_directions_in_order() {
        let (client_near, mut client_far) = duplex(64);
        let (upstream_near, mut upstream_far) = duplex(64);

        let relay_task = tokio::spawn(relay(client_near, upstream_near));

        client_far.write_all(b"ping from client").await.unwrap();
        let mut buf = [0u8; 16];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from client");

        upstream_far.write_all(b"pong from server").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong from server");

        drop(client_far);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn large_transfer_survives_chunking() {
        let (client_near, mut client_far) = duplex(8 * 1024);
        let (upstream_near, mut upstream_far) = duplex(8 * 1024);

        let relay_task = tokio::spawn(relay(client_near, upstream_near));

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_far.write_all(&payload).await.unwrap();
            client_far.shutdown().await.unwrap();
            client_far
        });

        let mut received = Vec::with_capacity(expected.len());
        let mut buf = vec![0u8; 4096];
        loop {
            let n = upstream_far.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if received.len() == expected.len() {
                break;
            }
        }
        assert_eq!(received, expected);

        drop(upstream_far);
        drop(writer.await.unwrap());
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn one_side_closing_tears_down_the_other() {
        let (client_near, client_far) = duplex(64);
        let (upstream_near, mut upstream_far) = duplex(64);

        let relay_task = tokio::spawn(relay(client_near, upstream_near));

        drop(client_far);

        // The upstream side now sees end-of-stream rather than hanging.
        let mut buf = [0u8; 1];
        assert_eq!(upstream_far.read(&mut buf).await.unwrap(), 0);
        relay_task.await.unwrap();
    }
}
