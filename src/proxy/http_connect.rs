use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::upstream::NegotiateError;

const RESPONSE_LINE_MAX_SIZE: usize = 8192;

pub fn basic_authorization(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Ask the HTTP proxy on the far side of `stream` to open a raw tunnel to
/// `host:port`.
///
/// The status line must carry a literal `200`; anything else is a refusal
/// quoting that line. The remaining response headers are drained up to the
/// blank line and discarded.
///
/// Reads go through the caller's buffered reader: the target's first
/// response bytes may arrive in the same segment as the proxy's headers and
/// must stay in that buffer for the relay.
pub async fn negotiate<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), NegotiateError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let target = host_port(host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((username, password)) = credentials {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&basic_authorization(username, password));
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let status = read_header_line(stream).await?;
    if !status.contains("200") {
        return Err(NegotiateError::Refused(status));
    }
    loop {
        if read_header_line(stream).await?.is_empty() {
            break;
        }
    }
    Ok(())
}

async fn read_header_line<S>(stream: &mut S) -> Result<String, NegotiateError>
where
    S: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = stream.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(NegotiateError::Unreachable(
            "proxy closed the connection mid-handshake".into(),
        ));
    }
    if line.len() > RESPONSE_LINE_MAX_SIZE {
        return Err(NegotiateError::Protocol("response header line too large".into()));
    }
    while matches!(line.last(), Some(b'\r' | b'\n')) {
        line.pop();
    }
    Ok(line.iter().map(|&b| b as char).collect())
}
