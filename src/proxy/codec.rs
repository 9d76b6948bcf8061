use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("peer closed before sending a request")]
    EmptyRead,
    #[error("malformed request line: {0:?}")]
    Malformed(String),
}

/// The initial bytes a client sent, split at the header terminator.
pub struct ClientRequest {
    pub method: String,
    pub target: String,
    /// Raw header bytes, up to and including `\r\n\r\n` when present.
    pub head: Bytes,
    /// Bytes read past the header terminator in the same read. Typically the
    /// start of a TLS ClientHello after CONNECT; forwarded verbatim, never
    /// dropped.
    pub pending: Bytes,
}

/// Offset one past the `\r\n\r\n` end-of-headers marker.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Header text is decoded one byte per character (Latin-1), never UTF-8, so
/// parsed text maps back onto the wire bytes position for position.
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn parse(buf: Bytes) -> Result<ClientRequest, RequestError> {
    if buf.is_empty() {
        return Err(RequestError::EmptyRead);
    }

    // Without a terminator the whole read is (partial) headers.
    let head_end = find_header_end(&buf).unwrap_or(buf.len());
    let head = buf.slice(..head_end);
    let pending = buf.slice(head_end..);

    let line_end = head.windows(2).position(|w| w == b"\r\n").unwrap_or(head.len());
    let line = latin1(&head[..line_end]);
    let mut tokens = line.split(' ');
    let (method, target) = match (tokens.next(), tokens.next()) {
        (Some(method), Some(target)) if !method.is_empty() && !target.is_empty() => {
            (method.to_owned(), target.to_owned())
        }
        _ => return Err(RequestError::Malformed(line)),
    };

    Ok(ClientRequest { method, target, head, pending })
}

/// `host:port` from a CONNECT target. The port defaults to 443 when absent or
/// unparsable; bracketed IPv6 literals are unwrapped.
pub fn connect_target(target: &str) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(443);
            return (host.to_owned(), port);
        }
    }

    match target.rfind(':') {
        Some(colon) if colon > 0 && !target[..colon].contains(':') => {
            let port = target[colon + 1..].parse().unwrap_or(443);
            (target[..colon].to_owned(), port)
        }
        _ => (target.to_owned(), 443),
    }
}

/// `host:port` from an absolute-form request target. `http://` is assumed when
/// the scheme is missing; the default port is 80 (443 under `https://`).
pub fn origin_target(target: &str) -> Result<(String, u16), RequestError> {
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("http".to_owned(), target),
    };
    let default_port = if scheme == "https" { 443 } else { 80 };

    let authority = rest.split(['/', '?']).next().unwrap_or("");
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        match bracketed.split_once(']') {
            Some((host, tail)) => {
                let port = tail.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
                (host.to_owned(), port)
            }
            None => (bracketed.to_owned(), default_port),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                (host.to_owned(), port.parse().unwrap_or(default_port))
            }
            _ => (authority.to_owned(), default_port),
        }
    };

    if host.is_empty() {
        return Err(RequestError::Malformed(target.to_owned()));
    }
    Ok((host, port))
}

/// Splice a `Proxy-Authorization` header immediately after the request line,
/// operating on raw bytes so the rest of the head round-trips untouched.
pub fn insert_proxy_authorization(head: &[u8], value: &str) -> Vec<u8> {
    let header = format!("Proxy-Authorization: {value}\r\n");
    let mut out = Vec::with_capacity(head.len() + header.len() + 2);

    match head.windows(2).position(|w| w == b"\r\n") {
        Some(i) => {
            out.extend_from_slice(&head[..i + 2]);
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(&head[i + 2..]);
        }
        None => {
            out.extend_from_slice(head);
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(header.as_bytes());
        }
    }
    out
}
