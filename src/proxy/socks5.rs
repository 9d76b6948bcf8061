use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::upstream::NegotiateError;

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 client handshake (RFC 1928, RFC 1929 for username/password) over a
/// stream already connected to the upstream proxy. On success the stream is a
/// raw tunnel to `host:port`.
///
/// The caller hands us its buffered reader and keeps using it afterwards;
/// any application bytes the server sent right behind the final reply stay in
/// that buffer instead of being lost here.
pub async fn negotiate<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), NegotiateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Offer exactly the one method we are able to complete.
    let offered = if credentials.is_some() { METHOD_USERPASS } else { METHOD_NONE };
    stream.write_all(&[VERSION, 1, offered]).await?;
    stream.flush().await?;

    let mut chosen = [0u8; 2];
    stream.read_exact(&mut chosen).await?;
    match (chosen[1], credentials) {
        (METHOD_USERPASS, Some((username, password))) => {
            authenticate(stream, username, password).await?
        }
        (METHOD_NONE, _) => {}
        (method, _) => {
            return Err(NegotiateError::Protocol(format!(
                "server selected unsupported method {method:#04x}"
            )))
        }
    }

    send_connect(stream, host, port).await?;
    read_connect_reply(stream).await
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<(), NegotiateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = username.as_bytes();
    let pass = password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(NegotiateError::Protocol("credentials longer than 255 bytes".into()));
    }

    let mut frame = Vec::with_capacity(3 + user.len() + pass.len());
    frame.push(AUTH_VERSION);
    frame.push(user.len() as u8);
    frame.extend_from_slice(user);
    frame.push(pass.len() as u8);
    frame.extend_from_slice(pass);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(NegotiateError::AuthFailed);
    }
    Ok(())
}

/// CONNECT request with the target as a length-prefixed domain and the port
/// in network byte order.
async fn send_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), NegotiateError>
where
    S: AsyncWrite + Unpin,
{
    let domain = host.as_bytes();
    if domain.len() > 255 {
        return Err(NegotiateError::Protocol("target hostname longer than 255 bytes".into()));
    }

    let mut frame = Vec::with_capacity(7 + domain.len());
    frame.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8]);
    frame.extend_from_slice(domain);
    frame.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_connect_reply<S>(stream: &mut S) -> Result<(), NegotiateError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(NegotiateError::Refused(format!("SOCKS5 reply code {:#04x}", head[1])));
    }

    // Skip the bound address and port; nothing downstream needs them.
    let bound_len = match head[3] {
        ATYP_IPV4 => 4usize,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        atyp => {
            return Err(NegotiateError::Protocol(format!("unknown bound address type {atyp:#04x}")))
        }
    };
    let mut skipped = vec![0u8; bound_len + 2];
    stream.read_exact(&mut skipped).await?;
    Ok(())
}
