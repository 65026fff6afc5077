//! Minimal SOCKS5 (RFC 1928) client for reaching onion peers through Tor.
//!
//! Only the slice of the protocol the crawler needs: no-authentication
//! negotiation and a CONNECT request with a domain-name destination, so
//! that the `.onion` hostname is resolved inside Tor rather than locally.

use super::DialError;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Human-readable name for a SOCKS5 reply code.
pub(super) fn reply_name(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Negotiate with the proxy on `stream` and connect it to `host:port`.
///
/// On success the stream carries the proxied connection; on failure the
/// stream is useless and the caller drops it.
pub(super) async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Method selection: offer no-authentication only.
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(DialError::SocksVersion(choice[0]));
    }
    if choice[1] != METHOD_NO_AUTH {
        return Err(DialError::SocksAuth);
    }

    // CONNECT with a domain-name destination.
    let host_bytes = host.as_bytes();
    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host_bytes.len() as u8);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(DialError::SocksVersion(reply[0]));
    }
    if reply[1] != REPLY_SUCCEEDED {
        return Err(DialError::SocksRejected(reply[1]));
    }

    // Drain the bound address so the stream starts clean at the payload.
    match reply[3] {
        ATYP_IPV4 => {
            let mut bound = [0u8; 4 + 2];
            stream.read_exact(&mut bound).await?;
        }
        ATYP_IPV6 => {
            let mut bound = [0u8; 16 + 2];
            stream.read_exact(&mut bound).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut bound = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut bound).await?;
        }
        other => return Err(DialError::SocksVersion(other)),
    }

    debug!("SOCKS5 connect to {host}:{port} established");
    Ok(())
}
