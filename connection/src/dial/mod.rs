//! Stream establishment for the four transport classes.
//!
//! A single [`Dialer`] serves the whole crawl. Direct IP and CJDNS peers
//! get a plain TCP connect; onion peers are reached through the configured
//! Tor SOCKS5 proxy with the hostname resolved inside Tor; I2P peers are
//! reached through one long-lived SAM session shared by every stream.
//! All strategies yield a [`TcpStream`], so the codec and connection
//! layers never care which transport carried the bytes.

mod sam;
mod socks5;

use crate::address::{AddressNetwork, PeerAddress};
use sam::SamSession;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Errors raised while establishing a peer stream.
#[derive(Debug)]
pub enum DialError {
    /// An I/O error from the socket or an intermediary.
    Io(io::Error),
    /// The connect deadline lapsed before the stream was ready.
    Timeout,
    /// The SOCKS5 proxy spoke an unexpected protocol version.
    SocksVersion(u8),
    /// The SOCKS5 proxy refused no-authentication access.
    SocksAuth,
    /// The SOCKS5 proxy rejected the connect request with a reply code.
    SocksRejected(u8),
    /// The SAM bridge rejected a handshake, session or stream command.
    SamRejected(String),
    /// A CJDNS peer outside the `fc00::/8` range.
    CjdnsRange(std::net::Ipv6Addr),
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::Io(e) => write!(f, "dial failed: {e}"),
            DialError::Timeout => write!(f, "dial timed out"),
            DialError::SocksVersion(v) => write!(f, "unexpected SOCKS version {v}"),
            DialError::SocksAuth => write!(f, "SOCKS proxy refused no-auth access"),
            DialError::SocksRejected(code) => {
                write!(f, "SOCKS proxy rejected connect: {}", socks5::reply_name(*code))
            }
            DialError::SamRejected(reply) => write!(f, "SAM bridge rejected request: {reply}"),
            DialError::CjdnsRange(ip) => write!(f, "address {ip} is outside fc00::/8"),
        }
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DialError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DialError {
    fn from(e: io::Error) -> Self {
        DialError::Io(e)
    }
}

/// Opens peer streams across all transport classes.
///
/// The dialer owns the one SAM session the crawl is allowed (the session's
/// control socket stays open for the dialer's lifetime), so it is created
/// once and shared behind an `Arc` by every worker.
#[derive(Debug)]
pub struct Dialer {
    tor_proxy: SocketAddr,
    i2p_sam: SocketAddr,
    /// Lazily created, then reused by every I2P stream. Guarded by a mutex
    /// because SAM session setup is a serial command exchange.
    sam_session: Mutex<Option<SamSession>>,
}

impl Dialer {
    /// Create a dialer for the given Tor SOCKS5 proxy and I2P SAM router.
    pub fn new(tor_proxy: SocketAddr, i2p_sam: SocketAddr) -> Self {
        Dialer {
            tor_proxy,
            i2p_sam,
            sam_session: Mutex::new(None),
        }
    }

    /// Open a stream to `address`, bounded by `connect_timeout`.
    ///
    /// The deadline covers the whole establishment, including SOCKS5
    /// negotiation and SAM stream setup. Closing the returned stream is
    /// the caller's only cleanup obligation on every exit path.
    pub async fn dial(
        &self,
        address: &PeerAddress,
        connect_timeout: std::time::Duration,
    ) -> Result<TcpStream, DialError> {
        match timeout(connect_timeout, self.dial_inner(address)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout),
        }
    }

    async fn dial_inner(&self, address: &PeerAddress) -> Result<TcpStream, DialError> {
        match address.network() {
            AddressNetwork::Ipv4 | AddressNetwork::Ipv6 => {
                let socket_addr = address.socket_addr().expect("ip address");
                tcp_connect(socket_addr).await
            }
            AddressNetwork::Cjdns => {
                let socket_addr = address.socket_addr().expect("cjdns address");
                match socket_addr.ip() {
                    std::net::IpAddr::V6(ip) if ip.octets()[0] == 0xfc => {}
                    std::net::IpAddr::V6(ip) => return Err(DialError::CjdnsRange(ip)),
                    std::net::IpAddr::V4(_) => unreachable!("cjdns is always ipv6"),
                }
                tcp_connect(socket_addr).await
            }
            AddressNetwork::OnionV3 => {
                let mut stream = tcp_connect(self.tor_proxy).await?;
                // Pass the hostname through so resolution happens inside Tor.
                socks5::connect(&mut stream, &address.host(), address.port()).await?;
                Ok(stream)
            }
            AddressNetwork::I2p => {
                let session_id = self.sam_session_id().await?;
                sam::stream_connect(self.i2p_sam, &session_id, &address.host()).await
            }
        }
    }

    /// Id of the shared SAM session, creating the session on first use.
    async fn sam_session_id(&self) -> Result<String, DialError> {
        let mut guard = self.sam_session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.id().to_string());
        }
        let session = SamSession::create(self.i2p_sam).await?;
        let id = session.id().to_string();
        *guard = Some(session);
        Ok(id)
    }
}

/// Establish a TCP connection with nodelay set.
///
/// Nagle's algorithm hurts the p2p protocol's many small messages, so it
/// is disabled on every stream.
async fn tcp_connect(socket_addr: SocketAddr) -> Result<TcpStream, DialError> {
    let stream = TcpStream::connect(socket_addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::p2p::address::AddrV2;
    use std::net::Ipv6Addr;
    use std::time::Duration;

    #[tokio::test]
    async fn dial_refused_is_io_error() {
        // Bind and immediately drop a listener so the port is likely free.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = Dialer::new(
            "127.0.0.1:9050".parse().unwrap(),
            "127.0.0.1:7656".parse().unwrap(),
        );
        let address: PeerAddress = format!("127.0.0.1:{port}").parse().unwrap();
        let result = dialer.dial(&address, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(DialError::Io(_)) | Err(DialError::Timeout)));
    }

    #[tokio::test]
    async fn cjdns_addresses_dial_direct() {
        // A CJDNS address passes range validation and then fails like any
        // unroutable direct connection. The point is dispatch, not reach.
        let ip: Ipv6Addr = "fc00::1".parse().unwrap();
        let address = PeerAddress::new(AddrV2::Cjdns(ip), 8333).unwrap();
        let dialer = Dialer::new(
            "127.0.0.1:9050".parse().unwrap(),
            "127.0.0.1:7656".parse().unwrap(),
        );
        let result = dialer.dial(&address, Duration::from_millis(200)).await;
        assert!(result.is_err());
        assert!(!matches!(result, Err(DialError::CjdnsRange(_))));
    }
}
