//! Bitcoin p2p protocol connection.
//!
//! This module provides connection handling for the crawler's sessions
//! with bitcoin peers: stream establishment over any of the supported
//! transports, the version/verack handshake, and message exchange on top
//! of the framing codec.
//!
//! A [`Connection`] owns its stream exclusively. Dropping it closes the
//! underlying descriptor, which is the only cleanup a session needs on
//! any exit path.
//!
//! # Examples
//!
//! Reaching a peer and completing the handshake:
//!
//! ```no_run
//! use bitcoin::p2p::Magic;
//! use peer_census_connection::{
//!     Connection, ConnectionConfiguration, Dialer, PeerAddress,
//! };
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dialer = Dialer::new(
//!     "127.0.0.1:9050".parse()?,
//!     "127.0.0.1:7656".parse()?,
//! );
//! let address: PeerAddress = "127.0.0.1:8333".parse()?;
//!
//! let mut connection = Connection::dial(
//!     address,
//!     Magic::BITCOIN,
//!     ConnectionConfiguration::default(),
//!     &dialer,
//!     Duration::from_secs(3),
//! )
//! .await?;
//! let summary = connection.handshake(Duration::from_secs(30)).await?;
//! println!("peer runs {}", summary.remote.user_agent);
//! # Ok(())
//! # }
//! ```

mod configuration;
mod error;
mod handshake;

pub use configuration::{default_user_agent, ConnectionConfiguration, PROTOCOL_VERSION};
pub use error::ConnectionError;

use crate::address::PeerAddress;
use crate::codec::{MessageReader, MessageWriter};
use crate::dial::Dialer;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Magic, ServiceFlags};
use handshake::{address_to_socket, generate_nonce, unix_timestamp, HandshakeState};
use log::debug;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

/// What the peer told us about itself during the handshake.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    /// Protocol version from the peer's version message.
    pub protocol_version: u32,
    /// Services bitfield the peer advertises.
    pub services: ServiceFlags,
    /// The peer's user agent string.
    pub user_agent: String,
    /// Best block height the peer reported.
    pub start_height: i32,
}

/// Outcome of a completed handshake, including the latency split the
/// crawler records per node.
#[derive(Debug, Clone)]
pub struct HandshakeSummary {
    pub remote: RemoteInfo,
    /// Time from sending our version until the peer's version arrived.
    pub version_latency: Duration,
    /// Time from sending our version until the handshake completed.
    pub verack_latency: Duration,
}

/// A connection over tokio TCP stream halves, as produced by
/// [`Connection::dial`]. Every transport class yields this type.
pub type TcpConnection = Connection<OwnedReadHalf, OwnedWriteHalf>;

/// Represents a connection to a bitcoin peer.
///
/// Generic over the stream halves so the protocol logic can be exercised
/// against in-memory streams in tests; production code uses
/// [`TcpConnection`].
#[derive(Debug)]
pub struct Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// The peer this connection is established with.
    peer: PeerAddress,
    /// Configuration used for the handshake.
    configuration: ConnectionConfiguration,
    /// Framing over the read half.
    reader: MessageReader<R>,
    /// Framing over the write half.
    writer: MessageWriter<W>,
}

impl Connection<OwnedReadHalf, OwnedWriteHalf> {
    /// Establish a stream to `peer` through the appropriate transport.
    ///
    /// The connect timeout bounds the whole establishment, including any
    /// SOCKS5 or SAM negotiation. The handshake is a separate step so the
    /// caller can meter it independently.
    pub async fn dial(
        peer: PeerAddress,
        magic: Magic,
        configuration: ConnectionConfiguration,
        dialer: &Dialer,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let stream = dialer.dial(&peer, connect_timeout).await?;
        let (reader, writer) = stream.into_split();
        Ok(Connection::new(peer, magic, configuration, reader, writer))
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap an established stream in a connection.
    pub fn new(
        peer: PeerAddress,
        magic: Magic,
        configuration: ConnectionConfiguration,
        reader: R,
        writer: W,
    ) -> Self {
        Self {
            peer,
            configuration,
            reader: MessageReader::new(magic, reader),
            writer: MessageWriter::new(magic, writer),
        }
    }

    /// The peer this connection is established with.
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Send a message to the peer.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), ConnectionError> {
        self.writer.write(message).await.map_err(ConnectionError::Codec)
    }

    /// Receive a message from the peer.
    pub async fn read(&mut self) -> Result<NetworkMessage, ConnectionError> {
        self.reader.read().await.map_err(ConnectionError::Codec)
    }

    /// Receive a message, bounded by a single-message deadline.
    ///
    /// The read resumes cleanly after a lapsed deadline because the codec
    /// is cancellation safe.
    pub async fn read_timeout(
        &mut self,
        deadline: Duration,
    ) -> Result<NetworkMessage, ConnectionError> {
        match timeout(deadline, self.reader.read()).await {
            Ok(result) => result.map_err(ConnectionError::Codec),
            Err(_) => Err(ConnectionError::MessageTimeout),
        }
    }

    /// Performs the bitcoin p2p version handshake.
    ///
    /// 1. Send local version message.
    /// 2. Receive and validate the peer's version.
    /// 3. Opt into BIP155 with `sendaddrv2`, then exchange veracks.
    ///
    /// Pings arriving mid-handshake are answered; other messages are
    /// ignored. Each read is bounded by `message_timeout`.
    pub async fn handshake(
        &mut self,
        message_timeout: Duration,
    ) -> Result<HandshakeSummary, ConnectionError> {
        // Nonce for connection loop detection.
        let nonce = generate_nonce();

        let version_message = self.create_version_message(nonce);
        let started = Instant::now();
        self.write(version_message).await?;
        debug!("Sent version message to {}", self.peer);

        let mut state = HandshakeState::VersionSent;
        let mut remote = None;
        let mut version_latency = Duration::ZERO;

        while state != HandshakeState::Complete {
            let message = self.read_timeout(message_timeout).await?;

            match message {
                NetworkMessage::Version(version) => {
                    if version.nonce == nonce {
                        debug!("Connection loop detected with {}", self.peer);
                        return Err(ConnectionError::ConnectionLoop);
                    }
                    if remote.is_some() {
                        debug!("Duplicate version message from {}, ignoring", self.peer);
                        continue;
                    }
                    debug!(
                        "Received version from {} ({}, protocol {})",
                        self.peer, version.user_agent, version.version
                    );
                    version_latency = started.elapsed();
                    remote = Some(RemoteInfo {
                        protocol_version: version.version,
                        services: version.services,
                        user_agent: version.user_agent,
                        start_height: version.start_height,
                    });

                    // Opt into BIP155 address gossip before completing
                    // the handshake, as required for addrv2 to be
                    // negotiated.
                    self.write(NetworkMessage::SendAddrV2).await?;
                    self.write(NetworkMessage::Verack).await?;
                    debug!("Sent sendaddrv2 and verack to {}", self.peer);

                    state = state.on_version();
                }
                NetworkMessage::Verack => {
                    state = state.on_verack();
                }
                NetworkMessage::Ping(ping_nonce) => {
                    self.write(NetworkMessage::Pong(ping_nonce)).await?;
                }
                other => {
                    debug!("Ignoring {} message during handshake", other.command());
                }
            }
        }

        debug!("Handshake with {} completed", self.peer);
        Ok(HandshakeSummary {
            remote: remote.expect("handshake completes only after a version message"),
            version_latency,
            verack_latency: started.elapsed(),
        })
    }

    /// Creates the version message announcing this crawler.
    fn create_version_message(&self, nonce: u64) -> NetworkMessage {
        let receiver_socket_addr = address_to_socket(&self.peer);
        // Non-listening: the sender endpoint is all zeros.
        let sender_socket_addr =
            std::net::SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0);

        let user_agent = match &self.configuration.user_agent {
            Some(ua) => ua.as_str().to_string(),
            None => default_user_agent().to_string(),
        };

        let version = VersionMessage {
            version: self.configuration.protocol_version,
            services: self.configuration.services,
            timestamp: unix_timestamp(),
            receiver: Address::new(&receiver_socket_addr, ServiceFlags::NONE),
            sender: Address::new(&sender_socket_addr, self.configuration.services),
            nonce,
            user_agent,
            start_height: self.configuration.start_height,
            relay: self.configuration.relay,
        };

        NetworkMessage::Version(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::encode;
    use bitcoin::p2p::message::RawNetworkMessage;
    use tokio_test::io::Builder as MockIoBuilder;

    fn test_peer() -> PeerAddress {
        "127.0.0.1:8333".parse().unwrap()
    }

    fn raw(message: NetworkMessage) -> Vec<u8> {
        encode::serialize(&RawNetworkMessage::new(Magic::BITCOIN, message))
    }

    fn peer_version(nonce: u64) -> NetworkMessage {
        let zero = std::net::SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0);
        NetworkMessage::Version(VersionMessage {
            version: 70016,
            services: ServiceFlags::NETWORK,
            timestamp: 1_700_000_000,
            receiver: Address::new(&zero, ServiceFlags::NONE),
            sender: Address::new(&zero, ServiceFlags::NETWORK),
            nonce,
            user_agent: "/Satoshi:27.0.0/".to_string(),
            start_height: 850_000,
            relay: false,
        })
    }

    #[tokio::test]
    async fn handshake_records_remote_info() {
        let mut incoming = Vec::new();
        incoming.extend_from_slice(&raw(peer_version(99)));
        incoming.extend_from_slice(&raw(NetworkMessage::Verack));

        let reader = MockIoBuilder::new().read(&incoming).build();
        let writer = Vec::new();
        let mut connection = Connection::new(
            test_peer(),
            Magic::BITCOIN,
            ConnectionConfiguration::default(),
            reader,
            writer,
        );

        let summary = connection
            .handshake(Duration::from_secs(1))
            .await
            .expect("handshake should complete");

        assert_eq!(summary.remote.protocol_version, 70016);
        assert_eq!(summary.remote.user_agent, "/Satoshi:27.0.0/");
        assert_eq!(summary.remote.start_height, 850_000);
        assert!(summary.remote.services.has(ServiceFlags::NETWORK));
        assert!(summary.version_latency <= summary.verack_latency);
    }

    #[tokio::test]
    async fn handshake_answers_ping() {
        let mut incoming = Vec::new();
        incoming.extend_from_slice(&raw(peer_version(99)));
        incoming.extend_from_slice(&raw(NetworkMessage::Ping(7)));
        incoming.extend_from_slice(&raw(NetworkMessage::Verack));

        let reader = MockIoBuilder::new().read(&incoming).build();
        let writer = Vec::new();
        let mut connection = Connection::new(
            test_peer(),
            Magic::BITCOIN,
            ConnectionConfiguration::default(),
            reader,
            writer,
        );

        connection
            .handshake(Duration::from_secs(1))
            .await
            .expect("handshake should complete");
    }

    #[tokio::test]
    async fn handshake_verack_before_version() {
        // Some peers verack first; the handshake must complete either way.
        let mut incoming = Vec::new();
        incoming.extend_from_slice(&raw(NetworkMessage::Verack));
        incoming.extend_from_slice(&raw(peer_version(99)));

        let reader = MockIoBuilder::new().read(&incoming).build();
        let writer = Vec::new();
        let mut connection = Connection::new(
            test_peer(),
            Magic::BITCOIN,
            ConnectionConfiguration::default(),
            reader,
            writer,
        );

        let summary = connection
            .handshake(Duration::from_secs(1))
            .await
            .expect("handshake should complete");
        assert_eq!(summary.remote.protocol_version, 70016);
    }

    #[tokio::test]
    async fn handshake_times_out_on_silence() {
        // A duplex stream with no peer bytes: reads pend until the deadline.
        let (client, _server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(client);
        let mut connection = Connection::new(
            test_peer(),
            Magic::BITCOIN,
            ConnectionConfiguration::default(),
            reader,
            writer,
        );

        let result = connection.handshake(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ConnectionError::MessageTimeout)));
    }

    #[tokio::test]
    async fn handshake_detects_connection_loop() {
        // Echoing our own nonce back must abort the session. The nonce is
        // unpredictable, so feed the peer version lazily from our own
        // version message via a scripted duplex peer.
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let mut connection = Connection::new(
            test_peer(),
            Magic::BITCOIN,
            ConnectionConfiguration::default(),
            reader,
            writer,
        );

        let echo = tokio::spawn(async move {
            let (server_read, server_write) = tokio::io::split(server);
            let mut reader = MessageReader::new(Magic::BITCOIN, server_read);
            let mut writer = MessageWriter::new(Magic::BITCOIN, server_write);
            if let Ok(message) = reader.read().await {
                // Reflect the version message verbatim, nonce included.
                writer.write(message).await.unwrap();
            }
        });

        let result = connection.handshake(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectionError::ConnectionLoop)));
        echo.await.unwrap();
    }
}
