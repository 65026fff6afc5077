//! Multi-transport bitcoin p2p connections for the peer-census crawler.
//!
//! This crate covers everything between a [`PeerAddress`] and a completed
//! version handshake: the canonical address model across IPv4, IPv6,
//! Tor v3, I2P and CJDNS, the strict v1 message framing, the transport
//! dialers (direct TCP, SOCKS5 through Tor, SAM v3 into I2P), and the
//! [`Connection`] type the crawler drives its sessions through.

pub mod address;
pub mod codec;
mod connection;
mod dial;
pub mod timeouts;
pub mod user_agent;

pub use address::{AddressError, AddressNetwork, PeerAddress};
pub use codec::{CodecError, MessageReader, MessageWriter, MAX_ADDR_PER_MESSAGE};
pub use connection::{
    default_user_agent, Connection, ConnectionConfiguration, ConnectionError, HandshakeSummary,
    RemoteInfo, TcpConnection, PROTOCOL_VERSION,
};
pub use dial::{DialError, Dialer};
pub use timeouts::{TimeoutProfile, Timeouts};
pub use user_agent::{UserAgent, UserAgentError};
