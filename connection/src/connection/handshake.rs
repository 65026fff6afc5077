//! Utilities for the bitcoin p2p version handshake.
//!
//! The driving loop lives in the [`Connection`](super::Connection) type;
//! this module carries the pieces it is built from.

use crate::address::PeerAddress;
use rand::Rng;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, for the version message's timestamp
/// field. Clamps to zero on a clock set before 1970 rather than caring
/// about an impossible machine.
pub fn unix_timestamp() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Random nonce for the version message.
///
/// Peers echo an incoming version's nonce check against their own
/// outbound connections to spot a loop back to themselves. Zero means
/// "no nonce" on the wire, so it is excluded.
pub fn generate_nonce() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

/// Progress of the version/verack exchange.
///
/// The handshake is done once the peer's version message and its verack
/// have both arrived; the protocol allows either to come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Our version is out, nothing has come back yet.
    VersionSent,
    /// The peer's version arrived; its verack is still outstanding.
    VersionReceived,
    /// The peer veracked before sending its version message.
    VerackReceived,
    /// Version and verack both arrived.
    Complete,
}

impl HandshakeState {
    /// Advance past the peer's version message. Duplicates do not move
    /// the state.
    pub fn on_version(self) -> Self {
        match self {
            HandshakeState::VersionSent => HandshakeState::VersionReceived,
            HandshakeState::VerackReceived => HandshakeState::Complete,
            other => other,
        }
    }

    /// Advance past the peer's verack. Duplicates do not move the state.
    pub fn on_verack(self) -> Self {
        match self {
            HandshakeState::VersionSent => HandshakeState::VerackReceived,
            HandshakeState::VersionReceived => HandshakeState::Complete,
            other => other,
        }
    }
}

/// Converts a peer address to a SocketAddr for version message compatibility.
///
/// The legacy version message can only carry IP endpoints; overlay peers
/// (onion, I2P) get the unspecified address, which peers accept.
pub fn address_to_socket(addr: &PeerAddress) -> SocketAddr {
    addr.socket_addr()
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn either_completion_order_works() {
        // Version first, then verack.
        let state = HandshakeState::VersionSent.on_version();
        assert_eq!(state, HandshakeState::VersionReceived);
        assert_eq!(state.on_verack(), HandshakeState::Complete);

        // Verack first, then version.
        let state = HandshakeState::VersionSent.on_verack();
        assert_eq!(state, HandshakeState::VerackReceived);
        assert_eq!(state.on_version(), HandshakeState::Complete);
    }

    #[test]
    fn duplicates_do_not_regress() {
        assert_eq!(
            HandshakeState::Complete.on_verack(),
            HandshakeState::Complete
        );
        assert_eq!(
            HandshakeState::Complete.on_version(),
            HandshakeState::Complete
        );
        assert_eq!(
            HandshakeState::VersionReceived.on_version(),
            HandshakeState::VersionReceived
        );
    }

    #[test]
    fn nonce_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(generate_nonce(), 0);
        }
    }

    #[test]
    fn overlay_addresses_map_to_unspecified() {
        let onion = PeerAddress::new(bitcoin::p2p::address::AddrV2::TorV3([1u8; 32]), 8333).unwrap();
        let socket = address_to_socket(&onion);
        assert!(socket.ip().is_unspecified());
        assert_eq!(socket.port(), 8333);
    }
}
