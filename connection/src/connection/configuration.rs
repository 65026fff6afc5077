//! Connection configuration types and constants.

use crate::user_agent::UserAgent;
use bitcoin::p2p::ServiceFlags;

/// Default user agent for peer-census connections.
///
/// This identifies the crawler to other peers on the network. Format
/// follows Bitcoin Core's convention: "/$NAME:$VERSION/".
pub fn default_user_agent() -> UserAgent {
    UserAgent::from_name_version("peer-census", env!("CARGO_PKG_VERSION"))
}

/// Protocol version the crawler speaks.
///
/// 70016 is the minimum version that negotiates AddrV2 (BIP155), which the
/// crawler needs to learn onion, I2P and CJDNS peers.
pub const PROTOCOL_VERSION: u32 = 70016;

/// Configuration used to build a connection.
///
/// The crawler is always a non-listening node: it advertises no services,
/// a zeroed sender address, and asks peers not to relay transactions.
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    /// Local protocol version advertised in the version message.
    pub protocol_version: u32,
    /// Custom user agent advertised for connection. Defaults to the
    /// peer-census user agent if None.
    pub user_agent: Option<UserAgent>,
    /// Service flags advertised by this node.
    pub services: ServiceFlags,
    /// Block height advertised in version messages.
    pub start_height: i32,
    /// Whether the peer should relay transactions to us.
    pub relay: bool,
}

impl ConnectionConfiguration {
    /// Creates a new configuration for a non-listening node.
    ///
    /// # Arguments
    ///
    /// * `protocol_version` - The protocol version to advertise.
    /// * `user_agent` - Optional custom user agent. Defaults to the
    ///   peer-census user agent if None.
    pub fn non_listening(protocol_version: u32, user_agent: Option<UserAgent>) -> Self {
        Self {
            protocol_version,
            user_agent,
            services: ServiceFlags::NONE,
            start_height: 0,
            relay: false,
        }
    }
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self::non_listening(PROTOCOL_VERSION, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_listening_defaults() {
        let config = ConnectionConfiguration::default();
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.services, ServiceFlags::NONE);
        assert_eq!(config.start_height, 0);
        assert!(!config.relay);
    }

    #[test]
    fn test_default_user_agent_format() {
        let ua = default_user_agent();
        assert!(ua.as_str().starts_with("/peer-census:"));
        assert!(ua.as_str().ends_with('/'));
    }
}
