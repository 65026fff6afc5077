//! Per-transport timeout profiles.

use crate::address::AddressNetwork;
use std::time::Duration;

/// Deadlines applied to a single peer session.
///
/// * `connect` bounds stream establishment, including any SOCKS or SAM
///   negotiation in front of it.
/// * `message` bounds one read of one message.
/// * `getaddr` bounds the whole address-collection window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutProfile {
    pub connect: Duration,
    pub message: Duration,
    pub getaddr: Duration,
}

impl TimeoutProfile {
    pub const fn from_secs(connect: u64, message: u64, getaddr: u64) -> Self {
        TimeoutProfile {
            connect: Duration::from_secs(connect),
            message: Duration::from_secs(message),
            getaddr: Duration::from_secs(getaddr),
        }
    }
}

/// Independent timeout profiles for each transport class.
///
/// Overlay transports are slower than direct IP across the board, so each
/// class carries its own triple. The defaults reflect observed connect and
/// reply latencies: Tor circuits are slow to build, I2P tunnels are slower
/// still to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub ip: TimeoutProfile,
    pub tor: TimeoutProfile,
    pub i2p: TimeoutProfile,
    pub cjdns: TimeoutProfile,
}

impl Timeouts {
    /// The profile governing connections to `network`.
    pub fn profile(&self, network: AddressNetwork) -> &TimeoutProfile {
        match network {
            AddressNetwork::Ipv4 | AddressNetwork::Ipv6 => &self.ip,
            AddressNetwork::OnionV3 => &self.tor,
            AddressNetwork::I2p => &self.i2p,
            AddressNetwork::Cjdns => &self.cjdns,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            ip: TimeoutProfile::from_secs(3, 30, 70),
            tor: TimeoutProfile::from_secs(100, 40, 90),
            i2p: TimeoutProfile::from_secs(30, 80, 170),
            cjdns: TimeoutProfile::from_secs(10, 30, 70),
        }
    }
}
