//! Peer addresses across the five crawled address families.
//!
//! Every address entering the crawler is canonicalized on construction so
//! that deduplication, transport dispatch and BIP155 encoding all agree on
//! a single identity. The canonical form is the typed [`AddrV2`] plus port:
//! IPv4-mapped IPv6 addresses are downcast to IPv4, IPv6 literals inside
//! `fc00::/8` are reclassified as CJDNS, and address families the crawler
//! cannot reach (Tor v2, unknown BIP155 network ids) are rejected outright.

use bitcoin::p2p::address::AddrV2;
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Length of a Tor v3 hostname without the `.onion` suffix.
const ONION_V3_LEN: usize = 56;
/// Length of an I2P base32 hostname without the `.b32.i2p` suffix.
const I2P_B32_LEN: usize = 52;
/// Version byte carried in the last position of a decoded onion hostname.
const ONION_V3_VERSION: u8 = 0x03;

/// The network family an address belongs to.
///
/// The family decides which transport dials the address, which BIP155
/// network id encodes it, and how it is labeled in the result files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressNetwork {
    Ipv4,
    Ipv6,
    OnionV3,
    I2p,
    Cjdns,
}

impl AddressNetwork {
    /// Stable lower-case name used in result files and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressNetwork::Ipv4 => "ipv4",
            AddressNetwork::Ipv6 => "ipv6",
            AddressNetwork::OnionV3 => "onion_v3",
            AddressNetwork::I2p => "i2p",
            AddressNetwork::Cjdns => "cjdns",
        }
    }

    /// Whether the address family is plain IP (directly connectable).
    pub fn is_ip(&self) -> bool {
        matches!(self, AddressNetwork::Ipv4 | AddressNetwork::Ipv6)
    }
}

impl fmt::Display for AddressNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while constructing or parsing a [`PeerAddress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// BIP155 network id the crawler does not support (Tor v2, unknown ids).
    UnsupportedNetwork,
    /// Input string has no `:port` component.
    MissingPort,
    /// Port component is not a valid u16.
    InvalidPort(String),
    /// Host component matches none of the supported textual forms.
    UnknownHostFormat(String),
    /// `.onion` hostname with bad length, encoding, checksum or version.
    InvalidOnion(String),
    /// `.b32.i2p` hostname with bad length or encoding.
    InvalidI2p(String),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::UnsupportedNetwork => write!(f, "unsupported address network"),
            AddressError::MissingPort => write!(f, "address is missing a port"),
            AddressError::InvalidPort(port) => write!(f, "invalid port: {port}"),
            AddressError::UnknownHostFormat(host) => write!(f, "unrecognized host: {host}"),
            AddressError::InvalidOnion(host) => write!(f, "invalid onion hostname: {host}"),
            AddressError::InvalidI2p(host) => write!(f, "invalid i2p hostname: {host}"),
        }
    }
}

impl std::error::Error for AddressError {}

/// A canonicalized peer address: typed host plus port.
///
/// Equality and hashing cover the canonical `(network, host, port)`
/// identity, so a [`PeerAddress`] can key the crawler's dedup sets
/// directly. The binary BIP155 form and the textual form round-trip
/// through each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    addr: AddrV2,
    port: u16,
}

impl PeerAddress {
    /// Canonicalize a BIP155 address into a crawlable peer address.
    ///
    /// IPv4-mapped IPv6 is downcast to IPv4 and `fc00::/8` IPv6 is
    /// reclassified as CJDNS before the identity is fixed. Tor v2 and
    /// unknown network ids are refused.
    pub fn new(addr: AddrV2, port: u16) -> Result<Self, AddressError> {
        let addr = match addr {
            AddrV2::Ipv6(ip) => {
                if let Some(mapped) = ip.to_ipv4_mapped() {
                    AddrV2::Ipv4(mapped)
                } else if is_cjdns(&ip) {
                    AddrV2::Cjdns(ip)
                } else {
                    AddrV2::Ipv6(ip)
                }
            }
            AddrV2::Ipv4(_) | AddrV2::TorV3(_) | AddrV2::I2p(_) | AddrV2::Cjdns(_) => addr,
            AddrV2::TorV2(_) | AddrV2::Unknown(..) => return Err(AddressError::UnsupportedNetwork),
        };
        Ok(PeerAddress { addr, port })
    }

    /// Convenience constructor for plain IP peers.
    pub fn from_ip(ip: std::net::IpAddr, port: u16) -> Self {
        let addr = match ip {
            std::net::IpAddr::V4(v4) => AddrV2::Ipv4(v4),
            std::net::IpAddr::V6(v6) => AddrV2::Ipv6(v6),
        };
        // Canonicalization of IP input cannot hit an unsupported network.
        PeerAddress::new(addr, port).expect("ip addresses are always supported")
    }

    /// The network family of this address.
    pub fn network(&self) -> AddressNetwork {
        match self.addr {
            AddrV2::Ipv4(_) => AddressNetwork::Ipv4,
            AddrV2::Ipv6(_) => AddressNetwork::Ipv6,
            AddrV2::TorV3(_) => AddressNetwork::OnionV3,
            AddrV2::I2p(_) => AddressNetwork::I2p,
            AddrV2::Cjdns(_) => AddressNetwork::Cjdns,
            // Rejected in the constructor.
            AddrV2::TorV2(_) | AddrV2::Unknown(..) => unreachable!("canonicalized address"),
        }
    }

    /// The canonical BIP155 form.
    pub fn addr_v2(&self) -> &AddrV2 {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Canonical textual host: dotted quad, compressed lower-case IPv6,
    /// `.onion` or `.b32.i2p` hostname.
    pub fn host(&self) -> String {
        match &self.addr {
            AddrV2::Ipv4(ip) => ip.to_string(),
            AddrV2::Ipv6(ip) | AddrV2::Cjdns(ip) => ip.to_string(),
            AddrV2::TorV3(pubkey) => {
                let mut raw = [0u8; 35];
                raw[..32].copy_from_slice(pubkey);
                raw[32..34].copy_from_slice(&onion_checksum(pubkey));
                raw[34] = ONION_V3_VERSION;
                format!("{}.onion", base32_encode(&raw))
            }
            AddrV2::I2p(hash) => format!("{}.b32.i2p", base32_encode(hash)),
            AddrV2::TorV2(_) | AddrV2::Unknown(..) => unreachable!("canonicalized address"),
        }
    }

    /// The socket address for directly connectable families, `None` for
    /// overlay networks that dial through a proxy or bridge.
    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        match self.addr {
            AddrV2::Ipv4(ip) => Some((ip, self.port).into()),
            AddrV2::Ipv6(ip) | AddrV2::Cjdns(ip) => Some((ip, self.port).into()),
            _ => None,
        }
    }
}

impl fmt::Display for PeerAddress {
    /// Formats as `host:port`, bracketing IPv6 and CJDNS literals.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network() {
            AddressNetwork::Ipv6 | AddressNetwork::Cjdns => {
                write!(f, "[{}]:{}", self.host(), self.port)
            }
            _ => write!(f, "{}:{}", self.host(), self.port),
        }
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    /// Parses a `host:port` string in any of the five textual forms.
    ///
    /// IPv6 and CJDNS literals must be bracketed; onion and i2p hostnames
    /// must carry their full suffix and a valid encoding. Mixed forms
    /// (an IP literal where a hostname is expected, or vice versa) are
    /// refused rather than guessed at.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(AddressError::MissingPort)?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(port.to_string()))?;

        if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            let ip: Ipv6Addr = inner
                .parse()
                .map_err(|_| AddressError::UnknownHostFormat(host.to_string()))?;
            return PeerAddress::new(AddrV2::Ipv6(ip), port);
        }

        if let Some(b32) = host.strip_suffix(".onion") {
            return PeerAddress::new(AddrV2::TorV3(parse_onion_v3(b32)?), port);
        }

        if let Some(b32) = host.strip_suffix(".b32.i2p") {
            return PeerAddress::new(AddrV2::I2p(parse_i2p_b32(b32)?), port);
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return PeerAddress::new(AddrV2::Ipv4(ip), port);
        }

        Err(AddressError::UnknownHostFormat(host.to_string()))
    }
}

/// CJDNS allocates from `fc00::/8`.
fn is_cjdns(ip: &Ipv6Addr) -> bool {
    ip.octets()[0] == 0xfc
}

/// First two bytes of `SHA3-256(".onion checksum" || pubkey || version)`,
/// as prescribed by the Tor rendezvous v3 address format.
fn onion_checksum(pubkey: &[u8; 32]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(pubkey);
    hasher.update([ONION_V3_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

/// Decode and verify the 56-character body of a v3 onion hostname.
fn parse_onion_v3(b32: &str) -> Result<[u8; 32], AddressError> {
    let invalid = || AddressError::InvalidOnion(format!("{b32}.onion"));
    if b32.len() != ONION_V3_LEN {
        return Err(invalid());
    }
    let raw = base32_decode(b32).ok_or_else(invalid)?;
    if raw.len() != 35 || raw[34] != ONION_V3_VERSION {
        return Err(invalid());
    }
    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(&raw[..32]);
    if raw[32..34] != onion_checksum(&pubkey) {
        return Err(invalid());
    }
    Ok(pubkey)
}

/// Decode the 52-character body of a `.b32.i2p` hostname.
fn parse_i2p_b32(b32: &str) -> Result<[u8; 32], AddressError> {
    let invalid = || AddressError::InvalidI2p(format!("{b32}.b32.i2p"));
    if b32.len() != I2P_B32_LEN {
        return Err(invalid());
    }
    let raw = base32_decode(b32).ok_or_else(invalid)?;
    let mut hash = [0u8; 32];
    if raw.len() != 32 {
        return Err(invalid());
    }
    hash.copy_from_slice(&raw);
    Ok(hash)
}

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// RFC 4648 base32, lower case, without padding. Onion and I2P hostnames
/// use exactly this variant.
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in s.bytes() {
        let value = match c {
            b'a'..=b'z' => c - b'a',
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    // Leftover bits are alignment slack and must be zero.
    if bits > 0 && buffer & ((1 << bits) - 1) != 0 {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onion_address(pubkey: [u8; 32]) -> PeerAddress {
        PeerAddress::new(AddrV2::TorV3(pubkey), 8333).unwrap()
    }

    #[test]
    fn parse_ipv4() {
        let addr: PeerAddress = "1.2.3.4:8333".parse().unwrap();
        assert_eq!(addr.network(), AddressNetwork::Ipv4);
        assert_eq!(addr.host(), "1.2.3.4");
        assert_eq!(addr.port(), 8333);
        assert_eq!(addr.to_string(), "1.2.3.4:8333");
    }

    #[test]
    fn parse_ipv6_bracketed() {
        let addr: PeerAddress = "[2001:db8::1]:8333".parse().unwrap();
        assert_eq!(addr.network(), AddressNetwork::Ipv6);
        assert_eq!(addr.to_string(), "[2001:db8::1]:8333");
    }

    #[test]
    fn ipv4_mapped_ipv6_downcast() {
        let mapped: Ipv6Addr = "::ffff:10.0.0.1".parse().unwrap();
        let addr = PeerAddress::new(AddrV2::Ipv6(mapped), 8333).unwrap();
        assert_eq!(addr.network(), AddressNetwork::Ipv4);
        assert_eq!(addr.host(), "10.0.0.1");
    }

    #[test]
    fn cjdns_range_reclassified() {
        let ip: Ipv6Addr = "fc32:17ea:e415:c3bf:9808:149d:b5a2:c9aa".parse().unwrap();
        let addr = PeerAddress::new(AddrV2::Ipv6(ip), 8333).unwrap();
        assert_eq!(addr.network(), AddressNetwork::Cjdns);
        // The parsed textual form agrees.
        let parsed: PeerAddress = format!("[{ip}]:8333").parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn fd00_is_not_cjdns() {
        let ip: Ipv6Addr = "fd00::1".parse().unwrap();
        let addr = PeerAddress::new(AddrV2::Ipv6(ip), 8333).unwrap();
        assert_eq!(addr.network(), AddressNetwork::Ipv6);
    }

    #[test]
    fn onion_text_round_trip() {
        let addr = onion_address([7u8; 32]);
        let text = addr.to_string();
        assert!(text.ends_with(".onion:8333"));
        assert_eq!(addr.host().len(), ONION_V3_LEN + ".onion".len());
        let parsed: PeerAddress = text.parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn onion_bad_checksum_rejected() {
        let addr = onion_address([7u8; 32]);
        let mut text = addr.to_string();
        // Corrupt one character of the base32 body.
        let replacement = if text.starts_with('a') { 'b' } else { 'a' };
        text.replace_range(0..1, &replacement.to_string());
        assert!(matches!(
            text.parse::<PeerAddress>(),
            Err(AddressError::InvalidOnion(_))
        ));
    }

    #[test]
    fn i2p_text_round_trip() {
        let addr = PeerAddress::new(AddrV2::I2p([42u8; 32]), 0).unwrap();
        let text = addr.to_string();
        assert!(text.ends_with(".b32.i2p:0"));
        assert_eq!(addr.host().len(), I2P_B32_LEN + ".b32.i2p".len());
        let parsed: PeerAddress = text.parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn torv2_rejected() {
        assert_eq!(
            PeerAddress::new(AddrV2::TorV2([0u8; 10]), 8333),
            Err(AddressError::UnsupportedNetwork)
        );
        assert_eq!(
            PeerAddress::new(AddrV2::Unknown(42, vec![1, 2, 3]), 8333),
            Err(AddressError::UnsupportedNetwork)
        );
    }

    #[test]
    fn missing_or_bad_port() {
        assert_eq!(
            "1.2.3.4".parse::<PeerAddress>(),
            Err(AddressError::MissingPort)
        );
        assert!(matches!(
            "1.2.3.4:70000".parse::<PeerAddress>(),
            Err(AddressError::InvalidPort(_))
        ));
    }

    #[test]
    fn mixed_forms_refused() {
        // An IPv6 literal inside an onion field.
        assert!("2001:db8::1.onion:8333".parse::<PeerAddress>().is_err());
        // A hostname that is neither onion nor i2p nor an IP literal.
        assert!(matches!(
            "seed.example.com:8333".parse::<PeerAddress>(),
            Err(AddressError::UnknownHostFormat(_))
        ));
    }

    #[test]
    fn identity_ignores_source_form() {
        // The same host reached through the mapped-IPv6 form and the plain
        // IPv4 form must dedup to one identity.
        let mapped: Ipv6Addr = "::ffff:1.2.3.4".parse().unwrap();
        let a = PeerAddress::new(AddrV2::Ipv6(mapped), 8333).unwrap();
        let b: PeerAddress = "1.2.3.4:8333".parse().unwrap();
        assert_eq!(a, b);

        // Different ports are different peers.
        let c: PeerAddress = "1.2.3.4:8334".parse().unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn base32_known_vector() {
        // RFC 4648 test vector: "foobar" -> MZXW6YTBOI (lower-case, unpadded).
        assert_eq!(base32_encode(b"foobar"), "mzxw6ytboi");
        assert_eq!(base32_decode("mzxw6ytboi").unwrap(), b"foobar");
        assert_eq!(base32_decode("MZXW6YTBOI").unwrap(), b"foobar");
        assert!(base32_decode("0189").is_none());
    }
}
