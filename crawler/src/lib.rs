//! Crawler for enumerating reachable nodes on the bitcoin p2p network.
//!
//! A crawl starts from a bootstrap set of addresses, handshakes with
//! every candidate across IPv4, IPv6, Tor v3, I2P and CJDNS, asks each
//! reachable node for its peer list, and fans out until the reachable
//! graph is exhausted. Results land in two CSV streams: one row per
//! probed node and, when enabled, one row per advertised address learned
//! from a sampled node.

pub mod config;
pub mod crawl;
pub mod frontier;
pub mod node;
pub mod output;
pub mod seeds;

pub use config::{Args, ConfigError, Settings};
pub use crawl::{CrawlError, CrawlSummary, Crawler};
pub use frontier::Frontier;
pub use node::{AdvertisedAddress, NodeReport};
