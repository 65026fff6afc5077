//! Bootstrap address acquisition.
//!
//! The crawl core never resolves names; everything here runs once at
//! startup to hand the controller its bootstrap set. Addresses come from
//! literal `--seed` flags, a seed file of prior results, and/or the
//! well-known DNS seeds.

use crate::config::Args;
use log::{debug, info, warn};
use peer_census_connection::PeerAddress;
use tokio::net::lookup_host;

/// Mainnet DNS seeds hardcoded in Bitcoin Core.
pub const DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be.",
    "dnsseed.bluematt.me.",
    "dnsseed.bitcoin.dashjr-list-of-p2p-nodes.us.",
    "seed.bitcoinstats.com.",
    "seed.bitcoin.jonasschnelli.ch.",
    "seed.btc.petertodd.net.",
    "seed.bitcoin.sprovoost.nl.",
    "dnsseed.emzy.de.",
    "seed.bitcoin.wiz.biz.",
    "seed.mainnet.achownodes.xyz.",
];

/// Collect the bootstrap set from every configured source.
///
/// Unparseable entries are logged and skipped; duplicates are fine, the
/// frontier dedups. The returned set may be empty, which the caller
/// treats as a configuration error.
pub async fn bootstrap_addresses(args: &Args, default_port: u16) -> Vec<PeerAddress> {
    let mut addresses = Vec::new();

    for entry in &args.seeds {
        match entry.parse::<PeerAddress>() {
            Ok(address) => addresses.push(address),
            Err(e) => warn!("Skipping --seed entry '{entry}': {e}"),
        }
    }

    if let Some(path) = &args.seed_file {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let before = addresses.len();
                parse_seed_file(&contents, &mut addresses);
                info!(
                    "Read {} addresses from {}",
                    addresses.len() - before,
                    path.display()
                );
            }
            Err(e) => warn!("Could not read seed file {}: {e}", path.display()),
        }
    }

    if args.dns_seeds {
        addresses.extend(query_dns_seeds(default_port).await);
    }

    info!("Collected {} bootstrap addresses", addresses.len());
    addresses
}

fn parse_seed_file(contents: &str, addresses: &mut Vec<PeerAddress>) {
    for line in contents.lines() {
        let entry = line.split('#').next().unwrap_or_default().trim();
        if entry.is_empty() {
            continue;
        }
        match entry.parse::<PeerAddress>() {
            Ok(address) => addresses.push(address),
            Err(e) => warn!("Skipping seed file entry '{entry}': {e}"),
        }
    }
}

/// Resolve every DNS seed, collecting the advertised IP endpoints.
///
/// Seeds answer with a sample of reachable IPv4/IPv6 nodes on the
/// default port. A failing seed is logged and skipped; the others still
/// bootstrap the crawl.
async fn query_dns_seeds(default_port: u16) -> Vec<PeerAddress> {
    let mut addresses = Vec::new();
    for seed in DNS_SEEDS {
        match lookup_host((*seed, default_port)).await {
            Ok(resolved) => {
                let before = addresses.len();
                for socket_addr in resolved {
                    addresses.push(PeerAddress::from_ip(socket_addr.ip(), socket_addr.port()));
                }
                debug!("dns seed {seed}: {} addresses", addresses.len() - before);
            }
            Err(e) => warn!("Error resolving DNS seed {seed}: {e}"),
        }
    }
    info!("Discovered {} addresses via DNS seeds", addresses.len());
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_file_parsing_skips_comments_and_garbage() {
        let contents = "\
# prior crawl results
1.2.3.4:8333
[2001:db8::1]:8333  # a note
not-an-address
\n
10.0.0.1:8444
";
        let mut addresses = Vec::new();
        parse_seed_file(contents, &mut addresses);
        assert_eq!(
            addresses,
            vec![
                "1.2.3.4:8333".parse().unwrap(),
                "[2001:db8::1]:8333".parse().unwrap(),
                "10.0.0.1:8444".parse().unwrap(),
            ]
        );
    }
}
