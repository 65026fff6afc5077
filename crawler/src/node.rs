//! Per-node crawl sessions.
//!
//! One session takes an address through connect, handshake (with retries)
//! and the address-collection window, and condenses everything observed
//! into a [`NodeReport`]. Session-internal failures never escape as
//! errors; they become fields of the report.

use crate::config::Settings;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::Magic;
use log::debug;
use peer_census_connection::timeouts::TimeoutProfile;
use peer_census_connection::{
    Connection, ConnectionConfiguration, ConnectionError, Dialer, HandshakeSummary, PeerAddress,
    TcpConnection, Timeouts,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};

/// Everything a worker needs to run sessions.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub dialer: Arc<Dialer>,
    pub magic: Magic,
    pub configuration: ConnectionConfiguration,
    pub timeouts: Timeouts,
    /// Total connect+handshake attempts before giving up on a peer that
    /// accepted a connection at least once.
    pub handshake_attempts: u32,
    /// Total collection windows against a peer that returns no addresses.
    pub getaddr_attempts: u32,
}

impl SessionContext {
    pub fn new(dialer: Arc<Dialer>, magic: Magic, settings: &Settings) -> Self {
        SessionContext {
            dialer,
            magic,
            configuration: ConnectionConfiguration::non_listening(
                peer_census_connection::PROTOCOL_VERSION,
                settings.user_agent.clone(),
            ),
            timeouts: settings.timeouts,
            handshake_attempts: settings.handshake_attempts,
            getaddr_attempts: settings.getaddr_attempts,
        }
    }
}

/// One address learned during a collection window.
#[derive(Debug, Clone)]
pub struct AdvertisedAddress {
    /// The node that advertised the address.
    pub source: PeerAddress,
    /// Last-seen timestamp the source attached to the address.
    pub timestamp: u32,
    /// Services the source claims the address offers.
    pub services: u64,
    /// The advertised address itself.
    pub address: PeerAddress,
}

/// Everything one session learned about one node.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub address: PeerAddress,
    /// Unix timestamp of the session start.
    pub timestamp: i64,
    pub handshake_successful: bool,
    /// Connect+handshake attempts spent on this node.
    pub handshake_attempts: u32,
    pub protocol_version: Option<u32>,
    pub user_agent: Option<String>,
    pub services: Option<u64>,
    pub start_height: Option<i32>,
    pub latency_connect: Option<Duration>,
    pub latency_version_handshake: Option<Duration>,
    pub latency_verack_handshake: Option<Duration>,
    /// Number of addr/addrv2 messages received across all windows.
    pub num_addr_messages: u32,
    /// Number of address records received across all windows.
    pub num_addresses: u32,
    /// Offset of the first address message into its collection window.
    pub time_first_addr: Option<Duration>,
    /// Offset of the last address message into its collection window.
    pub time_last_addr: Option<Duration>,
    /// The address records themselves.
    pub advertised: Vec<AdvertisedAddress>,
}

impl NodeReport {
    fn new(address: PeerAddress) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time is before the Unix epoch")
            .as_secs() as i64;
        NodeReport {
            address,
            timestamp,
            handshake_successful: false,
            handshake_attempts: 0,
            protocol_version: None,
            user_agent: None,
            services: None,
            start_height: None,
            latency_connect: None,
            latency_version_handshake: None,
            latency_verack_handshake: None,
            num_addr_messages: 0,
            num_addresses: 0,
            time_first_addr: None,
            time_last_addr: None,
            advertised: Vec::new(),
        }
    }

    fn record_handshake(&mut self, summary: &HandshakeSummary) {
        self.protocol_version = Some(summary.remote.protocol_version);
        self.user_agent = Some(summary.remote.user_agent.clone());
        self.services = Some(summary.remote.services.to_u64());
        self.start_height = Some(summary.remote.start_height);
        self.latency_version_handshake = Some(summary.version_latency);
        self.latency_verack_handshake = Some(summary.verack_latency);
    }

    fn merge_window(&mut self, window: CollectionWindow) {
        self.num_addr_messages += window.messages;
        self.num_addresses += window.records.len() as u32;
        if self.time_first_addr.is_none() {
            self.time_first_addr = window.first;
        }
        self.time_last_addr = window.last.or(self.time_last_addr);
        self.advertised.extend(window.records);
    }
}

/// Result of one collection window.
#[derive(Debug, Default)]
struct CollectionWindow {
    messages: u32,
    records: Vec<AdvertisedAddress>,
    first: Option<Duration>,
    last: Option<Duration>,
    /// The stream died or desynchronized; no further windows make sense.
    fatal: bool,
}

/// Run a full session against one address.
///
/// The state machine: connect and handshake with up to
/// `handshake_attempts` fresh streams (a first-attempt connect failure is
/// terminal, the node is plainly unreachable), then issue `getaddr` and
/// collect addresses for up to the getaddr window, repeating the window on
/// a fresh connection up to `getaddr_attempts` times if it stays empty.
/// The stream is dropped (closed) on every exit path.
pub async fn crawl_node(address: PeerAddress, ctx: &SessionContext) -> NodeReport {
    let profile = *ctx.timeouts.profile(address.network());
    let mut report = NodeReport::new(address.clone());

    let mut connection = None;
    for attempt in 1..=ctx.handshake_attempts.max(1) {
        report.handshake_attempts = attempt;

        let connect_started = Instant::now();
        let mut candidate = match TcpConnection::dial(
            address.clone(),
            ctx.magic,
            ctx.configuration.clone(),
            &ctx.dialer,
            profile.connect,
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                debug!("Could not connect to {address}: {e}");
                if attempt == 1 {
                    // Never answered at all: unreachable.
                    return report;
                }
                continue;
            }
        };
        report.latency_connect = Some(connect_started.elapsed());

        match candidate.handshake(profile.message).await {
            Ok(summary) => {
                debug!(
                    "Handshake attempt {attempt}/{} with {address} successful",
                    ctx.handshake_attempts
                );
                report.record_handshake(&summary);
                connection = Some(candidate);
                break;
            }
            Err(e) => {
                debug!(
                    "Handshake attempt {attempt}/{} with {address} failed: {e}",
                    ctx.handshake_attempts
                );
                // The failed stream is dropped before the next attempt
                // dials a fresh one.
            }
        }
    }

    let Some(mut connection) = connection else {
        // Reachable, but no completed handshake within the allowed attempts.
        return report;
    };
    report.handshake_successful = true;

    for attempt in 1..=ctx.getaddr_attempts.max(1) {
        if attempt > 1 {
            debug!(
                "Collection attempt {attempt}/{} for {address} on a fresh connection",
                ctx.getaddr_attempts
            );
            drop(connection);
            connection = match redial(&report.address, ctx, &profile).await {
                Some(fresh) => fresh,
                None => break,
            };
        }

        let window = collect_addresses(&mut connection, &profile).await;
        let fatal = window.fatal;
        report.merge_window(window);

        if !report.advertised.is_empty() || fatal {
            break;
        }
    }

    debug!(
        "Session with {address} done: {} addresses in {} messages",
        report.num_addresses, report.num_addr_messages
    );
    report
}


/// One-shot dial and handshake for a collection retry.
async fn redial(
    address: &PeerAddress,
    ctx: &SessionContext,
    profile: &TimeoutProfile,
) -> Option<TcpConnection> {
    let mut connection = match TcpConnection::dial(
        address.clone(),
        ctx.magic,
        ctx.configuration.clone(),
        &ctx.dialer,
        profile.connect,
    )
    .await
    {
        Ok(connection) => connection,
        Err(e) => {
            debug!("Reconnect to {address} failed: {e}");
            return None;
        }
    };
    match connection.handshake(profile.message).await {
        Ok(_) => Some(connection),
        Err(e) => {
            debug!("Reconnect handshake with {address} failed: {e}");
            None
        }
    }
}

/// Run one collection window: send `getaddr`, then accumulate every
/// addr/addrv2 record until the window closes.
///
/// The window runs for up to the getaddr timeout. A single-message
/// timeout inside the window only ends it early when records have already
/// arrived; a mute peer costs the full window. Pings are answered, other
/// commands ignored, codec errors end the session.
async fn collect_addresses<R, W>(
    connection: &mut Connection<R, W>,
    profile: &TimeoutProfile,
) -> CollectionWindow
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let source = connection.peer().clone();
    let mut window = CollectionWindow::default();

    if let Err(e) = connection.write(NetworkMessage::GetAddr).await {
        debug!("Error sending getaddr to {source}: {e}");
        window.fatal = true;
        return window;
    }
    debug!("Sent getaddr to {source}");

    let started = Instant::now();
    loop {
        let Some(remaining) = profile.getaddr.checked_sub(started.elapsed()) else {
            break;
        };
        let deadline = remaining.min(profile.message);

        match connection.read_timeout(deadline).await {
            Ok(NetworkMessage::Addr(entries)) => {
                debug!("Received {} addresses from {source}", entries.len());
                let offset = started.elapsed();
                window.messages += 1;
                window.first.get_or_insert(offset);
                window.last = Some(offset);
                for (timestamp, entry) in entries {
                    // Undecodable legacy entries are dropped, the message
                    // itself stays valid.
                    let Ok(socket_addr) = entry.socket_addr() else {
                        continue;
                    };
                    window.records.push(AdvertisedAddress {
                        source: source.clone(),
                        timestamp,
                        services: entry.services.to_u64(),
                        address: PeerAddress::from_ip(socket_addr.ip(), socket_addr.port()),
                    });
                }
            }
            Ok(NetworkMessage::AddrV2(entries)) => {
                debug!("Received {} addresses from {source} (v2 format)", entries.len());
                let offset = started.elapsed();
                window.messages += 1;
                window.first.get_or_insert(offset);
                window.last = Some(offset);
                for entry in entries {
                    match PeerAddress::new(entry.addr, entry.port) {
                        Ok(address) => window.records.push(AdvertisedAddress {
                            source: source.clone(),
                            timestamp: entry.time,
                            services: entry.services.to_u64(),
                            address,
                        }),
                        Err(e) => {
                            debug!("Skipping advertised address from {source}: {e}");
                        }
                    }
                }
            }
            Ok(NetworkMessage::Ping(nonce)) => {
                if let Err(e) = connection.write(NetworkMessage::Pong(nonce)).await {
                    debug!("Error answering ping from {source}: {e}");
                    window.fatal = true;
                    break;
                }
            }
            Ok(other) => {
                debug!("Ignoring {} message from {source}", other.command());
            }
            Err(ConnectionError::MessageTimeout) => {
                // Quiet for a whole message window. With records in hand
                // the peer has answered and the window is done; without,
                // keep listening until the window itself lapses.
                if !window.records.is_empty() {
                    break;
                }
            }
            Err(e) => {
                debug!("Error while collecting addresses from {source}: {e}");
                window.fatal = true;
                break;
            }
        }
    }

    window
}
