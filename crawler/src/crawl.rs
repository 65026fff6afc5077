//! The crawl itself: a fixed worker pool draining the frontier.
//!
//! Workers take addresses, run node sessions, feed fresh advertised
//! addresses back into the frontier, and append results to the sinks.
//! The controller offers the bootstrap set, watches progress, and closes
//! the sinks once the frontier is quiesced and every worker has returned.

use crate::config::Settings;
use crate::frontier::Frontier;
use crate::node::{crawl_node, AdvertisedAddress, NodeReport, SessionContext};
use crate::output::{
    spawn_sink, Sink, ADVERTISED_ADDRESSES_FILE, REACHABLE_NODES_FILE,
};
use log::{debug, error, info};
use peer_census_connection::{Dialer, PeerAddress};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

/// Fatal crawl failures.
///
/// Session-level trouble never surfaces here; losing a result sink is the
/// one thing that aborts a crawl.
#[derive(Debug)]
pub enum CrawlError {
    /// A result sink could not be created or written.
    Sink(std::io::Error),
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlError::Sink(e) => write!(f, "result sink failed: {e}"),
        }
    }
}

impl std::error::Error for CrawlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlError::Sink(e) => Some(e),
        }
    }
}

/// Counters reported when a crawl completes.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    /// Addresses taken from the frontier and probed.
    pub processed: u64,
    /// Nodes that completed the handshake.
    pub reachable: u64,
    /// Nodes that never connected or never finished the handshake.
    pub unreachable: u64,
    /// Unique addresses that entered the frontier.
    pub seen: usize,
    pub runtime: Duration,
}

/// State shared between the workers and the monitor.
struct WorkerShared {
    frontier: Frontier,
    context: SessionContext,
    node_tx: mpsc::Sender<NodeReport>,
    addr_tx: Option<mpsc::Sender<AdvertisedAddress>>,
    /// Seeded RNG behind the per-node sampling decision.
    rng: Mutex<StdRng>,
    node_share: f64,
    /// Advertised addresses older than this are recorded but not crawled.
    addr_age_limit: Duration,
    processed: AtomicU64,
    reachable: AtomicU64,
}

/// A single crawl of the network.
pub struct Crawler {
    settings: Settings,
}

impl Crawler {
    pub fn new(settings: Settings) -> Self {
        Crawler { settings }
    }

    /// Run the crawl to completion.
    ///
    /// The bootstrap addresses enter the frontier like any other
    /// candidate. The call returns once the reachable graph is exhausted
    /// under the configured timeouts and both sinks are flushed.
    pub async fn run(&self, bootstrap: Vec<PeerAddress>) -> Result<CrawlSummary, CrawlError> {
        let started = Instant::now();
        let settings = &self.settings;

        tokio::fs::create_dir_all(&settings.result_dir)
            .await
            .map_err(CrawlError::Sink)?;

        let node_sink: Sink<NodeReport> = spawn_sink(&settings.result_dir, REACHABLE_NODES_FILE);
        let addr_sink: Option<Sink<AdvertisedAddress>> = settings
            .record_addr_data
            .then(|| spawn_sink(&settings.result_dir, ADVERTISED_ADDRESSES_FILE));

        let dialer = Arc::new(Dialer::new(settings.tor_proxy, settings.i2p_sam));
        let shared = Arc::new(WorkerShared {
            frontier: Frontier::new(),
            context: SessionContext::new(dialer, settings.network.magic(), settings),
            node_tx: node_sink.tx.clone(),
            addr_tx: addr_sink.as_ref().map(|sink| sink.tx.clone()),
            rng: Mutex::new(StdRng::seed_from_u64(settings.sample_seed)),
            node_share: settings.node_share,
            addr_age_limit: settings.addr_age_limit,
            processed: AtomicU64::new(0),
            reachable: AtomicU64::new(0),
        });

        let mut offered = 0;
        for address in bootstrap {
            if shared.frontier.offer(address) {
                offered += 1;
            }
        }
        info!("Bootstrapped frontier with {offered} unique addresses");
        if offered == 0 {
            // Nothing to do; let the workers drain out immediately.
            shared.frontier.close();
        }

        let workers: Vec<_> = (0..settings.num_workers.max(1))
            .map(|id| {
                let shared = shared.clone();
                tokio::spawn(async move { worker_loop(id, shared).await })
            })
            .collect();

        let (monitor_stop_tx, monitor_stop_rx) = mpsc::channel::<()>(1);
        let monitor = tokio::spawn(monitor_loop(shared.clone(), started, monitor_stop_rx));

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {e}");
            }
        }
        drop(monitor_stop_tx);
        let _ = monitor.await;

        let summary = CrawlSummary {
            processed: shared.processed.load(Ordering::Relaxed),
            reachable: shared.reachable.load(Ordering::Relaxed),
            unreachable: shared.processed.load(Ordering::Relaxed)
                - shared.reachable.load(Ordering::Relaxed),
            seen: shared.frontier.seen_len(),
            runtime: started.elapsed(),
        };

        // Senders inside `shared` must drop before the sinks can drain.
        drop(shared);
        node_sink.finish().await.map_err(CrawlError::Sink)?;
        if let Some(sink) = addr_sink {
            sink.finish().await.map_err(CrawlError::Sink)?;
        }

        Ok(summary)
    }
}

/// One worker: take, probe, feed back, record, repeat.
async fn worker_loop(id: usize, shared: Arc<WorkerShared>) {
    debug!("Worker {id} started");
    while let Some(address) = shared.frontier.take().await {
        let outcome = process_address(address, &shared).await;

        // Balancing the take arms the quiescence latch: the frontier
        // closes itself once the last active worker completes against an
        // empty queue.
        shared.frontier.complete();

        if outcome.is_err() {
            // A sink is gone; the crawl is cancelled.
            shared.frontier.abort();
            break;
        }
    }
    debug!("Worker {id} exiting");
}

/// Marker for a closed sink; the record content is irrelevant.
struct SinkClosed;

impl<T> From<SendError<T>> for SinkClosed {
    fn from(_: SendError<T>) -> Self {
        SinkClosed
    }
}

async fn process_address(
    address: PeerAddress,
    shared: &WorkerShared,
) -> Result<(), SinkClosed> {
    // The sampling decision is drawn at take time from the seeded RNG, so
    // a fixed seed reproduces which nodes get their addresses recorded.
    let sampled = {
        let mut rng = shared.rng.lock().expect("sampling rng lock poisoned");
        rng.gen::<f64>() < shared.node_share
    };

    let mut report = crawl_node(address, &shared.context).await;
    shared.processed.fetch_add(1, Ordering::Relaxed);
    if report.handshake_successful {
        shared.reachable.fetch_add(1, Ordering::Relaxed);
    }

    let advertised = std::mem::take(&mut report.advertised);

    // Grow the frontier from every reachable node, skipping addresses the
    // peer itself has not seen alive recently; those are recorded but
    // rarely worth a connection attempt.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the Unix epoch")
        .as_secs();
    let freshness_floor = now.saturating_sub(shared.addr_age_limit.as_secs());
    let mut fresh = 0;
    for record in &advertised {
        if u64::from(record.timestamp) >= freshness_floor
            && shared.frontier.offer(record.address.clone())
        {
            fresh += 1;
        }
    }
    if !advertised.is_empty() {
        debug!(
            "Offered {fresh} of {} addresses advertised by {}",
            advertised.len(),
            report.address
        );
    }

    if sampled {
        if let Some(addr_tx) = &shared.addr_tx {
            for record in advertised {
                addr_tx.send(record).await?;
            }
        }
    }

    shared.node_tx.send(report).await?;
    Ok(())
}

/// Log crawl progress every five seconds until the controller stops it.
async fn monitor_loop(
    shared: Arc<WorkerShared>,
    started: Instant,
    mut stop: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                info!(
                    "[status] elapsed: {:.1}h, processed: {}, reachable: {}, pending: {}, busy: {}",
                    started.elapsed().as_secs_f64() / 3600.0,
                    shared.processed.load(Ordering::Relaxed),
                    shared.reachable.load(Ordering::Relaxed),
                    shared.frontier.pending_len(),
                    shared.frontier.active_len(),
                );
            }
            _ = stop.recv() => {
                break;
            }
        }
    }
}
