//! The shared frontier of addresses still to probe.
//!
//! The frontier owns two sets: `seen`, every address ever offered, and
//! `pending`, the FIFO of addresses waiting for a worker. The dedup
//! decision and the enqueue happen under one lock, so an address flows
//! through `seen` exactly once no matter how many peers advertise it.

use log::debug;
use peer_census_connection::PeerAddress;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct FrontierState {
    seen: HashSet<PeerAddress>,
    pending: VecDeque<PeerAddress>,
    /// Addresses taken but not yet completed by a worker.
    active: usize,
    closed: bool,
}

/// Deduplicated work queue shared by every worker.
///
/// `offer` and `take` are linearizable: the mutex covers both sets, and
/// `seen` only ever grows during a crawl. After [`Frontier::close`],
/// remaining pending addresses still drain to takers; after
/// [`Frontier::abort`] they do not.
///
/// The frontier also tracks how many taken addresses are still being
/// processed. A taken address must be balanced with [`Frontier::complete`];
/// the crawl is quiesced when the last active worker completes against an
/// empty queue, and the frontier closes itself at that point. Keeping the
/// latch under the queue lock means a worker that has just taken the last
/// address can never be mistaken for an idle one.
#[derive(Debug)]
pub struct Frontier {
    state: Mutex<FrontierState>,
    /// Wakes takers when an address arrives or the frontier closes.
    notify: Notify,
}

impl Frontier {
    pub fn new() -> Self {
        Frontier {
            state: Mutex::new(FrontierState {
                seen: HashSet::new(),
                pending: VecDeque::new(),
                active: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Offer an address for crawling.
    ///
    /// Returns true if the address was never seen before and is now
    /// pending; false if it is a duplicate or the frontier is closed.
    pub fn offer(&self, address: PeerAddress) -> bool {
        let mut state = self.state.lock().expect("frontier lock poisoned");
        if state.closed {
            return false;
        }
        if !state.seen.insert(address.clone()) {
            return false;
        }
        state.pending.push_back(address);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Take the next pending address, waiting until one is available.
    ///
    /// Returns `None` once the frontier is closed and drained. Safe to
    /// race from many workers.
    pub async fn take(&self) -> Option<PeerAddress> {
        loop {
            // Register interest before checking state so a concurrent
            // offer/close cannot slip between the check and the wait.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("frontier lock poisoned");
                if let Some(address) = state.pending.pop_front() {
                    state.active += 1;
                    // Pass the wakeup along in case more work remains.
                    if !state.pending.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(address);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Balance a successful [`Frontier::take`] once the worker is done
    /// with the address.
    ///
    /// When the completing worker was the last one active and nothing is
    /// pending, the crawl is quiesced and the frontier closes itself.
    pub fn complete(&self) {
        let mut state = self.state.lock().expect("frontier lock poisoned");
        debug_assert!(state.active > 0, "complete without matching take");
        state.active = state.active.saturating_sub(1);
        if state.active == 0 && state.pending.is_empty() && !state.closed {
            state.closed = true;
            drop(state);
            self.notify.notify_waiters();
            debug!("Frontier quiesced");
        }
    }

    /// Refuse further offers and let takers drain what is pending.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("frontier lock poisoned");
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        debug!("Frontier closed");
    }

    /// Cancel outstanding work: refuse offers and drop pending addresses.
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("frontier lock poisoned");
        state.closed = true;
        let dropped = state.pending.len();
        state.pending.clear();
        drop(state);
        self.notify.notify_waiters();
        debug!("Frontier aborted, dropped {dropped} pending addresses");
    }

    /// Number of unique addresses ever offered.
    pub fn seen_len(&self) -> usize {
        self.state.lock().expect("frontier lock poisoned").seen.len()
    }

    /// Number of addresses awaiting a worker.
    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .expect("frontier lock poisoned")
            .pending
            .len()
    }

    /// Number of addresses taken but not yet completed.
    pub fn active_len(&self) -> usize {
        self.state.lock().expect("frontier lock poisoned").active
    }
}

impl Default for Frontier {
    fn default() -> Self {
        Self::new()
    }
}
