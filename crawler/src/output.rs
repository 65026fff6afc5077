//! CSV result sinks.
//!
//! Each crawl writes two append-only CSV files into its result directory:
//! one row per probed node, and (when enabled) one row per advertised
//! address learned from a sampled node. Workers hand records to the sinks
//! over bounded channels; a slow disk backpressures the workers, and a
//! write error closes the channel, which cancels the crawl.

use crate::node::{AdvertisedAddress, NodeReport};
use log::{debug, error};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// File name of the per-node result stream.
pub const REACHABLE_NODES_FILE: &str = "reachable_nodes.csv";
/// File name of the advertised-address result stream.
pub const ADVERTISED_ADDRESSES_FILE: &str = "advertised_addresses.csv";

const REACHABLE_NODES_HEADER: &str = "timestamp,address,port,network,handshake_successful,\
    protocol_version,user_agent,services,start_height,latency_connect,\
    latency_version_handshake,latency_verack_handshake,num_addr_messages,\
    num_addresses,time_first_addr,time_last_addr";

const ADVERTISED_ADDRESSES_HEADER: &str = "source_address,source_port,source_network,\
    advertised_timestamp,advertised_services,advertised_address,advertised_port,\
    advertised_network";

/// Records the workers can append while the crawl runs.
pub trait CsvRecord: Send + 'static {
    fn header() -> &'static str;
    fn to_row(&self) -> String;
}

/// Quote a CSV field if it contains a separator, quote or newline.
///
/// User agents are peer-controlled text, so the node stream cannot assume
/// clean fields.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn millis(duration: Option<Duration>) -> String {
    duration
        .map(|d| d.as_millis().to_string())
        .unwrap_or_default()
}

fn optional<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(T::to_string).unwrap_or_default()
}

impl CsvRecord for NodeReport {
    fn header() -> &'static str {
        REACHABLE_NODES_HEADER
    }

    fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.timestamp,
            csv_field(&self.address.host()),
            self.address.port(),
            self.address.network(),
            self.handshake_successful,
            optional(&self.protocol_version),
            csv_field(self.user_agent.as_deref().unwrap_or_default()),
            optional(&self.services),
            optional(&self.start_height),
            millis(self.latency_connect),
            millis(self.latency_version_handshake),
            millis(self.latency_verack_handshake),
            self.num_addr_messages,
            self.num_addresses,
            millis(self.time_first_addr),
            millis(self.time_last_addr),
        )
    }
}

impl CsvRecord for AdvertisedAddress {
    fn header() -> &'static str {
        ADVERTISED_ADDRESSES_HEADER
    }

    fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            csv_field(&self.source.host()),
            self.source.port(),
            self.source.network(),
            self.timestamp,
            self.services,
            csv_field(&self.address.host()),
            self.address.port(),
            self.address.network(),
        )
    }
}

/// A running sink task plus the sender side workers append to.
pub struct Sink<T> {
    pub tx: mpsc::Sender<T>,
    pub task: JoinHandle<std::io::Result<()>>,
    pub path: PathBuf,
}

/// Spawn a sink writing `T` records to `path`.
///
/// The task writes the header immediately, then appends one row per
/// received record until every sender is dropped. An I/O error ends the
/// task; the dropped receiver then surfaces the failure to the workers as
/// send errors.
pub fn spawn_sink<T: CsvRecord>(directory: &Path, file_name: &str) -> Sink<T> {
    let path = directory.join(file_name);
    let (tx, mut rx) = mpsc::channel::<T>(1024);

    let task_path = path.clone();
    let task = tokio::spawn(async move {
        let file = File::create(&task_path).await?;
        let mut writer = BufWriter::new(file);
        writer.write_all(T::header().as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut rows: u64 = 0;
        while let Some(record) = rx.recv().await {
            writer.write_all(record.to_row().as_bytes()).await?;
            writer.write_all(b"\n").await?;
            rows += 1;
        }
        writer.flush().await?;
        debug!("Wrote {rows} rows to {}", task_path.display());
        Ok(())
    });

    Sink { tx, task, path }
}

impl<T> Sink<T> {
    /// Wait for the sink task after dropping the last sender.
    pub async fn finish(self) -> std::io::Result<()> {
        drop(self.tx);
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Sink task for {} panicked: {e}", self.path.display());
                Err(std::io::Error::other(e))
            }
        }
    }
}
