//! Coordination-store port: the minimal primitive set required for fair,
//! safe single-leader election.
//!
//! The trait is deliberately small (conditional put with TTL, conditional
//! TTL refresh, compare-and-delete, and a watch stream) so it can be
//! implemented against any strongly-consistent K/V backend. The etcd v2
//! adapter is the reference implementation; an in-memory implementation for
//! single-process coordination lives in [`memory`].
//!
//! # Thread safety
//!
//! Implementations must be `Send + Sync`; a datastore handle is shared
//! between the election task and the participant that owns it.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{ElectorError, Result};

/// Watch deliveries are forwarded through a bounded channel of this
/// capacity. Bursts coalesce at the receiver, which is safe because watch
/// events are wake-up hints, never authoritative state.
pub const WATCH_CHANNEL_CAPACITY: usize = 1;

/// Bound on waiting for watch termination during [`Datastore::close`].
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// One observed mutation of a watched key.
///
/// `Created` carries only the new value, `Deleted` only the previous one,
/// `Updated` both. TTL refreshes never surface as changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Created { new_value: String },
    Updated { new_value: String, prev_value: String },
    Deleted { prev_value: String },
}

impl Change {
    pub fn new_value(&self) -> Option<&str> {
        match self {
            Change::Created { new_value } | Change::Updated { new_value, .. } => Some(new_value),
            Change::Deleted { .. } => None,
        }
    }

    pub fn prev_value(&self) -> Option<&str> {
        match self {
            Change::Updated { prev_value, .. } | Change::Deleted { prev_value } => Some(prev_value),
            Change::Created { .. } => None,
        }
    }
}

/// Build the two ends of a watch: the adapter keeps the [`WatchSender`] and
/// hands the [`WatchStream`] to the subscriber.
pub fn watch_channel() -> (WatchSender, WatchStream) {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    (WatchSender { tx }, WatchStream { rx })
}

/// Producer half of a watch. `notify` delivers changes in causal order;
/// `bye` delivers one terminal error and consumes the sender, so nothing can
/// follow it.
#[derive(Clone)]
pub struct WatchSender {
    tx: mpsc::Sender<Result<Change>>,
}

impl WatchSender {
    /// Deliver a change, waiting for the subscriber to drain the channel.
    /// Returns `false` once the subscriber is gone.
    pub async fn notify(&self, change: Change) -> bool {
        self.tx.send(Ok(change)).await.is_ok()
    }

    /// Deliver a terminal error and end the stream.
    pub async fn bye(self, err: ElectorError) {
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a watch: a causally-ordered stream of
/// `Result<Change, ElectorError>`. An `Err` item is terminal; `None` means
/// the producer went away without one (subscribers treat both the same).
pub struct WatchStream {
    rx: mpsc::Receiver<Result<Change>>,
}

impl WatchStream {
    pub async fn next(&mut self) -> Option<Result<Change>> {
        self.rx.recv().await
    }
}

/// Abstract coordination store. Every method is bounded by the per-request
/// deadline of the [`Config`] the store was built from.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Set `key` to `value` with expiration `ttl`, only if the key is
    /// absent.
    ///
    /// When the key is already held, fails with
    /// [`ElectorError::KeyExists`] carrying the holder's current value.
    /// Implementations that cannot atomically return the current value on
    /// conflict follow the conflict with a `get`; if that read finds the key
    /// gone (it expired in between), the whole operation is retried.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reset the expiration of `key` to `ttl` without changing its value,
    /// conditional on the current value equalling `expected`.
    ///
    /// Fails with `CompareFailed` on a value mismatch and `KeyNotFound` when
    /// the key is absent or expired. A successful refresh is invisible to
    /// watchers.
    async fn refresh_ttl(&self, key: &str, expected: &str, ttl: Duration) -> Result<()>;

    /// Current value of `key`; `KeyNotFound` when absent.
    async fn get(&self, key: &str) -> Result<String>;

    /// Unconditional delete. `KeyNotFound` when the key was already gone.
    async fn del(&self, key: &str) -> Result<()>;

    /// Delete `key` only if its current value equals `expected`; otherwise
    /// `CompareFailed` or `KeyNotFound`.
    async fn compare_and_del(&self, key: &str, expected: &str) -> Result<()>;

    /// Subscribe to changes of `key`.
    ///
    /// Backend actions translate to [`Change`] as: create → `Created`;
    /// set/update/compare-and-swap → `Updated`; delete/compare-and-delete/
    /// expire → `Deleted`. TTL refreshes are not reported. The stream ends
    /// with a terminal error on unrecoverable failure and is cancelled by
    /// [`close`](Datastore::close).
    async fn watch(&self, key: &str) -> Result<WatchStream>;

    /// Cancel any active watch and release backend resources, waiting at
    /// most [`CLOSE_TIMEOUT`] for watch termination (`Timeout` beyond
    /// that). Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Constructor for a datastore adapter, dispatched by
/// `Config::datastore_type` through the process-wide factory registry.
#[async_trait]
pub trait DatastoreFactory: Send + Sync {
    async fn create(&self, conf: &Config) -> Result<Box<dyn Datastore>>;
}
