//! In-memory datastore for single-process coordination.
//!
//! Handles opened on the same *universe* name share one key space, so
//! several participants inside one process can run a real election against
//! it. This is the backend the election-engine tests run on; embedders can
//! select it with datastore type `"memory"`, where the first configured
//! address names the universe.
//!
//! TTL expiry is enforced lazily on access and by a background sweeper that
//! emits the `Deleted` changes watchers would see from a real backend's
//! `expire` action. Watch delivery goes through an unbounded per-watcher
//! queue drained by a forwarder task into the bounded watch channel, so
//! store operations never block on slow subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use super::{watch_channel, Change, Datastore, DatastoreFactory, WatchStream, CLOSE_TIMEOUT};
use crate::config::Config;
use crate::error::{ElectorError, Result};

const SWEEP_PERIOD: Duration = Duration::from_millis(25);

static UNIVERSES: Lazy<Mutex<HashMap<String, Arc<Universe>>>> = Lazy::new(Mutex::default);

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(0);

struct Entry {
    value: String,
    expires_at: Instant,
}

struct Watcher {
    id: u64,
    key: String,
    tx: mpsc::UnboundedSender<Change>,
}

#[derive(Default)]
struct Universe {
    entries: Mutex<HashMap<String, Entry>>,
    watchers: Mutex<Vec<Watcher>>,
}

impl Universe {
    fn emit(&self, key: &str, change: Change) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.tx.is_closed());
        for watcher in watchers.iter().filter(|w| w.key == key) {
            let _ = watcher.tx.send(change.clone());
        }
    }

    /// Remove an entry that has passed its deadline, returning the expiry
    /// change to publish. Removal happens under the entries lock, so two
    /// callers cannot both observe the same expiry.
    fn expire_if_due(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<Change> {
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            let entry = entries.remove(key)?;
            return Some(Change::Deleted {
                prev_value: entry.value,
            });
        }
        None
    }

    fn sweep(&self, now: Instant) {
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|key, entry| {
                if entry.expires_at <= now {
                    expired.push((key.clone(), entry.value.clone()));
                    false
                } else {
                    true
                }
            });
        }
        for (key, prev_value) in expired {
            trace!(key = %key, "entry expired");
            self.emit(&key, Change::Deleted { prev_value });
        }
    }
}

struct WatchTask {
    id: u64,
    forwarder: JoinHandle<()>,
}

/// Handle onto a named in-memory universe.
pub struct MemoryDatastore {
    universe: Arc<Universe>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    watches: Mutex<Vec<WatchTask>>,
}

impl MemoryDatastore {
    /// Open a handle onto the named universe, creating it on first use.
    ///
    /// Must be called within a tokio runtime; each handle runs its own
    /// expiry sweeper.
    pub fn open(universe: impl Into<String>) -> Self {
        let universe = {
            let mut universes = UNIVERSES.lock();
            Arc::clone(universes.entry(universe.into()).or_default())
        };
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&universe)));
        Self {
            universe,
            sweeper: Mutex::new(Some(sweeper)),
            watches: Mutex::new(Vec::new()),
        }
    }

    fn release_watches(&self) -> Vec<WatchTask> {
        let watches: Vec<WatchTask> = self.watches.lock().drain(..).collect();
        if !watches.is_empty() {
            let ids: Vec<u64> = watches.iter().map(|w| w.id).collect();
            self.universe
                .watchers
                .lock()
                .retain(|w| !ids.contains(&w.id));
        }
        watches
    }
}

async fn sweep_loop(universe: Arc<Universe>) {
    let mut ticker = time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        universe.sweep(Instant::now());
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut events = Vec::new();
        let outcome = {
            let mut entries = self.universe.entries.lock();
            let now = Instant::now();
            if let Some(expiry) = Universe::expire_if_due(&mut entries, key, now) {
                events.push(expiry);
            }
            match entries.get(key) {
                Some(entry) => Err(ElectorError::key_exists("PutIfAbsent", &entry.value)),
                None => {
                    entries.insert(
                        key.to_string(),
                        Entry {
                            value: value.to_string(),
                            expires_at: now + ttl,
                        },
                    );
                    events.push(Change::Created {
                        new_value: value.to_string(),
                    });
                    Ok(())
                }
            }
        };
        for event in events {
            self.universe.emit(key, event);
        }
        outcome
    }

    async fn refresh_ttl(&self, key: &str, expected: &str, ttl: Duration) -> Result<()> {
        let mut events = Vec::new();
        let outcome = {
            let mut entries = self.universe.entries.lock();
            let now = Instant::now();
            if let Some(expiry) = Universe::expire_if_due(&mut entries, key, now) {
                events.push(expiry);
            }
            match entries.get_mut(key) {
                None => Err(ElectorError::key_not_found("RefreshTTL")),
                Some(entry) if entry.value != expected => {
                    Err(ElectorError::compare_failed("RefreshTTL"))
                }
                Some(entry) => {
                    // Refreshes reset the deadline without notifying watchers.
                    entry.expires_at = now + ttl;
                    Ok(())
                }
            }
        };
        for event in events {
            self.universe.emit(key, event);
        }
        outcome
    }

    async fn get(&self, key: &str) -> Result<String> {
        let mut events = Vec::new();
        let outcome = {
            let mut entries = self.universe.entries.lock();
            if let Some(expiry) = Universe::expire_if_due(&mut entries, key, Instant::now()) {
                events.push(expiry);
            }
            entries
                .get(key)
                .map(|entry| entry.value.clone())
                .ok_or_else(|| ElectorError::key_not_found("Get"))
        };
        for event in events {
            self.universe.emit(key, event);
        }
        outcome
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut events = Vec::new();
        let outcome = {
            let mut entries = self.universe.entries.lock();
            if let Some(expiry) = Universe::expire_if_due(&mut entries, key, Instant::now()) {
                events.push(expiry);
            }
            match entries.remove(key) {
                Some(entry) => {
                    events.push(Change::Deleted {
                        prev_value: entry.value,
                    });
                    Ok(())
                }
                None => Err(ElectorError::key_not_found("Del")),
            }
        };
        for event in events {
            self.universe.emit(key, event);
        }
        outcome
    }

    async fn compare_and_del(&self, key: &str, expected: &str) -> Result<()> {
        let mut events = Vec::new();
        let outcome = {
            let mut entries = self.universe.entries.lock();
            if let Some(expiry) = Universe::expire_if_due(&mut entries, key, Instant::now()) {
                events.push(expiry);
            }
            match entries.get(key) {
                None => Err(ElectorError::key_not_found("CompareAndDel")),
                Some(entry) if entry.value != expected => {
                    Err(ElectorError::compare_failed("CompareAndDel"))
                }
                Some(_) => {
                    if let Some(entry) = entries.remove(key) {
                        events.push(Change::Deleted {
                            prev_value: entry.value,
                        });
                    }
                    Ok(())
                }
            }
        };
        for event in events {
            self.universe.emit(key, event);
        }
        outcome
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (tx, stream) = watch_channel();
        let id = NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed);
        self.universe.watchers.lock().push(Watcher {
            id,
            key: key.to_string(),
            tx: raw_tx,
        });
        let forwarder = tokio::spawn(async move {
            while let Some(change) = raw_rx.recv().await {
                if !tx.notify(change).await {
                    break;
                }
            }
        });
        self.watches.lock().push(WatchTask { id, forwarder });
        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        for task in self.release_watches() {
            // The raw sender is gone, so the forwarder drains and ends on
            // its own unless the subscriber stopped consuming.
            if time::timeout(CLOSE_TIMEOUT, task.forwarder).await.is_err() {
                return Err(ElectorError::timeout("Close", CLOSE_TIMEOUT));
            }
        }
        Ok(())
    }
}

impl Drop for MemoryDatastore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        for task in self.release_watches() {
            task.forwarder.abort();
        }
    }
}

/// Factory for the `"memory"` datastore type. The first configured address
/// names the universe.
pub struct MemoryFactory;

#[async_trait]
impl DatastoreFactory for MemoryFactory {
    async fn create(&self, conf: &Config) -> Result<Box<dyn Datastore>> {
        let universe = conf.addresses.first().cloned().unwrap_or_default();
        if universe.is_empty() {
            return Err(ElectorError::invalid_argument(
                "addresses",
                universe,
                "a universe name for the in-memory datastore",
            ));
        }
        Ok(Box::new(MemoryDatastore::open(universe)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn universe(prefix: &str) -> String {
        format!(
            "{prefix}-{}",
            NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn next_change(stream: &mut WatchStream) -> Change {
        time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("change within window")
            .expect("stream alive")
            .expect("no terminal error")
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let ds = MemoryDatastore::open(universe("round-trip"));
        ds.put_if_absent("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(ds.get("cluster").await.unwrap(), "a:6379");

        let err = ds
            .put_if_absent("cluster", "b:6379", Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            ElectorError::KeyExists { current, .. } => assert_eq!(current, "a:6379"),
            other => panic!("expected KeyExists, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_is_absent() {
        let ds = MemoryDatastore::open(universe("expiry"));
        ds.put_if_absent("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();
        time::advance(Duration::from_secs(11)).await;
        let err = ds.get("cluster").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);

        // Slot is free again.
        ds.put_if_absent("cluster", "b:6379", Duration::from_secs(10))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_the_deadline() {
        let ds = MemoryDatastore::open(universe("refresh"));
        ds.put_if_absent("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();

        let err = ds
            .refresh_ttl("cluster", "b:6379", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompareFailed);

        time::advance(Duration::from_secs(6)).await;
        ds.refresh_ttl("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();

        // Past the original deadline but inside the refreshed one.
        time::advance(Duration::from_secs(6)).await;
        assert_eq!(ds.get("cluster").await.unwrap(), "a:6379");

        time::advance(Duration::from_secs(11)).await;
        let err = ds
            .refresh_ttl("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
    }

    #[tokio::test]
    async fn compare_and_del_requires_a_match() {
        let ds = MemoryDatastore::open(universe("cad"));

        let err = ds.compare_and_del("cluster", "a:6379").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);

        ds.put_if_absent("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();
        let err = ds.compare_and_del("cluster", "b:6379").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompareFailed);

        ds.compare_and_del("cluster", "a:6379").await.unwrap();
        assert_eq!(
            ds.get("cluster").await.unwrap_err().code(),
            ErrorCode::KeyNotFound
        );
    }

    #[tokio::test]
    async fn watch_reports_creation_and_deletion() {
        let ds = MemoryDatastore::open(universe("watch"));
        let mut stream = ds.watch("cluster").await.unwrap();

        ds.put_if_absent("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            next_change(&mut stream).await,
            Change::Created {
                new_value: "a:6379".into()
            }
        );

        ds.del("cluster").await.unwrap();
        assert_eq!(
            next_change(&mut stream).await,
            Change::Deleted {
                prev_value: "a:6379".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_is_invisible_to_watchers() {
        let ds = MemoryDatastore::open(universe("silent-refresh"));
        ds.put_if_absent("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();
        let mut stream = ds.watch("cluster").await.unwrap();

        ds.refresh_ttl("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(
            time::timeout(Duration::from_secs(2), stream.next())
                .await
                .is_err(),
            "refresh must not surface as a change"
        );

        // The stream is still live: a real mutation comes through.
        ds.compare_and_del("cluster", "a:6379").await.unwrap();
        assert_eq!(
            next_change(&mut stream).await,
            Change::Deleted {
                prev_value: "a:6379".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_reaches_watchers_as_deletion() {
        let ds = MemoryDatastore::open(universe("expire-event"));
        let mut stream = ds.watch("cluster").await.unwrap();

        ds.put_if_absent("cluster", "a:6379", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            next_change(&mut stream).await,
            Change::Created { .. }
        ));

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            next_change(&mut stream).await,
            Change::Deleted {
                prev_value: "a:6379".into()
            }
        );
    }

    #[tokio::test]
    async fn universes_share_state_by_name() {
        let name = universe("shared");
        let a = MemoryDatastore::open(name.clone());
        let b = MemoryDatastore::open(name);
        let elsewhere = MemoryDatastore::open(universe("isolated"));

        a.put_if_absent("cluster", "a:6379", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(b.get("cluster").await.unwrap(), "a:6379");
        assert_eq!(
            elsewhere.get("cluster").await.unwrap_err().code(),
            ErrorCode::KeyNotFound
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_watches() {
        let ds = MemoryDatastore::open(universe("close"));
        let mut stream = ds.watch("cluster").await.unwrap();

        ds.close().await.unwrap();
        ds.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
