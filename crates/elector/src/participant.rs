//! The election participant and its background engine.
//!
//! A [`Participant`] owns one datastore handle and at most one background
//! election task. The task is the only writer of participant state: it
//! competes for the leader key on a periodic tick, refreshes the key's TTL
//! while leading, and uses watch events purely as wake-up hints.
//! Authoritative state always comes from a fresh store round trip on the
//! next evaluation.

use std::future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use elector_types::config::Config;
use elector_types::error::{ElectorError, Result};
use elector_types::membership::{Candidate, Membership, Role};
use elector_types::ports::{Change, Datastore, WatchStream};

use crate::registry;

/// Bound on waiting for engine teardown during [`Participant::exit`].
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared between a participant and its engine. The engine is the
/// only writer of ordinary transitions; `exit()` claims the terminal state
/// with an atomic swap, and engine-side writes never overwrite it.
#[derive(Debug)]
struct Shared {
    role: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            role: AtomicU8::new(Role::NotAMember.as_u8()),
        }
    }

    fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    fn swap_role(&self, next: Role) -> Role {
        Role::from_u8(self.role.swap(next.as_u8(), Ordering::AcqRel))
    }

    fn set_role(&self, next: Role) {
        let mut current = self.role.load(Ordering::Acquire);
        while Role::from_u8(current) != Role::Dead {
            match self.role.compare_exchange_weak(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// One member of a named election.
///
/// Construct with [`Participant::new`] or [`Participant::from_config`],
/// enter the election with [`join`](Participant::join), and leave it with
/// [`exit`](Participant::exit). Dropping a participant without exiting
/// still winds the engine down.
pub struct Participant {
    conf: Config,
    store: Arc<dyn Datastore>,
    endpoint: OnceCell<String>,
    shared: Arc<Shared>,
    quit: CancellationToken,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl Participant {
    /// Participant with the stock defaults (etcd v2 backend, 500 ms request
    /// deadline, 30 s leader TTL).
    pub async fn new(name: impl Into<String>, addresses: Vec<String>) -> Result<Self> {
        Self::from_config(Config::new(name, addresses)).await
    }

    pub async fn from_config(conf: Config) -> Result<Self> {
        let store = registry::create_datastore(&conf).await?;
        Ok(Self {
            conf,
            store: Arc::from(store),
            endpoint: OnceCell::new(),
            shared: Arc::new(Shared::new()),
            quit: CancellationToken::new(),
            engine: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    /// Enter the election as `endpoint`, driving `candidate` through role
    /// transitions from a background task. A participant joins at most once
    /// per lifetime; call from within a tokio runtime.
    pub fn join(&self, endpoint: impl Into<String>, candidate: impl Candidate + 'static) -> Result<()> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(ElectorError::invalid_argument(
                "endpoint",
                endpoint,
                "non-empty endpoint identifier, typically host:port",
            ));
        }
        if self.shared.role() == Role::Dead {
            return Err(ElectorError::invalid_argument(
                "participant",
                &self.conf.name,
                "a live participant; this one has exited",
            ));
        }
        if self.endpoint.set(endpoint.clone()).is_err() {
            return Err(ElectorError::invalid_argument(
                "endpoint",
                endpoint,
                format!(
                    "an unjoined participant; already joined as {:?}",
                    self.endpoint.get().map(String::as_str).unwrap_or_default()
                ),
            ));
        }
        let engine = Engine {
            conf: self.conf.clone(),
            endpoint,
            store: Arc::clone(&self.store),
            candidate: Box::new(candidate),
            shared: Arc::clone(&self.shared),
            quit: self.quit.clone(),
            known_leader: String::new(),
        };
        *self.engine.lock() = Some(tokio::spawn(engine.run()));
        Ok(())
    }

    /// Current leader endpoint, read from the store rather than from
    /// internal state, so it is race-free with the engine.
    pub async fn leader(&self) -> Result<String> {
        self.store.get(&self.conf.name).await
    }

    /// Last role observed by the engine. Diagnostic; the authoritative
    /// transition stream is the candidate callback.
    pub fn role(&self) -> Role {
        self.shared.role()
    }

    /// Leave the election. Idempotent: the first call tears the engine down
    /// (which surrenders the leader key with one best-effort
    /// compare-and-delete and closes the store); later calls are no-ops.
    /// Returns `Timeout` if teardown exceeds ten seconds, with the
    /// participant still marked dead.
    pub async fn exit(&self) -> Result<()> {
        if self.shared.swap_role(Role::Dead) == Role::Dead {
            return Ok(());
        }
        self.quit.cancel();
        let engine = self.engine.lock().take();
        match engine {
            Some(handle) => match time::timeout(EXIT_TIMEOUT, handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    warn!(name = %self.conf.name, error = %err, "election task ended abnormally");
                    Ok(())
                }
                Err(_) => Err(ElectorError::timeout("Exit", EXIT_TIMEOUT)),
            },
            None => {
                // Never joined: no key to surrender, just release the store.
                if let Err(err) = self.store.close().await {
                    warn!(name = %self.conf.name, error = %err, "datastore close failed");
                }
                Ok(())
            }
        }
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.quit.cancel();
    }
}

/// The background election task. Single-threaded with respect to
/// participant state: every transition happens here.
struct Engine {
    conf: Config,
    endpoint: String,
    store: Arc<dyn Datastore>,
    candidate: Box<dyn Candidate>,
    shared: Arc<Shared>,
    quit: CancellationToken,
    /// The leader last reported to the candidate; our own endpoint while
    /// leading, empty while not a member.
    known_leader: String,
}

impl Engine {
    async fn run(mut self) {
        info!(
            name = %self.conf.name,
            endpoint = %self.endpoint,
            candidate = %self.candidate,
            "election task started"
        );
        let period = self.conf.tick_period();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watch = self.subscribe().await;
        let mut resubscribe_at = match watch {
            Some(_) => None,
            None => Some(time::Instant::now() + self.conf.master_down_after),
        };

        'election: loop {
            match self.shared.role() {
                Role::NotAMember | Role::Follower => self.join_election().await,
                Role::Leader => self.refresh_leadership().await,
                Role::Dead => break 'election,
            }

            // Park until something warrants another evaluation.
            'parked: loop {
                tokio::select! {
                    _ = self.quit.cancelled() => break 'election,
                    _ = ticker.tick() => break 'parked,
                    item = next_watch_item(&mut watch) => match item {
                        Some(Ok(change)) => {
                            if self.is_wakeup(&change) {
                                debug!(name = %self.conf.name, change = ?change, "watch hint");
                                break 'parked;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(
                                name = %self.conf.name,
                                error = %err,
                                "watch lost, resubscribing after the TTL window"
                            );
                            watch = None;
                            resubscribe_at =
                                Some(time::Instant::now() + self.conf.master_down_after);
                        }
                        None => {
                            warn!(
                                name = %self.conf.name,
                                "watch stream ended, resubscribing after the TTL window"
                            );
                            watch = None;
                            resubscribe_at =
                                Some(time::Instant::now() + self.conf.master_down_after);
                        }
                    },
                    _ = sleep_until_opt(resubscribe_at) => {
                        resubscribe_at = None;
                        watch = self.subscribe().await;
                        if watch.is_none() {
                            resubscribe_at =
                                Some(time::Instant::now() + self.conf.master_down_after);
                        }
                    }
                }
            }
        }

        // Release the subscription before teardown so the adapter's watch
        // machinery is not left waiting on a consumer that will never read.
        drop(watch);
        self.shutdown().await;
    }

    /// Watch events are hints, not state: anything that does not contradict
    /// what we already believe is ignored, which also filters the echoes of
    /// our own writes.
    fn is_wakeup(&self, change: &Change) -> bool {
        match change.new_value() {
            Some(new_value) => new_value != self.known_leader,
            None => true,
        }
    }

    async fn subscribe(&self) -> Option<WatchStream> {
        match self.store.watch(&self.conf.name).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(name = %self.conf.name, error = %err, "failed to watch the leader key");
                None
            }
        }
    }

    /// `NotAMember`/`Follower` evaluation: compete for the leader key.
    async fn join_election(&mut self) {
        let ttl = self.conf.master_down_after;
        match self
            .store
            .put_if_absent(&self.conf.name, &self.endpoint, ttl)
            .await
        {
            Ok(()) => self.lead().await,
            Err(ElectorError::KeyExists { current, .. }) => {
                if current == self.endpoint {
                    // The store still carries our own registration, e.g.
                    // after a dropped watch; resume leadership instead of
                    // following our own shadow.
                    self.lead().await
                } else {
                    self.follow(current).await
                }
            }
            Err(err) => {
                warn!(name = %self.conf.name, error = %err, "election attempt failed");
                self.resign().await;
            }
        }
    }

    /// `Leader` evaluation: keep the key alive. Any failure demotes;
    /// retrying in place could hide a leadership change behind a flaky
    /// store.
    async fn refresh_leadership(&mut self) {
        match self
            .store
            .refresh_ttl(&self.conf.name, &self.endpoint, self.conf.master_down_after)
            .await
        {
            Ok(()) => trace!(name = %self.conf.name, "leadership refreshed"),
            Err(err) if err.is_expected_race() => {
                info!(name = %self.conf.name, error = %err, "leadership lost");
                self.resign().await;
            }
            Err(err) => {
                warn!(name = %self.conf.name, error = %err, "leadership refresh failed, stepping down");
                self.resign().await;
            }
        }
    }

    async fn lead(&mut self) {
        self.shared.set_role(Role::Leader);
        self.known_leader = self.endpoint.clone();
        match self.candidate.update_membership(Membership::Leader).await {
            Ok(()) => {
                info!(name = %self.conf.name, candidate = %self.candidate, "elected as leader");
            }
            Err(err) => {
                warn!(
                    name = %self.conf.name,
                    candidate = %self.candidate,
                    error = %err,
                    "candidate refused leadership, surrendering the slot"
                );
                match self
                    .store
                    .compare_and_del(&self.conf.name, &self.endpoint)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_expected_race() => {
                        info!(name = %self.conf.name, error = %err, "leader slot already gone");
                    }
                    Err(err) => {
                        warn!(name = %self.conf.name, error = %err, "failed to surrender the leader slot");
                    }
                }
                self.resign().await;
            }
        }
    }

    async fn follow(&mut self, leader: String) {
        if self.shared.role() == Role::Follower && self.known_leader == leader {
            // Same leader as last reported; do not re-notify.
            return;
        }
        self.shared.set_role(Role::Follower);
        self.known_leader = leader.clone();
        match self
            .candidate
            .update_membership(Membership::Follower {
                leader: leader.clone(),
            })
            .await
        {
            Ok(()) => {
                info!(name = %self.conf.name, candidate = %self.candidate, leader = %leader, "following leader");
            }
            Err(err) => {
                warn!(
                    name = %self.conf.name,
                    candidate = %self.candidate,
                    error = %err,
                    "candidate refused to follow"
                );
                self.resign().await;
            }
        }
    }

    /// Drop back to `NotAMember` and tell the candidate. A candidate that
    /// refuses even that leaves nothing to fall back to; treat it as a
    /// fatal misconfiguration.
    async fn resign(&mut self) {
        self.shared.set_role(Role::NotAMember);
        self.known_leader.clear();
        if let Err(err) = self.candidate.update_membership(Membership::NotAMember).await {
            error!(
                name = %self.conf.name,
                candidate = %self.candidate,
                error = %err,
                "candidate refused resignation, aborting"
            );
            std::process::abort();
        }
    }

    async fn shutdown(&mut self) {
        self.shared.swap_role(Role::Dead);
        match self
            .store
            .compare_and_del(&self.conf.name, &self.endpoint)
            .await
        {
            Ok(()) => info!(name = %self.conf.name, endpoint = %self.endpoint, "leader key released"),
            Err(err) if err.is_expected_race() => {
                info!(name = %self.conf.name, "leader key was not ours to release");
            }
            Err(err) => {
                warn!(name = %self.conf.name, error = %err, "failed to release the leader key");
            }
        }
        if let Err(err) = self.store.close().await {
            warn!(name = %self.conf.name, error = %err, "datastore close failed");
        }
        info!(name = %self.conf.name, endpoint = %self.endpoint, "election task stopped");
    }
}

async fn next_watch_item(watch: &mut Option<WatchStream>) -> Option<Result<Change>> {
    match watch {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use elector_types::error::{BoxError, ErrorCode};

    #[derive(Clone)]
    struct Sink {
        endpoint: String,
        events: mpsc::UnboundedSender<Membership>,
    }

    impl fmt::Display for Sink {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.endpoint)
        }
    }

    #[async_trait]
    impl Candidate for Sink {
        async fn update_membership(
            &self,
            membership: Membership,
        ) -> std::result::Result<(), BoxError> {
            self.events.send(membership).ok();
            Ok(())
        }
    }

    fn sink(endpoint: &str) -> (Sink, mpsc::UnboundedReceiver<Membership>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Sink {
                endpoint: endpoint.to_string(),
                events,
            },
            rx,
        )
    }

    fn memory_conf(universe: &str) -> Config {
        let mut conf = Config::new("cluster", vec![universe.to_string()]);
        conf.datastore_type = "memory".to_string();
        conf.ds_op_timeout = Duration::from_millis(50);
        conf.master_down_after = Duration::from_millis(400);
        conf
    }

    #[tokio::test]
    async fn join_requires_an_endpoint() {
        let p = Participant::from_config(memory_conf("join-empty")).await.unwrap();
        let (candidate, _rx) = sink("");
        let err = p.join("", candidate).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        p.exit().await.unwrap();
    }

    #[tokio::test]
    async fn join_is_single_shot() {
        let p = Participant::from_config(memory_conf("join-twice")).await.unwrap();
        let (first, _rx1) = sink("a:6379");
        let (second, _rx2) = sink("b:6379");
        p.join("a:6379", first).unwrap();
        let err = p.join("b:6379", second).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        p.exit().await.unwrap();
    }

    #[tokio::test]
    async fn join_after_exit_is_rejected() {
        let p = Participant::from_config(memory_conf("join-dead")).await.unwrap();
        p.exit().await.unwrap();
        let (candidate, _rx) = sink("a:6379");
        let err = p.join("a:6379", candidate).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn exit_without_join_is_idempotent() {
        let p = Participant::from_config(memory_conf("exit-bare")).await.unwrap();
        assert_eq!(p.role(), Role::NotAMember);
        p.exit().await.unwrap();
        p.exit().await.unwrap();
        assert_eq!(p.role(), Role::Dead);
    }
}
