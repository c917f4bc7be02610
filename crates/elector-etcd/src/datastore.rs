//! etcd v2 implementation of the [`Datastore`] port.
//!
//! All operations go through the `/v2/keys` HTTP API. Ordinary requests use
//! a client with the per-request deadline baked in and fail over across the
//! configured endpoints on connection errors; watches run a long-poll loop
//! on a second client whose reads are unbounded (only connection
//! establishment is time-limited), feeding the bounded watch channel until
//! cancelled or until the backend reports an unrecoverable error.

use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use url::Url;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use async_trait::async_trait;
use elector_types::config::Config;
use elector_types::error::{ElectorError, ErrorCode, Result};
use elector_types::ports::{
    watch_channel, Change, Datastore, WatchSender, WatchStream, CLOSE_TIMEOUT,
};

use crate::wire::{adapt, codes, ErrorResponse, KeysResponse};

pub struct EtcdV2Datastore {
    http: Client,
    poll_http: Client,
    endpoints: Vec<Url>,
    op_timeout: Duration,
    watch: Mutex<Option<ActiveWatch>>,
}

struct ActiveWatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EtcdV2Datastore {
    pub fn from_config(conf: &Config) -> Result<Self> {
        conf.validate()?;
        let mut endpoints = Vec::with_capacity(conf.addresses.len());
        for address in &conf.addresses {
            let url = Url::parse(address).map_err(|err| {
                ElectorError::invalid_argument(
                    "addresses",
                    address,
                    format!("a parseable http://host:port URL ({err})"),
                )
            })?;
            endpoints.push(url);
        }
        let http = Client::builder()
            .timeout(conf.ds_op_timeout)
            .build()
            .map_err(|err| ElectorError::datastore("ConnectToEtcd", err))?;
        // Long polls wait for cluster events, so only connection
        // establishment is bounded on this client.
        let poll_http = Client::builder()
            .connect_timeout(conf.ds_op_timeout)
            .build()
            .map_err(|err| ElectorError::datastore("ConnectToEtcd", err))?;
        Ok(Self {
            http,
            poll_http,
            endpoints,
            op_timeout: conf.ds_op_timeout,
            watch: Mutex::new(None),
        })
    }

    /// Issue one request against the first reachable endpoint and decode the
    /// etcd response. Endpoints are tried in order; only connection failures
    /// fail over.
    async fn call<F>(&self, op: &'static str, key: &str, build: F) -> Result<KeysResponse>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let mut last_err: Option<reqwest::Error> = None;
        for base in &self.endpoints {
            let url = key_url(base, key);
            let req = build(&self.http, url);
            match req.send().await {
                Ok(resp) => return decode(op, resp).await,
                Err(err) if err.is_connect() => {
                    debug!(op, endpoint = %base, error = %err, "endpoint unreachable, trying next");
                    last_err = Some(err);
                }
                Err(err) if err.is_timeout() => {
                    return Err(ElectorError::timeout(op, self.op_timeout))
                }
                Err(err) => return Err(ElectorError::datastore(op, err)),
            }
        }
        Err(match last_err {
            Some(err) => ElectorError::datastore(op, err),
            None => ElectorError::datastore(op, "no endpoints configured"),
        })
    }
}

#[async_trait]
impl Datastore for EtcdV2Datastore {
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl_secs = ttl_seconds(ttl);
        loop {
            let result = self
                .call("PutIfAbsent", key, |client, url| {
                    client.put(url).form(&[
                        ("value", value.to_string()),
                        ("ttl", ttl_secs.to_string()),
                        ("prevExist", "false".to_string()),
                    ])
                })
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err) if err.code() == ErrorCode::KeyExists => {
                    // etcd's conflict response does not carry the holder's
                    // value; read it in a second round trip.
                    match self.get(key).await {
                        Ok(current) => {
                            return Err(ElectorError::key_exists("PutIfAbsent", current))
                        }
                        Err(read_err) if read_err.code() == ErrorCode::KeyNotFound => {
                            // The holder expired between conflict and read.
                            debug!(key, "conflicting key expired, retrying put");
                            continue;
                        }
                        Err(read_err) => return Err(read_err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn refresh_ttl(&self, key: &str, expected: &str, ttl: Duration) -> Result<()> {
        let ttl_secs = ttl_seconds(ttl);
        self.call("RefreshTTL", key, |client, url| {
            client.put(url).form(&[
                ("ttl", ttl_secs.to_string()),
                ("prevValue", expected.to_string()),
                ("refresh", "true".to_string()),
            ])
        })
        .await
        .map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<String> {
        let resp = self.call("Get", key, |client, url| client.get(url)).await?;
        resp.node
            .and_then(|node| node.value)
            .ok_or_else(|| ElectorError::datastore("Get", "response carried no value"))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.call("Del", key, |client, url| client.delete(url))
            .await
            .map(|_| ())
    }

    async fn compare_and_del(&self, key: &str, expected: &str) -> Result<()> {
        self.call("CompareAndDel", key, |client, url| {
            client.delete(url).query(&[("prevValue", expected)])
        })
        .await
        .map(|_| ())
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let (tx, stream) = watch_channel();
        let cancel = CancellationToken::new();
        let task = WatchLoop {
            http: self.http.clone(),
            poll_http: self.poll_http.clone(),
            endpoints: self.endpoints.clone(),
            key: key.to_string(),
            op_timeout: self.op_timeout,
        };
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { task.run(tx, cancel).await }
        });
        if let Some(stale) = self.watch.lock().replace(ActiveWatch { cancel, handle }) {
            // The replaced task's subscriber is gone; wind it down.
            stale.cancel.cancel();
        }
        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        let active = self.watch.lock().take();
        if let Some(ActiveWatch { cancel, handle }) = active {
            cancel.cancel();
            if time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                return Err(ElectorError::timeout("Close", CLOSE_TIMEOUT));
            }
        }
        Ok(())
    }
}

/// One long-poll watch over a single key.
struct WatchLoop {
    http: Client,
    poll_http: Client,
    endpoints: Vec<Url>,
    key: String,
    op_timeout: Duration,
}

enum Polled {
    Event(KeysResponse),
    /// The long poll ended without an event (closed by etcd or a proxy).
    Drained,
    /// Our wait index fell out of etcd's event history; reseed from `index`.
    IndexCleared(u64),
    Fatal(ElectorError),
}

impl WatchLoop {
    async fn run(self, tx: WatchSender, cancel: CancellationToken) {
        let mut wait_index: Option<u64> = None;
        loop {
            let index = match wait_index {
                Some(index) => index,
                None => {
                    let seeded = tokio::select! {
                        _ = cancel.cancelled() => return,
                        seeded = self.current_index() => seeded,
                    };
                    match seeded {
                        Ok(current) => {
                            wait_index = Some(current + 1);
                            current + 1
                        }
                        Err(err) => {
                            warn!(key = %self.key, error = %err, "watch could not seed its index");
                            tx.bye(err).await;
                            return;
                        }
                    }
                }
            };

            let polled = tokio::select! {
                _ = cancel.cancelled() => return,
                polled = self.poll(index) => polled,
            };
            match polled {
                Polled::Event(resp) => {
                    wait_index = resp.node.as_ref().map(|node| node.modified_index + 1);
                    if let Some(change) = translate(&resp) {
                        debug!(key = %self.key, action = %resp.action, "watched key changed");
                        let delivered = tokio::select! {
                            _ = cancel.cancelled() => return,
                            delivered = tx.notify(change) => delivered,
                        };
                        if !delivered {
                            return;
                        }
                    }
                }
                Polled::Drained => {}
                Polled::IndexCleared(current) => {
                    debug!(key = %self.key, index = current, "event index cleared, reseeding watch");
                    wait_index = Some(current + 1);
                }
                Polled::Fatal(err) => {
                    warn!(key = %self.key, error = %err, "watch terminated");
                    tx.bye(err).await;
                    return;
                }
            }
        }
    }

    /// Current etcd index for the watched key, used to wait only for events
    /// after "now". Works whether or not the key exists: the index rides on
    /// the `X-Etcd-Index` header and, for misses, in the error body.
    async fn current_index(&self) -> Result<u64> {
        let mut last_err: Option<reqwest::Error> = None;
        for base in &self.endpoints {
            let url = key_url(base, &self.key);
            let req = self.http.get(url);
            match req.send().await {
                Ok(resp) => {
                    let header = resp
                        .headers()
                        .get("X-Etcd-Index")
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.parse::<u64>().ok());
                    if let Some(index) = header {
                        return Ok(index);
                    }
                    let status = resp.status();
                    if status.is_success() {
                        if let Ok(body) = resp.json::<KeysResponse>().await {
                            if let Some(node) = body.node {
                                return Ok(node.modified_index);
                            }
                        }
                    } else if let Ok(body) = resp.json::<ErrorResponse>().await {
                        return Ok(body.index);
                    }
                    return Err(ElectorError::datastore(
                        "Watch",
                        format!("etcd response (HTTP {status}) carried no index"),
                    ));
                }
                Err(err) if err.is_connect() => {
                    last_err = Some(err);
                }
                Err(err) if err.is_timeout() => {
                    return Err(ElectorError::timeout("Watch", self.op_timeout))
                }
                Err(err) => return Err(ElectorError::datastore("Watch", err)),
            }
        }
        Err(match last_err {
            Some(err) => ElectorError::datastore("Watch", err),
            None => ElectorError::datastore("Watch", "no endpoints configured"),
        })
    }

    async fn poll(&self, wait_index: u64) -> Polled {
        let mut last_err: Option<reqwest::Error> = None;
        for base in &self.endpoints {
            let url = key_url(base, &self.key);
            let req = self
                .poll_http
                .get(url)
                .query(&[("wait", "true".to_string()), ("waitIndex", wait_index.to_string())]);
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return match resp.json::<KeysResponse>().await {
                            Ok(body) => Polled::Event(body),
                            Err(_) => Polled::Drained,
                        };
                    }
                    return match resp.json::<ErrorResponse>().await {
                        Ok(body) if body.error_code == codes::EVENT_INDEX_CLEARED => {
                            Polled::IndexCleared(body.index)
                        }
                        Ok(body) => Polled::Fatal(adapt(&body, "Watch")),
                        Err(err) => Polled::Fatal(ElectorError::datastore(
                            "Watch",
                            format!("etcd returned HTTP {status}: {err}"),
                        )),
                    };
                }
                Err(err) if err.is_connect() => {
                    last_err = Some(err);
                }
                Err(err) => return Polled::Fatal(ElectorError::datastore("Watch", err)),
            }
        }
        Polled::Fatal(match last_err {
            Some(err) => ElectorError::datastore("Watch", err),
            None => ElectorError::datastore("Watch", "no endpoints configured"),
        })
    }
}

fn key_url(base: &Url, key: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&format!("/v2/keys/{}", key.trim_start_matches('/')));
    url.set_query(None);
    url
}

// etcd v2 TTLs are whole seconds; anything shorter still needs one.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

async fn decode(op: &'static str, resp: Response) -> Result<KeysResponse> {
    let status = resp.status();
    if status.is_success() {
        resp.json::<KeysResponse>()
            .await
            .map_err(|err| ElectorError::datastore(op, err))
    } else {
        match resp.json::<ErrorResponse>().await {
            Ok(body) => Err(adapt(&body, op)),
            Err(_) => Err(ElectorError::datastore(
                op,
                format!("etcd returned HTTP {status}"),
            )),
        }
    }
}

fn translate(resp: &KeysResponse) -> Option<Change> {
    let new_value = resp
        .node
        .as_ref()
        .and_then(|node| node.value.clone())
        .unwrap_or_default();
    let prev_value = resp
        .prev_node
        .as_ref()
        .and_then(|node| node.value.clone())
        .unwrap_or_default();
    match resp.action.as_str() {
        "create" => Some(Change::Created { new_value }),
        "set" | "update" | "compareAndSwap" => Some(Change::Updated {
            new_value,
            prev_value,
        }),
        "delete" | "compareAndDelete" | "expire" => Some(Change::Deleted { prev_value }),
        _ => None,
    }
}
