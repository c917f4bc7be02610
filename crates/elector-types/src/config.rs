//! Election configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ElectorError, Result};

/// Datastore adapter used when none is named.
pub const DEFAULT_DATASTORE_TYPE: &str = "etcdv2";

/// Deadline applied to every single backend request.
pub const DEFAULT_DS_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// TTL of the leader key; a silent leader older than this is assumed dead.
pub const DEFAULT_MASTER_DOWN_AFTER: Duration = Duration::from_secs(30);

/// Configuration of one election. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Election key; uniquely identifies the cluster.
    pub name: String,

    /// Selector for an adapter registered in the process-wide factory
    /// registry.
    #[serde(default = "default_datastore_type")]
    pub datastore_type: String,

    /// Ordered list of backend endpoints.
    pub addresses: Vec<String>,

    /// Maximum duration of any single backend request.
    #[serde(default = "default_ds_op_timeout")]
    pub ds_op_timeout: Duration,

    /// TTL written for the leader key. The election tick period derives from
    /// this value (`master_down_after / 2`) so a healthy leader refreshes at
    /// least twice per TTL window.
    #[serde(default = "default_master_down_after")]
    pub master_down_after: Duration,

    /// Backend-specific options, passed through to the adapter untouched.
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

fn default_datastore_type() -> String {
    DEFAULT_DATASTORE_TYPE.to_string()
}

fn default_ds_op_timeout() -> Duration {
    DEFAULT_DS_OP_TIMEOUT
}

fn default_master_down_after() -> Duration {
    DEFAULT_MASTER_DOWN_AFTER
}

impl Config {
    /// Configuration with the stock defaults: etcd v2 backend, 500 ms
    /// per-request deadline, 30 s leader TTL.
    pub fn new(name: impl Into<String>, addresses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            datastore_type: default_datastore_type(),
            addresses,
            ds_op_timeout: DEFAULT_DS_OP_TIMEOUT,
            master_down_after: DEFAULT_MASTER_DOWN_AFTER,
            custom: HashMap::new(),
        }
    }

    /// Validate the configuration, returning `InvalidArgument` naming the
    /// first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ElectorError::invalid_argument(
                "name",
                &self.name,
                "non-empty election key",
            ));
        }
        if self.addresses.is_empty() || self.addresses.iter().any(String::is_empty) {
            return Err(ElectorError::invalid_argument(
                "addresses",
                self.addresses.join(","),
                "non-empty list of http://host:port seed servers",
            ));
        }
        if self.ds_op_timeout.is_zero() {
            return Err(ElectorError::invalid_argument(
                "ds_op_timeout",
                format!("{:?}", self.ds_op_timeout),
                "positive per-request deadline",
            ));
        }
        if self.master_down_after.is_zero() {
            return Err(ElectorError::invalid_argument(
                "master_down_after",
                format!("{:?}", self.master_down_after),
                "positive leader TTL",
            ));
        }
        Ok(())
    }

    /// Period of the election tick: half the leader TTL, guaranteeing at
    /// least two refresh opportunities per TTL window.
    pub fn tick_period(&self) -> Duration {
        self.master_down_after / 2
    }
}
