/*!
# etcd v2 datastore adapter

Reference [`Datastore`](elector_types::Datastore) implementation over the
etcd v2 HTTP API (`/v2/keys`). Conditional puts map to `prevExist=false`,
TTL refreshes to etcd's watcher-invisible `refresh=true` mode, and the watch
primitive to a recursive long poll seeded from the store's current event
index.

Backend error codes translate into the shared taxonomy as: 100 →
`KeyNotFound`, 101 → `CompareFailed`, 105 → `KeyExists`; everything else is
a `DataStoreError`. Request deadlines come from `Config::ds_op_timeout`.
*/

mod datastore;
mod wire;

use async_trait::async_trait;

use elector_types::config::Config;
use elector_types::error::Result;
use elector_types::ports::{Datastore, DatastoreFactory};

pub use datastore::EtcdV2Datastore;

/// Factory for the `"etcdv2"` datastore type.
pub struct EtcdV2Factory;

#[async_trait]
impl DatastoreFactory for EtcdV2Factory {
    async fn create(&self, conf: &Config) -> Result<Box<dyn Datastore>> {
        Ok(Box::new(EtcdV2Datastore::from_config(conf)?))
    }
}
