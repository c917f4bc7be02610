//! Process-wide datastore factory registry.
//!
//! Adapters register once per name during initialization; registration is
//! write-once-per-name (the first registration wins, duplicates are logged
//! and ignored). The `"etcdv2"` and `"memory"` adapters are pre-seeded.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::warn;

use elector_etcd::EtcdV2Factory;
use elector_types::config::Config;
use elector_types::error::{ElectorError, Result};
use elector_types::ports::memory::MemoryFactory;
use elector_types::ports::{Datastore, DatastoreFactory};

static FACTORIES: Lazy<RwLock<HashMap<String, Arc<dyn DatastoreFactory>>>> = Lazy::new(|| {
    let mut table: HashMap<String, Arc<dyn DatastoreFactory>> = HashMap::new();
    table.insert("etcdv2".to_string(), Arc::new(EtcdV2Factory));
    table.insert("memory".to_string(), Arc::new(MemoryFactory));
    RwLock::new(table)
});

/// Register a datastore factory under `name`. The first registration for a
/// name wins; later ones are ignored.
pub fn register(name: impl Into<String>, factory: Arc<dyn DatastoreFactory>) {
    let name = name.into();
    let mut table = FACTORIES.write();
    if table.contains_key(&name) {
        warn!(name = %name, "datastore factory already registered, ignoring");
        return;
    }
    table.insert(name, factory);
}

/// Build the datastore selected by `conf.datastore_type`.
pub async fn create_datastore(conf: &Config) -> Result<Box<dyn Datastore>> {
    conf.validate()?;
    let factory = FACTORIES.read().get(&conf.datastore_type).cloned();
    match factory {
        Some(factory) => factory.create(conf).await,
        None => {
            let mut known: Vec<String> = FACTORIES.read().keys().cloned().collect();
            known.sort();
            Err(ElectorError::invalid_argument(
                "datastore_type",
                &conf.datastore_type,
                format!("one of: {}", known.join(", ")),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use elector_types::error::ErrorCode;
    use elector_types::ports::memory::MemoryDatastore;

    struct FixedUniverse(&'static str);

    #[async_trait]
    impl DatastoreFactory for FixedUniverse {
        async fn create(&self, _conf: &Config) -> Result<Box<dyn Datastore>> {
            Ok(Box::new(MemoryDatastore::open(self.0)))
        }
    }

    fn memory_conf(universe: &str) -> Config {
        let mut conf = Config::new("cluster", vec![universe.to_string()]);
        conf.datastore_type = "memory".to_string();
        conf
    }

    #[tokio::test]
    async fn builtin_factories_are_seeded() {
        let ds = create_datastore(&memory_conf("registry-builtin"))
            .await
            .unwrap();
        ds.put_if_absent("cluster", "a:6379", std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ds.get("cluster").await.unwrap(), "a:6379");
    }

    #[tokio::test]
    async fn unknown_types_name_the_registered_ones() {
        let mut conf = memory_conf("registry-unknown");
        conf.datastore_type = "zookeeper".to_string();
        let err = create_datastore(&conf).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        let message = err.to_string();
        assert!(message.contains("etcdv2"));
        assert!(message.contains("memory"));
    }

    #[tokio::test]
    async fn first_registration_wins() {
        register("registry-dup", Arc::new(FixedUniverse("registry-dup-first")));
        register("registry-dup", Arc::new(FixedUniverse("registry-dup-second")));

        let mut conf = memory_conf("ignored");
        conf.datastore_type = "registry-dup".to_string();
        let ds = create_datastore(&conf).await.unwrap();
        ds.put_if_absent("cluster", "a:6379", std::time::Duration::from_secs(5))
            .await
            .unwrap();

        // The first factory's universe holds the key; the second one's does not.
        let first = MemoryDatastore::open("registry-dup-first");
        assert_eq!(first.get("cluster").await.unwrap(), "a:6379");
        let second = MemoryDatastore::open("registry-dup-second");
        assert_eq!(
            second.get("cluster").await.unwrap_err().code(),
            ErrorCode::KeyNotFound
        );
    }
}
