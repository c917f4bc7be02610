/*!
# elector

Leader election for a named logical cluster, coordinated through a
TTL-based key in an external strongly-consistent K/V store.

A process embeds a [`Participant`], joins the election with an endpoint
identifier and a [`Candidate`] callback object, and is driven through
*not-a-member → follower → leader* as the cluster evolves. At most one
participant holds the leader key at any instant (subject to the store's
consistency); a leader that cannot refresh the key in time is demoted and
rejoins from scratch rather than risking stale leadership.

## Example

```rust,no_run
use std::fmt;

use async_trait::async_trait;
use elector::{BoxError, Candidate, Membership, Participant};

struct Service;

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("orders-service")
    }
}

#[async_trait]
impl Candidate for Service {
    async fn update_membership(&self, m: Membership) -> Result<(), BoxError> {
        match m {
            Membership::Leader => { /* start serving writes */ }
            Membership::Follower { leader } => { /* proxy to `leader` */ let _ = leader; }
            Membership::NotAMember => { /* stop serving */ }
        }
        Ok(())
    }
}

# async fn run() -> elector::Result<()> {
let participant =
    Participant::new("orders", vec!["http://localhost:2379".to_string()]).await?;
participant.join("10.0.0.7:6379", Service)?;
// ...
participant.exit().await?;
# Ok(())
# }
```

## Backends

The store is abstracted behind the [`Datastore`] port. Two adapters ship
in-tree: `"etcdv2"` (the default, from `elector-etcd`) and `"memory"` (an
in-process store for tests and single-process setups). Additional adapters
plug in through [`registry::register`].
*/

pub mod participant;
pub mod registry;

pub use elector_types::config::{
    Config, DEFAULT_DATASTORE_TYPE, DEFAULT_DS_OP_TIMEOUT, DEFAULT_MASTER_DOWN_AFTER,
};
pub use elector_types::error::{BoxError, ElectorError, ErrorCode, Result};
pub use elector_types::membership::{Candidate, Membership, Role};
pub use elector_types::ports::{Change, Datastore, DatastoreFactory, WatchStream};

pub use elector_etcd::EtcdV2Datastore;
pub use participant::Participant;
