/*!
# Elector shared types

Domain types shared by the election engine and every datastore adapter:

- **Error taxonomy**: a single [`ElectorError`] enum with a closed
  [`ErrorCode`] classification every adapter translates its backend
  failures into.
- **Configuration**: [`Config`] describing one election (key name, backend
  selector, endpoints, timeouts).
- **Membership model**: [`Role`], [`Membership`], and the consumer-facing
  [`Candidate`] callback trait.
- **Coordination-store port**: the [`Datastore`] trait with the minimal
  primitive set for fair single-leader election (conditional put with TTL,
  conditional refresh, compare-and-delete, watch), plus the watch channel
  types and an in-memory reference implementation.
*/

pub mod config;
pub mod error;
pub mod membership;
pub mod ports;

pub use config::Config;
pub use error::{BoxError, ElectorError, ErrorCode, Result};
pub use membership::{Candidate, Membership, Role};
pub use ports::{watch_channel, Change, Datastore, DatastoreFactory, WatchSender, WatchStream};
