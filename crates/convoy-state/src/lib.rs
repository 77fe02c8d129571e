//! convoy-state: embedded persistent store for Convoy.
//!
//! Backed by [redb](https://docs.rs/redb). Holds app and pod specs,
//! in-flight and archived deployments, task records, the leader lease,
//! counters and the event log.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Task keys are `{spec_id}:{task_id}` so a spec's tasks share a prefix.
//! Events are keyed by their `u64` sequence number.
//!
//! All mutations run through [`StateStore::write`]. A leader passes its
//! [`Fence`], and the lease check happens inside the same transaction as
//! the mutation, so a replica that has lost its lease can never commit.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks and across in-process replicas.

pub mod clock;
pub mod cluster;
pub mod deployment;
pub mod error;
pub mod event;
pub mod lease;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::ClusterState;
pub use deployment::*;
pub use error::{StateError, StateResult};
pub use event::{Event, EventRecord};
pub use lease::{Fence, LeaderLease};
pub use store::{StateStore, StateTxn};
pub use types::*;
