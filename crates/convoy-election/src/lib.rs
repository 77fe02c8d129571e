//! convoy-election: single-leader election among Convoy replicas.
//!
//! Replicas compete for one lease row in the shared state store. The
//! holder renews it on a fixed interval; everyone else polls until it
//! expires or is released. Every leader write carries a [`Fence`] issued
//! by [`Election::fence`], and the store rejects fences whose epoch is no
//! longer current.
//!
//! [`Fence`]: convoy_state::Fence

pub mod config;
pub mod election;
pub mod error;

pub use config::ElectionConfig;
pub use election::{Campaign, Election, LeaderInfo, LeaderToken, LeadershipState};
pub use error::{ElectionError, ElectionResult};
