//! convoy-events: ordered, at-least-once lifecycle notifications.
//!
//! Events live in the state store's log, written in the same transaction
//! as the transition they describe. Subscribers read the log from a
//! cursor, so a reconnecting client that passes its last seen sequence
//! gets everything after it, possibly including duplicates.

pub mod config;
pub mod publisher;

pub use config::EventsConfig;
pub use publisher::{EventPublisher, SubscribeOptions};
