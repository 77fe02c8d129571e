//! convoyd: configuration and replica assembly for the convoy daemon.
//!
//! The binary in `main.rs` parses the command line and drives these; the
//! integration tests build replicas the same way.

pub mod config;
pub mod replica;

pub use config::DaemonConfig;
pub use replica::Replica;
