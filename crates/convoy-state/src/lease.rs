//! Leader lease and write fences.
//!
//! The lease is a single row in the store. A leader proves it may write
//! by presenting a [`Fence`] that matches the stored holder and epoch of a
//! lease that has not yet expired; the check runs inside the same write
//! transaction as the mutation it guards.

use serde::{Deserialize, Serialize};

/// The persisted leadership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderLease {
    /// Replica id of the holder.
    pub holder: String,
    /// Address the holder serves the API on.
    pub address: String,
    /// Increases every time the lease changes hands.
    pub epoch: u64,
    pub acquired_at_ms: u64,
    pub renewed_at_ms: u64,
    pub expires_at_ms: u64,
}

impl LeaderLease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }
}

/// Proof of leadership attached to a fenced write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub holder: String,
    pub epoch: u64,
    /// Clock reading when the fence was issued.
    pub now_ms: u64,
}

impl Fence {
    /// Whether `lease` still authorizes writes under this fence.
    pub fn admits(&self, lease: &LeaderLease) -> bool {
        lease.holder == self.holder && lease.epoch == self.epoch && !lease.is_expired(self.now_ms)
    }
}
