//! Lease timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ElectionError, ElectionResult};

/// Timing parameters for the leader lease.
///
/// A leader renews every `renew_interval` and stops serving writes once
/// `renew_deadline` has passed since its last successful renewal. Because
/// `renew_deadline < lease_ttl`, a leader always stops writing before any
/// other replica may take over the lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    #[serde(rename = "lease_ttl_ms", with = "millis")]
    pub lease_ttl: Duration,
    #[serde(rename = "renew_interval_ms", with = "millis")]
    pub renew_interval: Duration,
    #[serde(rename = "renew_deadline_ms", with = "millis")]
    pub renew_deadline: Duration,
    /// How often a follower checks whether the lease is up for grabs.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// How long a replica that abdicated stays out of the next campaign.
    #[serde(rename = "abdication_cooldown_ms", with = "millis")]
    pub abdication_cooldown: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_millis(10_000),
            renew_interval: Duration::from_millis(2_000),
            renew_deadline: Duration::from_millis(6_000),
            poll_interval: Duration::from_millis(1_000),
            abdication_cooldown: Duration::from_millis(10_000),
        }
    }
}

impl ElectionConfig {
    /// Enforce `renew_interval < renew_deadline < lease_ttl`.
    pub fn validate(&self) -> ElectionResult<()> {
        if self.renew_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(ElectionError::Config(
                "renew_interval and poll_interval must be non-zero".to_string(),
            ));
        }
        if self.renew_interval >= self.renew_deadline {
            return Err(ElectionError::Config(format!(
                "renew_interval ({:?}) must be shorter than renew_deadline ({:?})",
                self.renew_interval, self.renew_deadline
            )));
        }
        if self.renew_deadline >= self.lease_ttl {
            return Err(ElectionError::Config(format!(
                "renew_deadline ({:?}) must be shorter than lease_ttl ({:?})",
                self.renew_deadline, self.lease_ttl
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ElectionConfig::default().validate().unwrap();
    }

    #[test]
    fn deadline_must_undercut_ttl() {
        let config = ElectionConfig {
            renew_deadline: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ElectionConfig {
            renew_interval: Duration::from_secs(6),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn reads_millisecond_fields() {
        let config: ElectionConfig = serde_json::from_str(r#"{"lease_ttl_ms": 3000}"#).unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(3));
        assert_eq!(config.renew_interval, Duration::from_secs(2));
    }
}
