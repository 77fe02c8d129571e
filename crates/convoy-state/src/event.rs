//! Lifecycle events.
//!
//! Events are appended to the store's event log in the same transaction
//! as the state transition they describe, so a subscriber can never see
//! an event whose transition is not yet visible to a state query.

use serde::{Deserialize, Serialize};

use crate::deployment::{DeploymentId, StepAction};
use crate::types::{PathId, SpecVersion, TaskId, TaskStatus};

/// A lifecycle notification. Serialized with an `eventType` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all_fields = "camelCase")]
pub enum Event {
    /// Synthesized per subscription, never persisted.
    #[serde(rename = "event_stream_attached")]
    EventStreamAttached { remote_address: String },

    #[serde(rename = "deployment_info")]
    DeploymentInfo {
        deployment_id: DeploymentId,
        affected: Vec<PathId>,
        steps: Vec<StepAction>,
        current_step: usize,
    },

    #[serde(rename = "deployment_step_success")]
    DeploymentStepSuccess {
        deployment_id: DeploymentId,
        step: usize,
        action: StepAction,
    },

    #[serde(rename = "deployment_step_failure")]
    DeploymentStepFailure {
        deployment_id: DeploymentId,
        step: usize,
        action: StepAction,
        reason: String,
    },

    #[serde(rename = "deployment_success")]
    DeploymentSuccess { deployment_id: DeploymentId },

    #[serde(rename = "deployment_failed")]
    DeploymentFailed {
        deployment_id: DeploymentId,
        reason: String,
    },

    #[serde(rename = "deployment_cancelled")]
    DeploymentCancelled { deployment_id: DeploymentId },

    #[serde(rename = "status_update_event")]
    StatusUpdate {
        task_id: TaskId,
        spec_id: PathId,
        version: SpecVersion,
        host: String,
        task_status: TaskStatus,
    },

    #[serde(rename = "app_terminated_event")]
    AppTerminated { app_id: PathId },

    #[serde(rename = "pod_deleted_event")]
    PodDeleted { pod_id: PathId },

    #[serde(rename = "leadership_changed_event")]
    LeadershipChanged { leader: String, epoch: u64 },
}

impl Event {
    /// The wire name of this event's type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::EventStreamAttached { .. } => "event_stream_attached",
            Event::DeploymentInfo { .. } => "deployment_info",
            Event::DeploymentStepSuccess { .. } => "deployment_step_success",
            Event::DeploymentStepFailure { .. } => "deployment_step_failure",
            Event::DeploymentSuccess { .. } => "deployment_success",
            Event::DeploymentFailed { .. } => "deployment_failed",
            Event::DeploymentCancelled { .. } => "deployment_cancelled",
            Event::StatusUpdate { .. } => "status_update_event",
            Event::AppTerminated { .. } => "app_terminated_event",
            Event::PodDeleted { .. } => "pod_deleted_event",
            Event::LeadershipChanged { .. } => "leadership_changed_event",
        }
    }

    /// The deployment this event belongs to, if any.
    pub fn deployment_id(&self) -> Option<&str> {
        match self {
            Event::DeploymentInfo { deployment_id, .. }
            | Event::DeploymentStepSuccess { deployment_id, .. }
            | Event::DeploymentStepFailure { deployment_id, .. }
            | Event::DeploymentSuccess { deployment_id }
            | Event::DeploymentFailed { deployment_id, .. }
            | Event::DeploymentCancelled { deployment_id } => Some(deployment_id),
            _ => None,
        }
    }
}

/// An event with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Zero for synthesized events that are not part of the log.
    pub seq: u64,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    #[serde(flatten)]
    pub event: Event,
}

impl EventRecord {
    pub fn now(seq: u64, event: Event) -> Self {
        Self {
            seq,
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_has_event_type_and_camel_case_fields() {
        let record = EventRecord::now(
            7,
            Event::AppTerminated {
                app_id: PathId::parse("/sleep").unwrap(),
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["eventType"], "app_terminated_event");
        assert_eq!(json["appId"], "/sleep");
        assert_eq!(json["seq"], 7);

        let back: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.event, record.event);
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let event = Event::DeploymentStepSuccess {
            deployment_id: "d-1".to_string(),
            step: 0,
            action: StepAction::StartInstances {
                spec_id: PathId::parse("/a").unwrap(),
                target: 1,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], event.event_type());
        assert_eq!(event.deployment_id(), Some("d-1"));
    }
}
