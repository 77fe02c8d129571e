//! Turning a desired-state change into deployment steps.

use std::cmp::Ordering;

use convoy_state::{DeploymentTrigger, PathId, RunSpec, StepAction};

/// Steps that move `id` from `old` to `new`. `None` on either side means
/// the spec does not exist there. Restarts replace `batch` tasks per step.
pub fn plan(
    id: &PathId,
    old: Option<&RunSpec>,
    new: Option<&RunSpec>,
    batch: u32,
) -> (DeploymentTrigger, Vec<StepAction>) {
    let spec_id = id.clone();
    match (old, new) {
        (None, Some(new)) => (
            DeploymentTrigger::Create,
            vec![StepAction::StartInstances {
                spec_id,
                target: new.instances(),
            }],
        ),
        (Some(old), Some(new)) if new.is_scale_of(old) => {
            let target = new.instances();
            let action = match target.cmp(&old.instances()) {
                Ordering::Less => StepAction::StopInstances { spec_id, target },
                Ordering::Greater | Ordering::Equal => StepAction::StartInstances { spec_id, target },
            };
            (DeploymentTrigger::Scale, vec![action])
        }
        (Some(old), Some(new)) => (
            DeploymentTrigger::Replace,
            restart_steps(id, new.instances(), old.instances(), batch),
        ),
        (_, None) => (
            DeploymentTrigger::Remove,
            vec![StepAction::StopInstances { spec_id, target: 0 }],
        ),
    }
}

/// One restart step per batch of `outdated` tasks, the last one settling
/// the spec at `target`.
pub fn restart_steps(id: &PathId, target: u32, outdated: u32, batch: u32) -> Vec<StepAction> {
    let batch = batch.max(1);
    let mut steps = Vec::new();
    let mut left = outdated;
    loop {
        left = left.saturating_sub(batch);
        steps.push(StepAction::RestartInstances {
            spec_id: id.clone(),
            target,
            outdated: left,
        });
        if left == 0 {
            return steps;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(instances: u32, cmd: &str, version: u64) -> RunSpec {
        RunSpec::App(
            serde_json::from_value(serde_json::json!({
                "id": "/sleep",
                "cmd": cmd,
                "instances": instances,
                "version": version
            }))
            .unwrap(),
        )
    }

    fn id() -> PathId {
        PathId::parse("/sleep").unwrap()
    }

    fn restart(target: u32, outdated: u32) -> StepAction {
        StepAction::RestartInstances {
            spec_id: id(),
            target,
            outdated,
        }
    }

    #[test]
    fn create_starts_instances() {
        let (trigger, steps) = plan(&id(), None, Some(&app(2, "sleep 1", 1)), 1);
        assert_eq!(trigger, DeploymentTrigger::Create);
        assert_eq!(
            steps,
            vec![StepAction::StartInstances { spec_id: id(), target: 2 }]
        );
    }

    #[test]
    fn instance_change_is_a_scale() {
        let old = app(3, "sleep 1", 1);
        let (trigger, steps) = plan(&id(), Some(&old), Some(&app(1, "sleep 1", 2)), 1);
        assert_eq!(trigger, DeploymentTrigger::Scale);
        assert_eq!(
            steps,
            vec![StepAction::StopInstances { spec_id: id(), target: 1 }]
        );

        let (_, steps) = plan(&id(), Some(&old), Some(&app(5, "sleep 1", 2)), 1);
        assert_eq!(
            steps,
            vec![StepAction::StartInstances { spec_id: id(), target: 5 }]
        );
    }

    #[test]
    fn other_change_restarts_in_batches() {
        let (trigger, steps) = plan(
            &id(),
            Some(&app(3, "sleep 1", 1)),
            Some(&app(2, "sleep 2", 4)),
            1,
        );
        assert_eq!(trigger, DeploymentTrigger::Replace);
        assert_eq!(steps, vec![restart(2, 2), restart(2, 1), restart(2, 0)]);

        let (_, steps) = plan(
            &id(),
            Some(&app(3, "sleep 1", 1)),
            Some(&app(3, "sleep 2", 4)),
            2,
        );
        assert_eq!(steps, vec![restart(3, 1), restart(3, 0)]);
    }

    #[test]
    fn restart_without_outdated_tasks_is_one_step() {
        assert_eq!(restart_steps(&id(), 2, 0, 1), vec![restart(2, 0)]);
        assert_eq!(restart_steps(&id(), 2, 3, 0), vec![restart(2, 2), restart(2, 1), restart(2, 0)]);
    }

    #[test]
    fn removal_stops_everything() {
        let (trigger, steps) = plan(&id(), Some(&app(2, "sleep 1", 1)), None, 1);
        assert_eq!(trigger, DeploymentTrigger::Remove);
        assert_eq!(
            steps,
            vec![StepAction::StopInstances { spec_id: id(), target: 0 }]
        );
    }
}
