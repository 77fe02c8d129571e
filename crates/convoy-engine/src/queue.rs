//! Per-spec deployment serialization.
//!
//! Each spec id has a FIFO lane of deployment ids. A deployment may run
//! once it is at the head of every lane it touches; deployments on
//! disjoint specs run concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use convoy_state::{DeploymentId, PathId};

#[derive(Default)]
pub struct SpecQueue {
    lanes: Mutex<HashMap<PathId, VecDeque<DeploymentId>>>,
    notify: Notify,
}

impl SpecQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<PathId, VecDeque<DeploymentId>>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `deployment` to the lane of each spec. Enqueueing twice is a no-op.
    pub fn enqueue(&self, deployment: &str, specs: &[PathId]) {
        let mut lanes = self.lanes();
        for spec in specs {
            let lane = lanes.entry(spec.clone()).or_default();
            if !lane.iter().any(|d| d == deployment) {
                lane.push_back(deployment.to_string());
            }
        }
    }

    /// Whether `deployment` heads every lane it was enqueued on.
    pub fn is_turn(&self, deployment: &str, specs: &[PathId]) -> bool {
        let lanes = self.lanes();
        specs.iter().all(|spec| {
            lanes
                .get(spec)
                .and_then(|lane| lane.front())
                .is_some_and(|head| head == deployment)
        })
    }

    /// Wait until `deployment` may run.
    pub async fn wait_turn(&self, deployment: &str, specs: &[PathId]) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();
            if self.is_turn(deployment, specs) {
                return;
            }
            notified.await;
        }
    }

    /// Remove `deployment` from its lanes and wake waiters.
    pub fn release(&self, deployment: &str, specs: &[PathId]) {
        {
            let mut lanes = self.lanes();
            for spec in specs {
                if let Some(lane) = lanes.get_mut(spec) {
                    lane.retain(|d| d != deployment);
                    if lane.is_empty() {
                        lanes.remove(spec);
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Deployments queued behind and including the head, for one spec.
    pub fn depth(&self, spec: &PathId) -> usize {
        self.lanes().get(spec).map_or(0, VecDeque::len)
    }

    pub fn clear(&self) {
        self.lanes().clear();
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ids(raw: &[&str]) -> Vec<PathId> {
        raw.iter().map(|r| PathId::parse(r).unwrap()).collect()
    }

    #[test]
    fn fifo_per_spec() {
        let q = SpecQueue::new();
        let a = ids(&["/a"]);
        q.enqueue("d1", &a);
        q.enqueue("d2", &a);
        q.enqueue("d2", &a);
        assert_eq!(q.depth(&a[0]), 2);
        assert!(q.is_turn("d1", &a));
        assert!(!q.is_turn("d2", &a));

        q.release("d1", &a);
        assert!(q.is_turn("d2", &a));
        q.release("d2", &a);
        assert_eq!(q.depth(&a[0]), 0);
    }

    #[test]
    fn disjoint_specs_do_not_block() {
        let q = SpecQueue::new();
        q.enqueue("d1", &ids(&["/a"]));
        q.enqueue("d2", &ids(&["/b"]));
        assert!(q.is_turn("d1", &ids(&["/a"])));
        assert!(q.is_turn("d2", &ids(&["/b"])));

        q.enqueue("d3", &ids(&["/a", "/b"]));
        assert!(!q.is_turn("d3", &ids(&["/a", "/b"])));
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let q = Arc::new(SpecQueue::new());
        let a = ids(&["/a"]);
        q.enqueue("d1", &a);
        q.enqueue("d2", &a);

        let waiter = tokio::spawn({
            let q = q.clone();
            let a = a.clone();
            async move { q.wait_turn("d2", &a).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        q.release("d1", &a);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
