//! Event publisher and subscription streams.
//!
//! Publishing appends to the store's event log under the leader's fence.
//! A subscription reads the log from a cursor and parks on the store's
//! commit notifications when it has caught up, so delivery survives
//! leader changes: any replica can serve a stream from the shared log.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::Stream;
use futures_util::stream::unfold;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use convoy_state::{Event, EventRecord, Fence, StateResult, StateStore};

use crate::config::EventsConfig;

const STREAM_BATCH_LIMIT: usize = 200;
const STREAM_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Parameters of one subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Resume after this sequence. `None` starts at the current head.
    pub after: Option<u64>,
    /// Event types to deliver; empty delivers all.
    pub event_types: Vec<String>,
    /// Reported back in `event_stream_attached`.
    pub remote_address: String,
}

impl SubscribeOptions {
    fn accepts(&self, record: &EventRecord) -> bool {
        self.event_types.is_empty()
            || self
                .event_types
                .iter()
                .any(|t| t == record.event.event_type())
    }
}

struct StreamState {
    store: StateStore,
    commits: watch::Receiver<u64>,
    cursor: u64,
    buffer: VecDeque<EventRecord>,
    options: SubscribeOptions,
}

#[derive(Clone)]
pub struct EventPublisher {
    store: StateStore,
    config: EventsConfig,
}

impl EventPublisher {
    pub fn new(store: StateStore, config: EventsConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EventsConfig {
        &self.config
    }

    /// Append a standalone event. Events that accompany a state change are
    /// appended inside that change's transaction instead.
    pub fn publish(&self, fence: &Fence, event: Event) -> StateResult<u64> {
        let event_type = event.event_type();
        let seq = self.store.write(Some(fence), |txn| txn.append(event))?;
        debug!(seq, event_type, "event published");
        Ok(seq)
    }

    /// Open a subscription. The first item is always a synthesized
    /// `event_stream_attached`; after it come logged events in sequence
    /// order. Dropping the stream ends the subscription.
    pub fn subscribe(
        &self,
        options: SubscribeOptions,
    ) -> impl Stream<Item = EventRecord> + Send + 'static + use<> {
        let mut commits = self.store.watch_events();
        let head = *commits.borrow_and_update();
        let cursor = options.after.unwrap_or(head);
        debug!(remote = %options.remote_address, cursor, "event subscription opened");

        let attached = EventRecord::now(
            0,
            Event::EventStreamAttached {
                remote_address: options.remote_address.clone(),
            },
        );
        let state = StreamState {
            store: self.store.clone(),
            commits,
            cursor,
            buffer: VecDeque::from([attached]),
            options,
        };

        unfold(state, |mut st| async move {
            loop {
                if let Some(record) = st.buffer.pop_front() {
                    return Some((record, st));
                }

                match st.store.events_after(st.cursor, STREAM_BATCH_LIMIT) {
                    Ok(batch) if batch.is_empty() => {
                        if st.commits.changed().await.is_err() {
                            return None;
                        }
                    }
                    Ok(batch) => {
                        if let Some(last) = batch.last() {
                            st.cursor = last.seq;
                        }
                        st.buffer
                            .extend(batch.into_iter().filter(|r| st.options.accepts(r)));
                    }
                    Err(e) => {
                        warn!(error = %e, cursor = st.cursor, "failed to read event log");
                        sleep(STREAM_RETRY_INTERVAL).await;
                    }
                }
            }
        })
    }

    /// Trim the log to `retention` events every `prune_interval` until
    /// `shutdown` fires.
    pub async fn run_pruner(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = sleep(self.config.prune_interval()) => {
                    match self.store.prune_events(self.config.retention) {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "event log pruned"),
                        Err(e) => warn!(error = %e, "event log pruning failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_state::{LeaderLease, PathId};
    use futures_util::StreamExt;

    fn leader_store() -> (StateStore, Fence) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(None, |txn| {
                txn.put_lease(&LeaderLease {
                    holder: "r1".to_string(),
                    address: "127.0.0.1:8080".to_string(),
                    epoch: 1,
                    acquired_at_ms: 0,
                    renewed_at_ms: 0,
                    expires_at_ms: u64::MAX,
                })
            })
            .unwrap();
        let fence = Fence {
            holder: "r1".to_string(),
            epoch: 1,
            now_ms: 1,
        };
        (store, fence)
    }

    fn terminated(id: &str) -> Event {
        Event::AppTerminated {
            app_id: PathId::parse(id).unwrap(),
        }
    }

    fn leadership() -> Event {
        Event::LeadershipChanged {
            leader: "r1".to_string(),
            epoch: 1,
        }
    }

    async fn next(stream: &mut (impl Stream<Item = EventRecord> + Unpin)) -> EventRecord {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn attached_first_then_new_events_in_order() {
        let (store, fence) = leader_store();
        let publisher = EventPublisher::new(store, EventsConfig::default());
        publisher.publish(&fence, terminated("/before")).unwrap();

        let mut stream = Box::pin(publisher.subscribe(SubscribeOptions {
            remote_address: "10.0.0.9".to_string(),
            ..Default::default()
        }));

        let first = next(&mut stream).await;
        assert_eq!(
            first.event,
            Event::EventStreamAttached {
                remote_address: "10.0.0.9".to_string()
            }
        );

        publisher.publish(&fence, terminated("/a")).unwrap();
        publisher.publish(&fence, terminated("/b")).unwrap();

        let a = next(&mut stream).await;
        let b = next(&mut stream).await;
        assert_eq!(a.event, terminated("/a"));
        assert_eq!(b.event, terminated("/b"));
        assert!(a.seq < b.seq);
    }

    #[tokio::test]
    async fn event_type_filter() {
        let (store, fence) = leader_store();
        let publisher = EventPublisher::new(store, EventsConfig::default());
        let mut stream = Box::pin(publisher.subscribe(SubscribeOptions {
            event_types: vec!["leadership_changed_event".to_string()],
            ..Default::default()
        }));
        assert_eq!(next(&mut stream).await.event.event_type(), "event_stream_attached");

        publisher.publish(&fence, terminated("/a")).unwrap();
        publisher.publish(&fence, leadership()).unwrap();

        assert_eq!(next(&mut stream).await.event, leadership());
    }

    #[tokio::test]
    async fn resume_after_sequence_replays_backlog() {
        let (store, fence) = leader_store();
        let publisher = EventPublisher::new(store, EventsConfig::default());
        let first = publisher.publish(&fence, terminated("/a")).unwrap();
        publisher.publish(&fence, terminated("/b")).unwrap();

        let mut stream = Box::pin(publisher.subscribe(SubscribeOptions {
            after: Some(first),
            ..Default::default()
        }));
        next(&mut stream).await;
        assert_eq!(next(&mut stream).await.event, terminated("/b"));
    }

    #[tokio::test]
    async fn publish_without_lease_is_rejected() {
        let (store, _) = leader_store();
        let publisher = EventPublisher::new(store.clone(), EventsConfig::default());
        let stale = Fence {
            holder: "r0".to_string(),
            epoch: 0,
            now_ms: 1,
        };
        assert!(publisher.publish(&stale, leadership()).unwrap_err().is_fenced());
        assert!(store.events_after(0, 10).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_trims_to_retention() {
        let (store, fence) = leader_store();
        let publisher = EventPublisher::new(
            store.clone(),
            EventsConfig {
                retention: 1,
                prune_interval_secs: 1,
                keep_alive_secs: 15,
            },
        );
        for id in ["/a", "/b", "/c"] {
            publisher.publish(&fence, terminated(id)).unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.run_pruner(rx).await }
        });
        sleep(Duration::from_millis(1_500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let left = store.events_after(0, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event, terminated("/c"));
    }
}
