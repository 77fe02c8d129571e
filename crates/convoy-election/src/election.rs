//! Lease-backed leader election.
//!
//! The lease lives in the shared [`StateStore`]. Acquisition and renewal
//! are compare-and-swap writes inside a single store transaction:
//!
//! 1. No lease, or an expired one: take it with `epoch = previous + 1`.
//! 2. An unexpired lease held by another replica: follow it.
//! 3. Our own lease: renew it if holder and epoch still match.
//!
//! A leader that has not renewed within `renew_deadline` stops handing out
//! fences even before it learns about a successor, which prevents two
//! replicas from writing at once.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use convoy_state::{Clock, Fence, LeaderLease, StateStore};

use crate::config::ElectionConfig;
use crate::error::{ElectionError, ElectionResult};

/// The current leader as seen through the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderInfo {
    pub replica_id: String,
    pub address: String,
    pub epoch: u64,
}

impl From<&LeaderLease> for LeaderInfo {
    fn from(lease: &LeaderLease) -> Self {
        Self {
            replica_id: lease.holder.clone(),
            address: lease.address.clone(),
            epoch: lease.epoch,
        }
    }
}

/// Held by a replica for as long as it owns the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderToken {
    pub replica_id: String,
    pub address: String,
    pub epoch: u64,
}

/// Outcome of a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Campaign {
    Elected(LeaderToken),
    /// Another replica holds the lease, or none does yet but this replica
    /// may not take it (cooldown after abdication).
    Following(Option<LeaderInfo>),
}

/// Local view of this replica's role, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    Follower,
    Leader(LeaderToken),
}

#[derive(Debug, Default)]
struct Session {
    token: Option<LeaderToken>,
    renewed_at_ms: u64,
    cooldown_until_ms: u64,
}

enum Acquire {
    Won(LeaderLease),
    Held(LeaderLease),
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// One replica's participation in leader election.
pub struct Election {
    replica_id: String,
    address: String,
    config: ElectionConfig,
    store: StateStore,
    clock: Arc<dyn Clock>,
    session: Mutex<Session>,
    state_tx: watch::Sender<LeadershipState>,
}

impl Election {
    pub fn new(
        replica_id: impl Into<String>,
        address: impl Into<String>,
        store: StateStore,
        clock: Arc<dyn Clock>,
        config: ElectionConfig,
    ) -> ElectionResult<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(LeadershipState::Follower);
        Ok(Self {
            replica_id: replica_id.into(),
            address: address.into(),
            config,
            store,
            clock,
            session: Mutex::new(Session::default()),
            state_tx,
        })
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The token this replica holds, if it believes it is leader.
    pub fn token(&self) -> Option<LeaderToken> {
        self.session().token.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.session().token.is_some()
    }

    /// Subscribe to local leadership changes.
    pub fn watch(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    /// Non-blocking lookup of the current lease holder.
    pub fn current_leader(&self) -> ElectionResult<Option<LeaderInfo>> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .lease()?
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| LeaderInfo::from(&lease)))
    }

    /// Make one attempt to take the lease.
    pub fn try_acquire(&self) -> ElectionResult<Campaign> {
        if let Some(token) = self.token() {
            return Ok(Campaign::Elected(token));
        }
        let now = self.clock.now_ms();
        if now < self.session().cooldown_until_ms {
            return Ok(Campaign::Following(self.current_leader()?));
        }

        let ttl = millis(self.config.lease_ttl);
        let outcome = self.store.write(None, |txn| -> ElectionResult<Acquire> {
            if let Some(lease) = txn.lease()? {
                if !lease.is_expired(now) && lease.holder != self.replica_id {
                    return Ok(Acquire::Held(lease));
                }
            }
            let lease = LeaderLease {
                holder: self.replica_id.clone(),
                address: self.address.clone(),
                epoch: txn.next_epoch()?,
                acquired_at_ms: now,
                renewed_at_ms: now,
                expires_at_ms: now + ttl,
            };
            txn.put_lease(&lease)?;
            Ok(Acquire::Won(lease))
        })?;

        match outcome {
            Acquire::Held(lease) => Ok(Campaign::Following(Some(LeaderInfo::from(&lease)))),
            Acquire::Won(lease) => {
                let token = LeaderToken {
                    replica_id: lease.holder,
                    address: lease.address,
                    epoch: lease.epoch,
                };
                {
                    let mut session = self.session();
                    session.token = Some(token.clone());
                    session.renewed_at_ms = now;
                }
                self.state_tx
                    .send_replace(LeadershipState::Leader(token.clone()));
                info!(replica = %self.replica_id, epoch = token.epoch, "acquired leader lease");
                Ok(Campaign::Elected(token))
            }
        }
    }

    /// Block until this replica holds the lease or another replica is
    /// observed holding it.
    pub async fn campaign(&self) -> ElectionResult<Campaign> {
        loop {
            match self.try_acquire()? {
                Campaign::Following(None) => tokio::time::sleep(self.config.poll_interval).await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Extend the lease. Losing it, or missing the renew deadline, ends
    /// this replica's leadership.
    pub fn renew(&self) -> ElectionResult<()> {
        let token = self
            .token()
            .ok_or_else(|| ElectionError::NotLeader(self.replica_id.clone()))?;
        // Surfaces a missed deadline before touching the store.
        self.fence()?;

        let now = self.clock.now_ms();
        let ttl = millis(self.config.lease_ttl);
        let result = self.store.write(None, |txn| -> ElectionResult<()> {
            match txn.lease()? {
                Some(lease)
                    if lease.holder == token.replica_id
                        && lease.epoch == token.epoch
                        && !lease.is_expired(now) =>
                {
                    txn.put_lease(&LeaderLease {
                        renewed_at_ms: now,
                        expires_at_ms: now + ttl,
                        ..lease
                    })?;
                    Ok(())
                }
                Some(lease) => Err(ElectionError::LeadershipLost(format!(
                    "lease held by {} at epoch {}",
                    lease.holder, lease.epoch
                ))),
                None => Err(ElectionError::LeadershipLost("lease released".to_string())),
            }
        });

        match result {
            Ok(()) => {
                let mut session = self.session();
                if session.token.as_ref() == Some(&token) {
                    session.renewed_at_ms = now;
                }
                debug!(replica = %self.replica_id, epoch = token.epoch, "lease renewed");
                Ok(())
            }
            Err(e) if e.is_leadership_lost() => {
                self.step_down(&e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!(replica = %self.replica_id, error = %e, "lease renewal failed");
                Err(e)
            }
        }
    }

    /// Issue a write fence, or fail if this replica may no longer write.
    pub fn fence(&self) -> ElectionResult<Fence> {
        let now = self.clock.now_ms();
        let (token, renewed_at_ms) = {
            let session = self.session();
            match &session.token {
                Some(token) => (token.clone(), session.renewed_at_ms),
                None => return Err(ElectionError::NotLeader(self.replica_id.clone())),
            }
        };
        if now.saturating_sub(renewed_at_ms) >= millis(self.config.renew_deadline) {
            let reason = format!("no renewal since {renewed_at_ms}");
            self.step_down(&reason);
            return Err(ElectionError::LeadershipLost(reason));
        }
        Ok(Fence {
            holder: token.replica_id,
            epoch: token.epoch,
            now_ms: now,
        })
    }

    /// Release the lease and sit out the next campaign for
    /// `abdication_cooldown`.
    pub fn abdicate(&self) -> ElectionResult<()> {
        self.release(true)
    }

    /// Release the lease without a cooldown, used on shutdown.
    pub fn resign(&self) -> ElectionResult<()> {
        self.release(false)
    }

    fn release(&self, cooldown: bool) -> ElectionResult<()> {
        let token = self
            .token()
            .ok_or_else(|| ElectionError::NotLeader(self.replica_id.clone()))?;
        let now = self.clock.now_ms();
        if cooldown {
            self.session().cooldown_until_ms = now + millis(self.config.abdication_cooldown);
        }
        self.step_down("released");

        let released = self.store.write(None, |txn| -> ElectionResult<bool> {
            match txn.lease()? {
                Some(lease) if lease.holder == token.replica_id && lease.epoch == token.epoch => {
                    Ok(txn.delete_lease()?)
                }
                _ => Ok(false),
            }
        })?;
        info!(replica = %self.replica_id, epoch = token.epoch, released, cooldown, "leadership released");
        Ok(())
    }

    fn step_down(&self, reason: &str) {
        let previous = self.session().token.take();
        if let Some(token) = previous {
            warn!(replica = %self.replica_id, epoch = token.epoch, %reason, "stepped down");
            self.state_tx.send_replace(LeadershipState::Follower);
        }
    }

    /// Campaign while following, renew while leading, until `shutdown`
    /// fires. A held lease is released on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(replica = %self.replica_id, "election loop started");
        loop {
            let delay = if self.is_leader() {
                if let Err(e) = self.renew() {
                    debug!(replica = %self.replica_id, error = %e, "renew attempt failed");
                }
                self.config.renew_interval
            } else {
                match self.try_acquire() {
                    Ok(Campaign::Elected(_)) => self.config.renew_interval,
                    Ok(Campaign::Following(_)) => self.config.poll_interval,
                    Err(e) => {
                        warn!(replica = %self.replica_id, error = %e, "campaign attempt failed");
                        self.config.poll_interval
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        if self.is_leader() {
            if let Err(e) = self.resign() {
                warn!(replica = %self.replica_id, error = %e, "failed to release lease on shutdown");
            }
        }
        info!(replica = %self.replica_id, "election loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_state::ManualClock;

    fn config() -> ElectionConfig {
        ElectionConfig {
            lease_ttl: Duration::from_millis(1_000),
            renew_interval: Duration::from_millis(200),
            renew_deadline: Duration::from_millis(600),
            poll_interval: Duration::from_millis(100),
            abdication_cooldown: Duration::from_millis(5_000),
        }
    }

    fn pair() -> (Arc<ManualClock>, Election, Election) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let a = Election::new("a", "127.0.0.1:1", store.clone(), clock.clone(), config()).unwrap();
        let b = Election::new("b", "127.0.0.1:2", store, clock.clone(), config()).unwrap();
        (clock, a, b)
    }

    #[test]
    fn first_campaigner_wins_second_follows() {
        let (_, a, b) = pair();

        let Campaign::Elected(token) = a.try_acquire().unwrap() else {
            panic!("a should be elected");
        };
        assert_eq!(token.epoch, 1);

        match b.try_acquire().unwrap() {
            Campaign::Following(Some(leader)) => {
                assert_eq!(leader.replica_id, "a");
                assert_eq!(leader.address, "127.0.0.1:1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(b.current_leader().unwrap().unwrap().replica_id, "a");
    }

    #[test]
    fn renewal_keeps_lease_alive() {
        let (clock, a, b) = pair();
        a.try_acquire().unwrap();

        for _ in 0..10 {
            clock.advance(300);
            a.renew().unwrap();
        }
        assert!(matches!(b.try_acquire().unwrap(), Campaign::Following(Some(_))));
        assert_eq!(a.fence().unwrap().epoch, 1);
    }

    #[test]
    fn expired_lease_is_taken_over_and_old_leader_is_fenced() {
        let (clock, a, b) = pair();
        a.try_acquire().unwrap();
        let stale = a.fence().unwrap();

        clock.advance(1_000);
        let Campaign::Elected(token) = b.try_acquire().unwrap() else {
            panic!("b should take over the expired lease");
        };
        assert_eq!(token.epoch, 2);

        let err = a.renew().unwrap_err();
        assert!(err.is_leadership_lost());
        assert!(!a.is_leader());

        let store_err = a
            .store
            .write(Some(&stale), |txn| txn.set_pending_restore(None))
            .unwrap_err();
        assert!(store_err.is_fenced());
    }

    #[test]
    fn missed_deadline_stops_fences() {
        let (clock, a, _) = pair();
        let mut rx = a.watch();
        a.try_acquire().unwrap();
        assert!(matches!(*rx.borrow_and_update(), LeadershipState::Leader(_)));

        clock.advance(600);
        assert!(a.fence().unwrap_err().is_leadership_lost());
        assert!(!a.is_leader());
        assert_eq!(*rx.borrow_and_update(), LeadershipState::Follower);
    }

    #[test]
    fn abdication_releases_lease_with_cooldown() {
        let (clock, a, b) = pair();
        a.try_acquire().unwrap();
        a.abdicate().unwrap();

        assert!(a.current_leader().unwrap().is_none());
        assert!(matches!(a.try_acquire().unwrap(), Campaign::Following(None)));

        let Campaign::Elected(token) = b.try_acquire().unwrap() else {
            panic!("b should win after abdication");
        };
        assert_eq!(token.epoch, 2);

        b.abdicate().unwrap();
        clock.advance(5_000);
        assert!(matches!(a.try_acquire().unwrap(), Campaign::Elected(_)));
    }

    #[test]
    fn abdicate_requires_leadership() {
        let (_, a, _) = pair();
        assert!(matches!(a.abdicate(), Err(ElectionError::NotLeader(_))));
    }

    #[test]
    fn invalid_config_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let bad = ElectionConfig {
            renew_deadline: Duration::from_secs(60),
            ..config()
        };
        assert!(Election::new("a", "x", store, Arc::new(ManualClock::new(0)), bad).is_err());
    }

    #[tokio::test]
    async fn campaign_returns_observed_leader() {
        let (_, a, b) = pair();
        assert!(matches!(a.campaign().await.unwrap(), Campaign::Elected(_)));
        assert!(matches!(
            b.campaign().await.unwrap(),
            Campaign::Following(Some(LeaderInfo { epoch: 1, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loops_elect_exactly_one_leader() {
        let (_, a, b) = pair();
        let store = a.store.clone();
        let a = Arc::new(a);
        let b = Arc::new(b);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ha = tokio::spawn({
            let a = a.clone();
            let rx = shutdown_rx.clone();
            async move { a.run(rx).await }
        });
        let hb = tokio::spawn({
            let b = b.clone();
            async move { b.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.is_leader() as u8 + b.is_leader() as u8, 1);

        shutdown_tx.send(true).unwrap();
        ha.await.unwrap();
        hb.await.unwrap();
        assert!(store.lease().unwrap().is_none());
    }
}
