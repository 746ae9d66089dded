//! Distributed leader election so only one replica runs the background
//! services (Symbol Collector, Market Data Consumer, snapshot jobs) even
//! during a rolling deployment where multiple replicas are briefly up.

use crate::database::DatabaseManager;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct LeaderElection {
    db: Arc<DatabaseManager>,
    service: String,
    instance_id: String,
    lease_duration_secs: u64,
    heartbeat_interval_secs: u64,
    retry_interval_secs: u64,
    is_leader: AtomicBool,
}

impl LeaderElection {
    pub fn new(
        db: Arc<DatabaseManager>,
        service: impl Into<String>,
        lease_duration_secs: u64,
        heartbeat_interval_secs: u64,
        retry_interval_secs: u64,
    ) -> Self {
        Self {
            db,
            service: service.into(),
            instance_id: Uuid::new_v4().to_string(),
            lease_duration_secs,
            heartbeat_interval_secs,
            retry_interval_secs,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn try_become_leader(&self) -> bool {
        match self
            .db
            .redis
            .try_acquire_leadership(&self.service, &self.instance_id, self.lease_duration_secs)
            .await
        {
            Ok(true) => {
                info!(instance = %short(&self.instance_id), service = %self.service, "became leader");
                self.is_leader.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => {
                self.is_leader.store(false, Ordering::SeqCst);
                false
            }
            Err(e) => {
                warn!("leader election attempt failed: {e}");
                false
            }
        }
    }

    async fn renew(&self) -> bool {
        match self
            .db
            .redis
            .renew_leadership(&self.service, &self.instance_id, self.lease_duration_secs)
            .await
        {
            Ok(renewed) => {
                self.is_leader.store(renewed, Ordering::SeqCst);
                renewed
            }
            Err(e) => {
                error!("leadership renewal failed: {e}");
                self.is_leader.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// `retry_interval_secs` jittered to [0.8x, 1.2x] so a fleet-wide restart
    /// doesn't have every non-leader retry acquisition in lockstep.
    fn jittered_retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval_secs as f64 * jitter_factor())
    }

    pub async fn release(&self) {
        if self.is_leader.load(Ordering::SeqCst) {
            if let Err(e) = self.db.redis.release_leadership(&self.service, &self.instance_id).await {
                warn!("failed to release leadership cleanly: {e}");
            }
            self.is_leader.store(false, Ordering::SeqCst);
            info!(instance = %short(&self.instance_id), "released leadership");
        }
    }

    /// Blocks until this instance becomes leader (retrying every
    /// `retry_interval_secs`), then runs `task` while renewing the lease at
    /// `heartbeat_interval_secs`. Loss of leadership mid-run produces no
    /// user-visible error — it cancels `task` and returns so the caller can
    /// retry the whole cycle.
    pub async fn run_as_leader<F, Fut>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        while !self.try_become_leader().await {
            tokio::time::sleep(self.jittered_retry_interval()).await;
        }

        let heartbeat_self = self.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(heartbeat_self.heartbeat_interval_secs)).await;
                if !heartbeat_self.renew().await {
                    warn!("lost leadership, stopping heartbeat");
                    break;
                }
                debug!("leadership lease renewed");
            }
        });

        let self_for_task = self.clone();
        tokio::select! {
            _ = task(self_for_task) => {}
            _ = heartbeat => {}
        }

        self.release().await;
    }
}

fn short(instance_id: &str) -> &str {
    &instance_id[..8.min(instance_id.len())]
}

fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(0.8..=1.2)
}

#[cfg(test)]
mod tests {
    use super::{jitter_factor, short};

    #[test]
    fn short_truncates_to_eight_chars() {
        assert_eq!(short("abcdefghij"), "abcdefgh");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn jitter_factor_stays_within_spec_bounds() {
        for _ in 0..1000 {
            let factor = jitter_factor();
            assert!((0.8..=1.2).contains(&factor));
        }
    }
}
