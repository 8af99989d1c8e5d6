//! Periodic removal of idle and over-age sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub interval: Duration,
    pub inactivity_limit: Duration,
    pub lifetime_limit: Duration,
}

impl ExpiryPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            interval: config.gc_interval(),
            inactivity_limit: config.inactivity_limit(),
            lifetime_limit: config.lifetime_limit(),
        }
    }
}

/// Start the sweeper. It runs until the returned handle is aborted.
pub fn spawn(orchestrator: Arc<Orchestrator>, policy: ExpiryPolicy) -> JoinHandle<()> {
    info!(
        interval = ?policy.interval,
        inactivity_limit = ?policy.inactivity_limit,
        lifetime_limit = ?policy.lifetime_limit,
        "Starting session sweeper"
    );
    tokio::spawn(async move {
        let mut ticker = interval(policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = orchestrator.sweep(Instant::now(), policy.inactivity_limit, policy.lifetime_limit);
            if removed > 0 {
                info!(removed, remaining = orchestrator.registry().len(), "Expired sessions removed");
            } else {
                debug!("No expired sessions");
            }
        }
    })
}
