//! Idle sweeper: evicts connections that stopped answering.
//!
//! Connection tasks refresh their registry heartbeat on every inbound frame
//! and close themselves when idle. The sweeper is the backstop for tasks that
//! are stuck: evicting the entry drops the registry's queue sender, which
//! ends the task's outbound loop.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::config::ChannelConfig;
use crate::rate_limit::RateLimiter;
use crate::services::registry::SessionRegistry;

/// Spawn the background sweeper. Returns a handle for shutdown.
pub fn spawn_idle_sweeper(registry: SessionRegistry, limiter: RateLimiter, channel: ChannelConfig) -> JoinHandle<()> {
    info!(
        sweep_secs = channel.sweep_interval.as_secs(),
        idle_timeout_secs = channel.idle_timeout.as_secs(),
        "idle sweeper configured"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(channel.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_once(&registry, &limiter, channel.idle_timeout).await;
        }
    })
}

/// One sweep pass. Returns how many connections were evicted.
pub async fn sweep_once(registry: &SessionRegistry, limiter: &RateLimiter, idle_timeout: Duration) -> usize {
    let evicted = registry.sweep_idle(idle_timeout).await;
    limiter.prune_idle();
    if !evicted.is_empty() {
        info!(evicted = evicted.len(), "idle sweeper: evicted connections");
    }
    evicted.len()
}

#[cfg(test)]
#[path = "heartbeat_test.rs"]
mod tests;
