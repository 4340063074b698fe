use super::*;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test]
async fn sweep_once_evicts_idle_connection_and_closes_its_queue() {
    let registry = SessionRegistry::new(2);
    let limiter = RateLimiter::default();
    let (stale_tx, mut stale_rx) = mpsc::channel(1);
    let (live_tx, _live_rx) = mpsc::channel(1);
    let stale = registry.register(Uuid::new_v4(), stale_tx).await;
    let live = registry.register(Uuid::new_v4(), live_tx).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    registry.heartbeat(live).await;

    assert_eq!(sweep_once(&registry, &limiter, Duration::from_millis(30)).await, 1);

    assert!(!registry.is_registered(stale).await);
    assert!(registry.is_registered(live).await);
    // The registry held the only sender, so the task side sees the close.
    assert!(stale_rx.recv().await.is_none());
}

#[tokio::test]
async fn spawned_sweeper_runs_on_its_interval() {
    let registry = SessionRegistry::new(1);
    let (tx, _rx) = mpsc::channel(1);
    let handle = registry.register(Uuid::new_v4(), tx).await;

    let channel = ChannelConfig {
        sweep_interval: Duration::from_millis(20),
        idle_timeout: Duration::from_millis(10),
        ..ChannelConfig::default()
    };
    let sweeper = spawn_idle_sweeper(registry.clone(), RateLimiter::default(), channel);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!registry.is_registered(handle).await);
    sweeper.abort();
}
