//! Session Registry: live connections per user.
//!
//! DESIGN
//! ======
//! Users map to shards by id; each shard is an `RwLock` over
//! `user -> connection -> outbound queue`. Registration and removal in one
//! shard never block delivery in another, and broadcast holds only a read
//! lock while it `try_send`s into bounded per-connection queues.
//!
//! DELIVERY
//! ========
//! A full queue drops the event for that connection only and evicts the
//! connection: dropping the registry's sender closes the queue, the
//! connection task notices and closes the socket, and the client refetches
//! on reconnect. A closed queue means the task already exited. Both kinds of
//! dead connection are removed lazily by the broadcast that found them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use events::{OutboundEvent, UserId};
use tokio::sync::{RwLock, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Identifies one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

/// Why an event could not be queued for a connection. Logged, never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

struct Connection {
    tx: mpsc::Sender<OutboundEvent>,
    last_seen: Instant,
}

type Shard = RwLock<HashMap<UserId, HashMap<ConnectionId, Connection>>>;

#[derive(Clone)]
pub struct SessionRegistry {
    shards: Arc<[Shard]>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let shards: Vec<Shard> = (0..shard_count.max(1)).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards: shards.into() }
    }

    fn shard(&self, user_id: UserId) -> &Shard {
        let len = self.shards.len() as u128;
        let index = usize::try_from(user_id.as_u128() % len).unwrap_or(0);
        &self.shards[index]
    }

    /// Add a connection for `user_id`. Registering never disturbs the
    /// user's other connections.
    pub async fn register(&self, user_id: UserId, tx: mpsc::Sender<OutboundEvent>) -> SessionHandle {
        let handle = SessionHandle { user_id, connection_id: Uuid::new_v4() };
        let mut shard = self.shard(user_id).write().await;
        let sessions = shard.entry(user_id).or_default();
        sessions.insert(handle.connection_id, Connection { tx, last_seen: Instant::now() });
        info!(%user_id, connection_id = %handle.connection_id, sessions = sessions.len(), "registry: connection registered");
        handle
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub async fn deregister(&self, handle: SessionHandle) -> bool {
        let mut shard = self.shard(handle.user_id).write().await;
        let removed = remove_connection(&mut shard, handle.user_id, handle.connection_id);
        if removed {
            info!(user_id = %handle.user_id, connection_id = %handle.connection_id, "registry: connection deregistered");
        }
        removed
    }

    /// Connection ids currently registered for `user_id`.
    pub async fn connections_for(&self, user_id: UserId) -> Vec<ConnectionId> {
        let shard = self.shard(user_id).read().await;
        shard
            .get(&user_id)
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_registered(&self, handle: SessionHandle) -> bool {
        let shard = self.shard(handle.user_id).read().await;
        shard
            .get(&handle.user_id)
            .is_some_and(|sessions| sessions.contains_key(&handle.connection_id))
    }

    /// Record activity on a connection. Returns `false` if it was evicted.
    pub async fn heartbeat(&self, handle: SessionHandle) -> bool {
        let mut shard = self.shard(handle.user_id).write().await;
        let Some(conn) = shard
            .get_mut(&handle.user_id)
            .and_then(|sessions| sessions.get_mut(&handle.connection_id))
        else {
            return false;
        };
        conn.last_seen = Instant::now();
        true
    }

    /// Queue `event` on every live connection of `user_id`.
    ///
    /// Users with no connections are a no-op; the event is already durable.
    pub async fn broadcast(&self, user_id: UserId, event: &OutboundEvent) -> Delivery {
        let mut report = Delivery::default();
        let mut dead: Vec<(ConnectionId, DeliveryFailure)> = Vec::new();
        {
            let shard = self.shard(user_id).read().await;
            let Some(sessions) = shard.get(&user_id) else {
                return report;
            };
            for (connection_id, conn) in sessions {
                match conn.tx.try_send(event.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => dead.push((*connection_id, DeliveryFailure::QueueFull)),
                    Err(TrySendError::Closed(_)) => dead.push((*connection_id, DeliveryFailure::Closed)),
                }
            }
        }

        if !dead.is_empty() {
            report.dropped = dead.len();
            let mut shard = self.shard(user_id).write().await;
            for (connection_id, failure) in dead {
                warn!(%user_id, %connection_id, kind = event.kind(), error = %failure, "registry: delivery failed, evicting connection");
                remove_connection(&mut shard, user_id, connection_id);
            }
        }
        debug!(%user_id, kind = event.kind(), delivered = report.delivered, dropped = report.dropped, "registry: broadcast");
        report
    }

    /// Deregister every connection idle longer than `idle_timeout`.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Vec<SessionHandle> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.write().await;
            shard.retain(|user_id, sessions| {
                sessions.retain(|connection_id, conn| {
                    let idle = now.saturating_duration_since(conn.last_seen) > idle_timeout;
                    if idle {
                        evicted.push(SessionHandle { user_id: *user_id, connection_id: *connection_id });
                    }
                    !idle
                });
                !sessions.is_empty()
            });
        }
        for handle in &evicted {
            info!(user_id = %handle.user_id, connection_id = %handle.connection_id, "registry: idle connection evicted");
        }
        evicted
    }

    /// Total registered connections across all shards.
    pub async fn connection_count(&self) -> usize {
        let mut total = 0;
        for shard in self.shards.iter() {
            total += shard.read().await.values().map(HashMap::len).sum::<usize>();
        }
        total
    }
}

fn remove_connection(
    shard: &mut HashMap<UserId, HashMap<ConnectionId, Connection>>,
    user_id: UserId,
    connection_id: ConnectionId,
) -> bool {
    let Some(sessions) = shard.get_mut(&user_id) else {
        return false;
    };
    let removed = sessions.remove(&connection_id).is_some();
    if sessions.is_empty() {
        shard.remove(&user_id);
    }
    removed
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
