//! Per-conversation serialization.
//!
//! DESIGN
//! ======
//! A fixed set of async mutexes striped by the unordered user pair. Every
//! path that mutates a conversation and then broadcasts its recomputed
//! summary (sends in the router, reads in the receipt propagator) holds the
//! stripe across store write, recompute and broadcast. Summaries for one
//! conversation therefore reach sessions in the order the store changed.

use std::sync::Arc;

use events::UserId;
use tokio::sync::{Mutex, MutexGuard};

pub const CONVERSATION_STRIPES: usize = 64;

#[derive(Clone)]
pub struct ConversationLocks {
    stripes: Arc<[Mutex<()>]>,
}

impl Default for ConversationLocks {
    fn default() -> Self {
        Self::new(CONVERSATION_STRIPES)
    }
}

impl ConversationLocks {
    #[must_use]
    pub fn new(stripe_count: usize) -> Self {
        let stripes: Vec<Mutex<()>> = (0..stripe_count.max(1)).map(|_| Mutex::new(())).collect();
        Self { stripes: stripes.into() }
    }

    /// Lock the conversation between `a` and `b`. Argument order is irrelevant.
    pub async fn lock(&self, a: UserId, b: UserId) -> MutexGuard<'_, ()> {
        self.stripes[self.index(a, b)].lock().await
    }

    fn index(&self, a: UserId, b: UserId) -> usize {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mixed = lo.as_u128() ^ hi.as_u128().rotate_left(64);
        usize::try_from(mixed % self.stripes.len() as u128).unwrap_or(0)
    }
}
