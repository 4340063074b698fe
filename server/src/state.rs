//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! wires the message store and identity resolver into the registry, the
//! aggregator, the router and the receipt propagator so every entry point
//! (websocket or REST) goes through the same service instances.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::services::aggregator::ConversationAggregator;
use crate::services::attachments::ObjectStorage;
use crate::services::locks::ConversationLocks;
use crate::services::receipts::ReadReceiptPropagator;
use crate::services::registry::SessionRegistry;
use crate::services::router::MessageRouter;
use crate::services::session::IdentityResolver;
use crate::store::MessageStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub identity: Arc<dyn IdentityResolver>,
    /// Upload collaborator. `None` disables `/api/chat/upload`.
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub registry: SessionRegistry,
    pub aggregator: ConversationAggregator,
    pub router: MessageRouter,
    pub receipts: ReadReceiptPropagator,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityResolver>,
        storage: Option<Arc<dyn ObjectStorage>>,
    ) -> Self {
        let registry = SessionRegistry::new(config.channel.registry_shards);
        let aggregator = ConversationAggregator::new(store.clone());
        let rate_limiter = RateLimiter::new(config.send_rate);
        let locks = ConversationLocks::default();
        let router = MessageRouter::new(
            store.clone(),
            registry.clone(),
            aggregator.clone(),
            rate_limiter.clone(),
            config.limits,
            locks.clone(),
        );
        let receipts = ReadReceiptPropagator::new(store.clone(), registry.clone(), aggregator.clone(), locks);
        Self {
            store,
            identity,
            storage,
            registry,
            aggregator,
            router,
            receipts,
            rate_limiter,
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
