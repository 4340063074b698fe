mod config;
mod db;
mod event;
mod rate_limit;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::services::attachments::{HttpObjectStorage, ObjectStorage};
use crate::services::session::{IdentityResolver, PgIdentity, StaticIdentity};
use crate::store::{MemoryMessageStore, MessageStore, PgMessageStore, UserProfile};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().expect("invalid configuration");

    let (store, identity): (Arc<dyn MessageStore>, Arc<dyn IdentityResolver>) = match &config.database_url {
        Some(database_url) => {
            let pool = db::init_pool(database_url, config.db_max_connections)
                .await
                .expect("database init failed");
            (Arc::new(PgMessageStore::new(pool.clone())), Arc::new(PgIdentity::new(pool)))
        }
        None => {
            tracing::warn!(dev_users = config.dev_users.len(), "DATABASE_URL not set, using in-memory store");
            let store = MemoryMessageStore::with_users(
                config
                    .dev_users
                    .iter()
                    .map(|u| UserProfile { id: u.id, name: u.name.clone(), avatar_url: None }),
            );
            let identity = StaticIdentity::new(config.dev_users.iter().map(|u| (u.token.clone(), u.id)));
            (Arc::new(store), Arc::new(identity))
        }
    };

    // Uploads are optional: the endpoint answers 503 without storage.
    let storage: Option<Arc<dyn ObjectStorage>> = match config.storage.clone() {
        Some(storage_config) => match HttpObjectStorage::new(storage_config) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "object storage client failed, uploads disabled");
                None
            }
        },
        None => {
            tracing::warn!("STORAGE_* not configured, uploads disabled");
            None
        }
    };

    let port = config.port;
    let channel = config.channel;
    let state = state::AppState::new(config, store, identity, storage);

    let _sweeper =
        services::heartbeat::spawn_idle_sweeper(state.registry.clone(), state.rate_limiter.clone(), channel);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "chat server listening");
    axum::serve(listener, app).await.expect("server failed");
}
