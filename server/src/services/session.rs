//! Session tokens and WS tickets: the handshake identity collaborator.
//!
//! ARCHITECTURE
//! ============
//! HTTP auth uses long-lived session tokens, while websocket upgrades prefer
//! one-time short-lived tickets so browsers never put a session token in a
//! query string. Resolution sits behind [`IdentityResolver`]; Postgres backs
//! production and [`StaticIdentity`] backs development mode and tests.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to guarantee
//! single use; this favors replay safety over reconnect convenience.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use events::UserId;
use rand::Rng;
use sqlx::{PgPool, Row};

use crate::event::ErrorCode;

/// Lifetime of tickets issued by [`StaticIdentity`]; matches the table default.
pub const TICKET_TTL: Duration = Duration::from_secs(60);

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a short-lived 16-byte hex WS ticket.
#[must_use]
pub(crate) fn generate_ws_ticket() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("identity lookup failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// The user owning a live session token.
    async fn resolve_token(&self, token: &str) -> Result<Option<UserId>, AuthError>;

    /// Issue a single-use websocket ticket for `user_id`.
    async fn issue_ticket(&self, user_id: UserId) -> Result<String, AuthError>;

    /// Consume a ticket, returning its user if it was valid and unexpired.
    async fn consume_ticket(&self, ticket: &str) -> Result<Option<UserId>, AuthError>;
}

/// Resolver backed by the `sessions` and `ws_tickets` tables.
pub struct PgIdentity {
    pool: PgPool,
}

impl PgIdentity {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityResolver for PgIdentity {
    async fn resolve_token(&self, token: &str) -> Result<Option<UserId>, AuthError> {
        let row = sqlx::query("SELECT user_id FROM sessions WHERE token = $1 AND expires_at > now()")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("user_id")))
    }

    async fn issue_ticket(&self, user_id: UserId) -> Result<String, AuthError> {
        let ticket = generate_ws_ticket();
        sqlx::query("INSERT INTO ws_tickets (ticket, user_id) VALUES ($1, $2)")
            .bind(&ticket)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(ticket)
    }

    async fn consume_ticket(&self, ticket: &str) -> Result<Option<UserId>, AuthError> {
        let row = sqlx::query("DELETE FROM ws_tickets WHERE ticket = $1 AND expires_at > now() RETURNING user_id")
            .bind(ticket)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("user_id")))
    }
}

/// Fixed token table with in-memory tickets.
pub struct StaticIdentity {
    tokens: HashMap<String, UserId>,
    tickets: Mutex<HashMap<String, (UserId, Instant)>>,
    ticket_ttl: Duration,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(tokens: impl IntoIterator<Item = (String, UserId)>) -> Self {
        Self { tokens: tokens.into_iter().collect(), tickets: Mutex::new(HashMap::new()), ticket_ttl: TICKET_TTL }
    }

    #[must_use]
    pub fn with_ticket_ttl(mut self, ttl: Duration) -> Self {
        self.ticket_ttl = ttl;
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve_token(&self, token: &str) -> Result<Option<UserId>, AuthError> {
        Ok(self.tokens.get(token).copied())
    }

    async fn issue_ticket(&self, user_id: UserId) -> Result<String, AuthError> {
        let ticket = generate_ws_ticket();
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        tickets.retain(|_, (_, expires)| *expires > now);
        tickets.insert(ticket.clone(), (user_id, now + self.ticket_ttl));
        Ok(ticket)
    }

    async fn consume_ticket(&self, ticket: &str) -> Result<Option<UserId>, AuthError> {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tickets
            .remove(ticket)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(user_id, _)| user_id))
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
