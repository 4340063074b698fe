//! Postgres-backed message store.
//!
//! Ids come from the `messages.id` BIGSERIAL and timestamps from the column
//! default, so both are assigned by the database inside the insert.

use async_trait::async_trait;
use events::{ChatMessage, ConversationSummary, MessageId, MessageKind, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{MessageStore, NewMessage, StoreError, UserProfile, sort_by_activity, summarize};

const FOREIGN_KEY_VIOLATION: &str = "23503";

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, message_type, file_url, file_size, file_type, ts, is_read";

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn profile(&self, id: UserId) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query("SELECT id, name, avatar_url FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserProfile { id: r.get("id"), name: r.get("name"), avatar_url: r.get("avatar_url") }))
    }

    async fn unread_from(&self, reader: UserId, counterpart: UserId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE sender_id = $1 AND receiver_id = $2 AND NOT is_read",
        )
        .bind(counterpart)
        .bind(reader)
        .fetch_one(&self.pool)
        .await?;
        Ok(count_to_u64(count))
    }
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage, StoreError> {
    let kind: String = row.get("message_type");
    let message_type =
        MessageKind::parse(&kind).ok_or_else(|| StoreError::Corrupt(format!("unknown message_type {kind:?}")))?;
    Ok(ChatMessage {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        content: row.get("content"),
        message_type,
        file_url: row.get("file_url"),
        file_size: row.get("file_size"),
        file_type: row.get("file_type"),
        timestamp: row.get("ts"),
        is_read: row.get("is_read"),
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert_message(&self, new: NewMessage) -> Result<ChatMessage, StoreError> {
        let sql = format!(
            "INSERT INTO messages (sender_id, receiver_id, content, message_type, file_url, file_size, file_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {MESSAGE_COLUMNS}"
        );
        let result = sqlx::query(&sql)
            .bind(new.sender_id)
            .bind(new.receiver_id)
            .bind(&new.content)
            .bind(new.kind.as_str())
            .bind(&new.file_url)
            .bind(new.file_size)
            .bind(&new.file_type)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => message_from_row(&row),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                // The sender is authenticated, so a dangling key is the receiver.
                Err(StoreError::UnknownUser(new.receiver_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn history(
        &self,
        user: UserId,
        counterpart: UserId,
        after_id: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let between = "((sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1))";
        let rows = match after_id {
            Some(after) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE {between} AND id > $3
                     ORDER BY id ASC LIMIT $4"
                );
                sqlx::query(&sql)
                    .bind(user)
                    .bind(counterpart)
                    .bind(after)
                    .bind(limit_param(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT * FROM (
                         SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE {between}
                         ORDER BY id DESC LIMIT $3
                     ) newest ORDER BY id ASC"
                );
                sqlx::query(&sql)
                    .bind(user)
                    .bind(counterpart)
                    .bind(limit_param(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(message_from_row).collect()
    }

    async fn conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError> {
        // Latest message per counterpart joined with an unread count. The
        // inner join on users drops counterparts without a profile row.
        let rows = sqlx::query(
            r"WITH latest AS (
                  SELECT DISTINCT ON (counterpart) *
                  FROM (
                      SELECT m.*,
                             CASE WHEN m.sender_id = $1 THEN m.receiver_id ELSE m.sender_id END AS counterpart
                      FROM messages m
                      WHERE m.sender_id = $1 OR m.receiver_id = $1
                  ) mine
                  ORDER BY counterpart, id DESC
              ),
              unread AS (
                  SELECT sender_id AS counterpart, COUNT(*) AS unread
                  FROM messages
                  WHERE receiver_id = $1 AND NOT is_read
                  GROUP BY sender_id
              )
              SELECT l.id, l.sender_id, l.receiver_id, l.content, l.message_type, l.file_url,
                     l.file_size, l.file_type, l.ts, l.is_read,
                     u.id AS user_id, u.name, u.avatar_url,
                     COALESCE(r.unread, 0) AS unread
              FROM latest l
              JOIN users u ON u.id = l.counterpart
              LEFT JOIN unread r ON r.counterpart = l.counterpart",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let last = message_from_row(row)?;
            let profile = UserProfile { id: row.get("user_id"), name: row.get("name"), avatar_url: row.get("avatar_url") };
            let unread: i64 = row.get("unread");
            out.push(summarize(user, &last, &profile, count_to_u64(unread)));
        }
        sort_by_activity(&mut out);
        Ok(out)
    }

    async fn conversation(&self, user: UserId, counterpart: UserId) -> Result<Option<ConversationSummary>, StoreError> {
        let Some(profile) = self.profile(counterpart).await? else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1)
             ORDER BY id DESC LIMIT 1"
        );
        let Some(row) = sqlx::query(&sql)
            .bind(user)
            .bind(counterpart)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let last = message_from_row(&row)?;
        let unread = self.unread_from(user, counterpart).await?;
        Ok(Some(summarize(user, &last, &profile, unread)))
    }

    async fn mark_read(&self, reader: UserId, counterpart: UserId, up_to: MessageId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = TRUE
             WHERE sender_id = $1 AND receiver_id = $2 AND id <= $3 AND NOT is_read",
        )
        .bind(counterpart)
        .bind(reader)
        .bind(up_to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unread_total(&self, user: UserId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE receiver_id = $1 AND NOT is_read")
            .bind(user)
            .fetch_one(&self.pool)
            .await?;
        Ok(count_to_u64(count))
    }

    async fn latest_from(&self, sender: UserId, receiver: UserId) -> Result<Option<MessageId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM messages WHERE sender_id = $1 AND receiver_id = $2")
            .bind(sender)
            .bind(receiver)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
