use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{ClientNonce, MessageId, MessageKind, RoomId, RoomKind, UserId, UserRole},
    protocol::MessageBody,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub role: UserRole,
}

#[derive(Debug, Clone)]
pub struct StoredRoom {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub creator_id: UserId,
    pub context_ref: Option<String>,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: MessageBody,
    pub client_nonce: Option<ClientNonce>,
    pub created_at: DateTime<Utc>,
}

/// Canonical dedup key for a private room: unordered user pair plus context.
/// A missing context is its own bucket ("contact generally" and "contact
/// about booking X" are distinct rooms).
pub fn private_pair_key(a: UserId, b: UserId, context_ref: Option<&str>) -> String {
    let (low, high) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
    format!("{low}:{high}:{}", context_ref.unwrap_or("-"))
}

fn role_to_str(role: UserRole) -> &'static str {
    match role {
        UserRole::Customer => "customer",
        UserRole::Owner => "owner",
        UserRole::Admin => "admin",
    }
}

fn role_from_str(raw: &str) -> UserRole {
    match raw {
        "owner" => UserRole::Owner,
        "admin" => UserRole::Admin,
        _ => UserRole::Customer,
    }
}

fn room_kind_to_str(kind: RoomKind) -> &'static str {
    match kind {
        RoomKind::Private => "private",
        RoomKind::Group => "group",
        RoomKind::Public => "public",
    }
}

fn room_kind_from_str(raw: &str) -> RoomKind {
    match raw {
        "group" => RoomKind::Group,
        "public" => RoomKind::Public,
        _ => RoomKind::Private,
    }
}

fn message_kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::File => "file",
        MessageKind::System => "system",
    }
}

fn room_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredRoom {
    StoredRoom {
        room_id: RoomId(row.get::<i64, _>(0)),
        kind: room_kind_from_str(row.get::<String, _>(1).as_str()),
        creator_id: UserId(row.get::<i64, _>(2)),
        context_ref: row.get::<Option<String>, _>(3),
        last_message_id: row.get::<Option<i64>, _>(4).map(MessageId),
        created_at: row.get::<DateTime<Utc>, _>(5),
        updated_at: row.get::<DateTime<Utc>, _>(6),
    }
}

const ROOM_COLUMNS: &str =
    "id, kind, creator_user_id, context_ref, last_message_id, created_at, updated_at";

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    let body: MessageBody = serde_json::from_str(row.get::<String, _>(4).as_str())
        .context("stored message body is not valid JSON")?;
    let client_nonce = row
        .get::<Option<String>, _>(5)
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .context("stored client nonce is not a valid uuid")?
        .map(ClientNonce);
    Ok(StoredMessage {
        message_id: MessageId(row.get::<i64, _>(0)),
        room_id: RoomId(row.get::<i64, _>(1)),
        sender_id: UserId(row.get::<i64, _>(2)),
        kind: body.kind(),
        body,
        client_nonce,
        created_at: row.get::<DateTime<Utc>, _>(6),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, room_id, sender_user_id, kind, body, client_nonce, created_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        display_name: &str,
        avatar_ref: Option<&str>,
        role: UserRole,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (display_name, avatar_ref, role) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(display_name)
        .bind(avatar_ref)
        .bind(role_to_str(role))
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, display_name, avatar_ref, role FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            display_name: r.get::<String, _>(1),
            avatar_ref: r.get::<Option<String>, _>(2),
            role: role_from_str(r.get::<String, _>(3).as_str()),
        }))
    }

    /// Atomic insert-if-absent on the canonical pair key. Under concurrent
    /// creation attempts for the same pair+context exactly one row wins; the
    /// loser re-selects the winner's room. Returns `(room, created)`.
    pub async fn find_or_create_private_room(
        &self,
        creator_id: UserId,
        other_id: UserId,
        context_ref: Option<&str>,
    ) -> Result<(StoredRoom, bool)> {
        let pair_key = private_pair_key(creator_id, other_id, context_ref);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO rooms (kind, creator_user_id, context_ref, pair_key)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(pair_key) DO NOTHING",
        )
        .bind(room_kind_to_str(RoomKind::Private))
        .bind(creator_id.0)
        .bind(context_ref)
        .bind(&pair_key)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let row = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE pair_key = ?"
        ))
        .bind(&pair_key)
        .fetch_one(&mut *tx)
        .await?;
        let room = room_from_row(&row);

        if inserted {
            for user_id in [creator_id, other_id] {
                sqlx::query(
                    "INSERT OR IGNORE INTO room_participants (room_id, user_id) VALUES (?, ?)",
                )
                .bind(room.room_id.0)
                .bind(user_id.0)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok((room, inserted))
    }

    pub async fn private_room_for_pair(
        &self,
        a: UserId,
        b: UserId,
        context_ref: Option<&str>,
    ) -> Result<Option<StoredRoom>> {
        let pair_key = private_pair_key(a, b, context_ref);
        let row = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE pair_key = ?"
        ))
        .bind(&pair_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(room_from_row))
    }

    pub async fn room(&self, room_id: RoomId) -> Result<Option<StoredRoom>> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"))
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(room_from_row))
    }

    pub async fn list_rooms_for_user(&self, user_id: UserId) -> Result<Vec<StoredRoom>> {
        let rows = sqlx::query(
            "SELECT r.id, r.kind, r.creator_user_id, r.context_ref, r.last_message_id,
                    r.created_at, r.updated_at
             FROM rooms r
             INNER JOIN room_participants p ON p.room_id = r.id
             WHERE p.user_id = ?
             ORDER BY r.updated_at DESC, r.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(room_from_row).collect())
    }

    pub async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM room_participants WHERE room_id = ? AND user_id = ?",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn participants_for_room(&self, room_id: RoomId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM room_participants WHERE room_id = ? ORDER BY user_id ASC",
        )
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    pub async fn add_participants(&self, room_id: RoomId, user_ids: &[UserId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for user_id in user_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO room_participants (room_id, user_id) VALUES (?, ?)",
            )
            .bind(room_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Leaving only removes the membership row; the room and its history are
    /// preserved for the remaining participant(s).
    pub async fn remove_participant(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM room_participants WHERE room_id = ? AND user_id = ?",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed > 0)
    }

    /// Appends a message and bumps the owning room's last-message pointer in
    /// one transaction. `id` and `created_at` are assigned here, never by the
    /// client, so the per-room total order is authoritative.
    pub async fn append_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        body: &MessageBody,
        client_nonce: Option<ClientNonce>,
    ) -> Result<StoredMessage> {
        let body_json = serde_json::to_string(body)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO messages (room_id, sender_user_id, kind, body, client_nonce)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(room_id.0)
        .bind(sender_id.0)
        .bind(message_kind_to_str(body.kind()))
        .bind(&body_json)
        .bind(client_nonce.map(|n| n.0.to_string()))
        .fetch_one(&mut *tx)
        .await?;
        let message = message_from_row(&row)?;

        sqlx::query(
            "UPDATE rooms SET last_message_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(message.message_id.0)
        .bind(room_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Keyset pagination: the newest page when `before` is absent, otherwise
    /// the page immediately preceding `before`. Rows come back ascending.
    pub async fn list_room_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = if let Some(before_id) = before {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ? AND id < ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(room_id.0)
            .bind(before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(room_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    pub async fn read_by_for_message(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM message_reads WHERE message_id = ? ORDER BY user_id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    /// Stamps `user_id` on every unread message in the room that the user did
    /// not send, returning the newly stamped ids. Already-stamped messages
    /// are skipped, so re-marking is a no-op and `read_by` only grows.
    pub async fn mark_room_read(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Vec<MessageId>> {
        let rows = sqlx::query(
            "INSERT INTO message_reads (message_id, user_id)
             SELECT m.id, ?1 FROM messages m
             WHERE m.room_id = ?2
               AND m.sender_user_id != ?1
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?1
               )
             RETURNING message_id",
        )
        .bind(user_id.0)
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut stamped: Vec<MessageId> = rows
            .into_iter()
            .map(|r| MessageId(r.get::<i64, _>(0)))
            .collect();
        stamped.sort_by_key(|id| id.0);
        Ok(stamped)
    }

    pub async fn unread_count(&self, room_id: RoomId, user_id: UserId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             WHERE m.room_id = ?2
               AND m.sender_user_id != ?1
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?1
               )",
        )
        .bind(user_id.0)
        .bind(room_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
