use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{EventId, RemoteMessageId, RoomId, UserId},
    protocol::SessionCredential,
};

/// Persisted state of one bridged user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub session: Option<SessionCredential>,
    pub management_room: Option<RoomId>,
}

impl UserRecord {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            session: None,
            management_room: None,
        }
    }
}

/// Maps a remote message id to the event it was bridged as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub user_id: UserId,
    pub remote_id: RemoteMessageId,
    pub room_id: RoomId,
    pub event_id: EventId,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>>;
    /// All records in insertion order.
    async fn all_users(&self) -> Result<Vec<UserRecord>>;
    async fn insert_user(&self, record: &UserRecord) -> Result<()>;
    async fn update_user(&self, record: &UserRecord) -> Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_by_remote_id(
        &self,
        user_id: &UserId,
        remote_id: &RemoteMessageId,
    ) -> Result<Option<MessageRecord>>;
    async fn insert_message(&self, record: &MessageRecord) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

const USER_COLUMNS: &str = "user_id, management_room, client_id, client_token, server_token, \
     enc_key, mac_key, wid";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory connection is its own database.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
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
}

fn user_from_row(row: &SqliteRow) -> Result<UserRecord> {
    let client_id: Option<String> = row.try_get("client_id")?;
    let session = match client_id {
        Some(client_id) => Some(SessionCredential {
            client_id,
            client_token: row
                .try_get::<Option<String>, _>("client_token")?
                .unwrap_or_default(),
            server_token: row
                .try_get::<Option<String>, _>("server_token")?
                .unwrap_or_default(),
            enc_key: row
                .try_get::<Option<Vec<u8>>, _>("enc_key")?
                .unwrap_or_default(),
            mac_key: row
                .try_get::<Option<Vec<u8>>, _>("mac_key")?
                .unwrap_or_default(),
            wid: row.try_get::<Option<String>, _>("wid")?.unwrap_or_default(),
        }),
        None => None,
    };
    let management_room = row
        .try_get::<Option<String>, _>("management_room")?
        .filter(|room| !room.is_empty())
        .map(RoomId);

    Ok(UserRecord {
        user_id: UserId(row.try_get("user_id")?),
        session,
        management_room,
    })
}

#[async_trait]
impl CredentialStore for Storage {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?"))
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load user '{user_id}'"))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await
            .context("failed to list users")?;
        rows.iter().map(user_from_row).collect()
    }

    async fn insert_user(&self, record: &UserRecord) -> Result<()> {
        let session = record.session.as_ref();
        sqlx::query(
            "INSERT INTO users (user_id, management_room, client_id, client_token, server_token,
                                enc_key, mac_key, wid)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.user_id.as_str())
        .bind(record.management_room.as_ref().map(RoomId::as_str))
        .bind(session.map(|s| s.client_id.as_str()))
        .bind(session.map(|s| s.client_token.as_str()))
        .bind(session.map(|s| s.server_token.as_str()))
        .bind(session.map(|s| s.enc_key.as_slice()))
        .bind(session.map(|s| s.mac_key.as_slice()))
        .bind(session.map(|s| s.wid.as_str()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert user '{}'", record.user_id))?;
        Ok(())
    }

    async fn update_user(&self, record: &UserRecord) -> Result<()> {
        let session = record.session.as_ref();
        sqlx::query(
            "UPDATE users
             SET management_room = ?, client_id = ?, client_token = ?, server_token = ?,
                 enc_key = ?, mac_key = ?, wid = ?, updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ?",
        )
        .bind(record.management_room.as_ref().map(RoomId::as_str))
        .bind(session.map(|s| s.client_id.as_str()))
        .bind(session.map(|s| s.client_token.as_str()))
        .bind(session.map(|s| s.server_token.as_str()))
        .bind(session.map(|s| s.enc_key.as_slice()))
        .bind(session.map(|s| s.mac_key.as_slice()))
        .bind(session.map(|s| s.wid.as_str()))
        .bind(record.user_id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update user '{}'", record.user_id))?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn get_by_remote_id(
        &self,
        user_id: &UserId,
        remote_id: &RemoteMessageId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT room_id, event_id FROM messages WHERE user_id = ? AND remote_id = ?",
        )
        .bind(user_id.as_str())
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to look up message '{remote_id}'"))?;
        Ok(row.map(|r| MessageRecord {
            user_id: user_id.clone(),
            remote_id: remote_id.clone(),
            room_id: RoomId(r.get::<String, _>(0)),
            event_id: EventId(r.get::<String, _>(1)),
        }))
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (user_id, remote_id, room_id, event_id) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, remote_id) DO UPDATE
             SET room_id = excluded.room_id, event_id = excluded.event_id",
        )
        .bind(record.user_id.as_str())
        .bind(record.remote_id.as_str())
        .bind(record.room_id.as_str())
        .bind(record.event_id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store mapping for '{}'", record.remote_id))?;
        Ok(())
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
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
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
