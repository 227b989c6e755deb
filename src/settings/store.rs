//! SQLite-backed settings store.

use crate::error::{DbError, Result};
use crate::settings::{BlacklistEntry, LoggedMessage, SettingsStore};
use crate::{ChannelId, ConversationId, UserId};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, Sqlite, SqlitePool};
use std::path::Path;

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS guilds (
        server_id TEXT PRIMARY KEY,
        channel_id TEXT,
        model TEXT,
        temperature REAL,
        instructions TEXT,
        opt_in INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blacklist (
        user_id TEXT PRIMARY KEY,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL,
        author_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
];

/// Settings store over a SQLite pool. Platform ids are stored as text.
#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    /// Open (creating if needed) the database file and prepare the schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqliteConnect)?;

        let store = Self::new(pool);
        store.prepare_schema().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn prepare_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(DbError::Schema)?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn guild_column<T>(&self, conversation_id: ConversationId, column: &str) -> Result<Option<T>>
    where
        T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite> + Send + Unpin,
    {
        let sql = format!("SELECT {column} FROM guilds WHERE server_id = ?");
        let value: Option<Option<T>> = sqlx::query_scalar(&sql)
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.flatten())
    }

    async fn upsert_guild_column<T>(
        &self,
        conversation_id: ConversationId,
        column: &str,
        value: T,
    ) -> Result<()>
    where
        T: for<'q> sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite> + Send + 'static,
    {
        let sql = format!(
            "INSERT INTO guilds (server_id, {column}) VALUES (?, ?) \
             ON CONFLICT(server_id) DO UPDATE SET {column} = excluded.{column}"
        );
        sqlx::query(&sql)
            .bind(conversation_id.to_string())
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn blacklist_size(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blacklist")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait::async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn target_channel(&self, conversation_id: ConversationId) -> Result<Option<ChannelId>> {
        let channel: Option<String> = self.guild_column(conversation_id, "channel_id").await?;
        Ok(channel.and_then(|id| id.parse().ok()))
    }

    async fn model(&self, conversation_id: ConversationId) -> Result<Option<String>> {
        self.guild_column(conversation_id, "model").await
    }

    async fn temperature(&self, conversation_id: ConversationId) -> Result<Option<f32>> {
        let temperature: Option<f64> = self.guild_column(conversation_id, "temperature").await?;
        Ok(temperature.map(|value| value as f32))
    }

    async fn instructions(&self, conversation_id: ConversationId) -> Result<Option<String>> {
        self.guild_column(conversation_id, "instructions").await
    }

    async fn opt_status(&self, conversation_id: ConversationId) -> Result<Option<bool>> {
        self.guild_column(conversation_id, "opt_in").await
    }

    async fn is_blacklisted(&self, user_id: UserId) -> Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM blacklist WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn record_message(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (server_id, author_id, channel_id, content) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(author_id.to_string())
        .bind(channel_id.to_string())
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_target_channel(
        &self,
        conversation_id: ConversationId,
        channel_id: ChannelId,
    ) -> Result<()> {
        self.upsert_guild_column(conversation_id, "channel_id", channel_id.to_string())
            .await
    }

    async fn set_model(&self, conversation_id: ConversationId, model: &str) -> Result<()> {
        self.upsert_guild_column(conversation_id, "model", model.to_string())
            .await
    }

    async fn set_temperature(
        &self,
        conversation_id: ConversationId,
        temperature: f32,
    ) -> Result<()> {
        self.upsert_guild_column(conversation_id, "temperature", f64::from(temperature))
            .await
    }

    async fn set_instructions(
        &self,
        conversation_id: ConversationId,
        instructions: &str,
    ) -> Result<()> {
        self.upsert_guild_column(conversation_id, "instructions", instructions.to_string())
            .await
    }

    async fn set_opt_status(&self, conversation_id: ConversationId, opt_in: bool) -> Result<()> {
        self.upsert_guild_column(conversation_id, "opt_in", opt_in)
            .await
    }

    async fn add_to_blacklist(&self, user_id: UserId) -> Result<usize> {
        sqlx::query("INSERT OR IGNORE INTO blacklist (user_id) VALUES (?)")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        self.blacklist_size().await
    }

    async fn remove_from_blacklist(&self, user_id: UserId) -> Result<usize> {
        sqlx::query("DELETE FROM blacklist WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        self.blacklist_size().await
    }

    async fn blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        let rows = sqlx::query("SELECT user_id, created_at FROM blacklist ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let user_id: String = row.try_get("user_id").ok()?;
                Some(BlacklistEntry {
                    user_id: user_id.parse().ok()?,
                    created_at: row
                        .try_get::<chrono::NaiveDateTime, _>("created_at")
                        .map(|value| value.and_utc())
                        .unwrap_or_else(|_| chrono::Utc::now()),
                })
            })
            .collect())
    }

    async fn messages_for(&self, conversation_id: ConversationId) -> Result<Vec<LoggedMessage>> {
        let rows = sqlx::query(
            "SELECT author_id, channel_id, content, created_at FROM messages \
             WHERE server_id = ? ORDER BY id",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let author_id: String = row.try_get("author_id").ok()?;
                let channel_id: String = row.try_get("channel_id").ok()?;
                Some(LoggedMessage {
                    author_id: author_id.parse().ok()?,
                    channel_id: channel_id.parse().ok()?,
                    content: row.try_get("content").unwrap_or_default(),
                    created_at: row
                        .try_get::<chrono::NaiveDateTime, _>("created_at")
                        .map(|value| value.and_utc())
                        .unwrap_or_else(|_| chrono::Utc::now()),
                })
            })
            .collect())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let id = conversation_id.to_string();
        let mut transaction = self.pool.begin().await?;
        sqlx::query("DELETE FROM guilds WHERE server_id = ?")
            .bind(&id)
            .execute(&mut *transaction)
            .await?;
        sqlx::query("DELETE FROM messages WHERE server_id = ?")
            .bind(&id)
            .execute(&mut *transaction)
            .await?;
        transaction.commit().await?;
        Ok(())
    }
}
