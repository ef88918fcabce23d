use crate::{
    catalog::{AIModel, AllowList, CatalogSource, Channel, Effect, PermissionRule, RuleTarget},
    chat::{self, ChatMessage, ChatSession},
    entity::{Identity, Role, User},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};
use tracing::{info, warn};
use uuid::Uuid;

/// Append-only message persistence plus session bookkeeping.
///
/// `append` is durable before it returns and moves the session's `updated_at`
/// forward, which is what orders `list_sessions` by recency.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn append(&self, msg: &ChatMessage) -> Result<()>;
    /// All messages of a session, oldest first.
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
    /// The last `limit` messages of a session, oldest first.
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
    /// A user's sessions, most recently updated first.
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>>;
    async fn find_session(&self, session_id: &str) -> Result<Option<ChatSession>>;
    async fn create_session(&self, session: &ChatSession) -> Result<()>;
    /// Delete every message of a session. Returns the number removed.
    async fn clear_session(&self, session_id: &str) -> Result<u64>;
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).context("Invalid stored timestamp")
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'admin')),
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_models (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                display_name TEXT NOT NULL,
                provider TEXT NOT NULL,
                model_id TEXT NOT NULL,
                max_tokens INTEGER NOT NULL DEFAULT 4000,
                temperature REAL NOT NULL DEFAULT 0.7,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                allowed_models TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user_updated ON chat_sessions(user_id, updated_at DESC);

            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                model_id TEXT,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_created ON chat_messages(session_id, created_at);

            CREATE TABLE IF NOT EXISTS user_permissions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                channel_id TEXT,
                model_id TEXT,
                permission_type TEXT NOT NULL CHECK (permission_type IN ('allow', 'deny')),
                created_at INTEGER NOT NULL,
                CHECK ((channel_id IS NULL) <> (model_id IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_permissions_user ON user_permissions(user_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Insert the stock models and channels. Existing rows are left alone.
    pub async fn seed_defaults(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO ai_models (id, name, display_name, provider, model_id, max_tokens, temperature, is_active)
            VALUES
                ('gpt-4o-mini', 'gpt-4o-mini', 'GPT-4o Mini', 'openai', 'gpt-4o-mini', 4000, 0.7, 1),
                ('gpt-4o', 'gpt-4o', 'GPT-4o', 'openai', 'gpt-4o', 4000, 0.7, 1),
                ('claude-3-5-sonnet', 'claude-3-5-sonnet', 'Claude 3.5 Sonnet', 'anthropic', 'claude-3-5-sonnet-20241022', 4000, 0.7, 1);

            INSERT OR IGNORE INTO channels (id, name, description, allowed_models, is_active)
            VALUES
                ('general', 'General', 'General chat with every model', '["gpt-4o-mini", "gpt-4o", "claude-3-5-sonnet"]', 1),
                ('coding', 'Coding', 'Programming questions', '["gpt-4o", "claude-3-5-sonnet"]', 1),
                ('creative', 'Creative', 'Creative writing', '["gpt-4o", "claude-3-5-sonnet"]', 1);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to seed default catalog")?;

        info!("Default models and channels ensured");
        Ok(())
    }

    // --- Users ---

    /// Map an identity to a local user, creating it on first sight.
    pub async fn get_or_create_user(&self, identity: &Identity, admin_email: &str) -> Result<User> {
        if let Some(user) = self.find_user(&identity.id).await? {
            return Ok(user);
        }

        let user = User::from_identity(identity, admin_email);
        sqlx::query(
            r#"
            INSERT INTO users (id, email, display_name, role, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.created_at.timestamp_micros())
        .bind(user.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .context("Failed to create user")?;

        info!("Registered new user {} as {}", user, user.role);

        // Re-read so a concurrent first sign-in resolves to the same row.
        self.find_user(&identity.id)
            .await?
            .context("User vanished right after creation")
    }

    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, email, display_name, role, is_active, created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        row.map(|row| user_from_row(&row)).transpose()
    }

    /// Change a user's role and/or active flag. Returns the updated user, if it exists.
    pub async fn update_user(
        &self,
        user_id: &str,
        role: Option<Role>,
        is_active: Option<bool>,
    ) -> Result<Option<User>> {
        sqlx::query(
            r#"
            UPDATE users
            SET role = COALESCE(?, role),
                is_active = COALESCE(?, is_active),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(role.map(|r| r.as_str()))
        .bind(is_active)
        .bind(chat::now().timestamp_micros())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update user")?;

        self.find_user(user_id).await
    }

    // --- Catalog configuration ---

    pub async fn upsert_model(&self, model: &AIModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_models (id, name, display_name, provider, model_id, max_tokens, temperature, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                display_name = excluded.display_name,
                provider = excluded.provider,
                model_id = excluded.model_id,
                max_tokens = excluded.max_tokens,
                temperature = excluded.temperature,
                is_active = excluded.is_active
            "#,
        )
        .bind(&model.id)
        .bind(&model.name)
        .bind(&model.display_name)
        .bind(&model.provider)
        .bind(&model.model_id)
        .bind(model.max_tokens as i64)
        .bind(model.temperature as f64)
        .bind(model.is_active)
        .execute(&self.pool)
        .await
        .context("Failed to save model")?;

        Ok(())
    }

    pub async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, name, description, allowed_models, is_active)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                allowed_models = excluded.allowed_models,
                is_active = excluded.is_active
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(&channel.description)
        .bind(channel.allowed_models.to_json())
        .bind(channel.is_active)
        .execute(&self.pool)
        .await
        .context("Failed to save channel")?;

        Ok(())
    }

    /// Rules are created and deleted, never edited in place.
    pub async fn add_permission(
        &self,
        user_id: &str,
        target: RuleTarget,
        effect: Effect,
    ) -> Result<PermissionRule> {
        let rule = PermissionRule {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            target,
            effect,
            created_at: chat::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO user_permissions (id, user_id, channel_id, model_id, permission_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.user_id)
        .bind(rule.target.channel_id())
        .bind(rule.target.model_id())
        .bind(rule.effect.as_str())
        .bind(rule.created_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .context("Failed to save permission rule")?;

        Ok(rule)
    }

    pub async fn delete_permission(&self, rule_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_permissions WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete permission rule")?;

        Ok(result.rows_affected() > 0)
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        role: role.parse()?,
        is_active: row.try_get("is_active")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn model_from_row(row: &SqliteRow) -> Result<AIModel> {
    let max_tokens: i64 = row.try_get("max_tokens")?;
    let temperature: f64 = row.try_get("temperature")?;
    Ok(AIModel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        provider: row.try_get("provider")?,
        model_id: row.try_get("model_id")?,
        max_tokens: u32::try_from(max_tokens).context("Invalid stored max_tokens")?,
        temperature: temperature as f32,
        is_active: row.try_get("is_active")?,
    })
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    let allowed: Option<String> = row.try_get("allowed_models")?;
    Ok(Channel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        allowed_models: AllowList::parse(allowed.as_deref()),
        is_active: row.try_get("is_active")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<ChatSession> {
    Ok(ChatSession {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        channel_id: row.try_get("channel_id")?,
        model_id: row.try_get("model_id")?,
        title: row.try_get("title")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.try_get("role")?;
    let tokens_used: i64 = row.try_get("tokens_used")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        model_id: row.try_get("model_id")?,
        tokens_used: u32::try_from(tokens_used).context("Invalid stored tokens_used")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl CatalogSource for Store {
    async fn list_models(&self) -> Result<Vec<AIModel>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, display_name, provider, model_id, max_tokens, temperature, is_active
            FROM ai_models
            ORDER BY display_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch models")?;

        rows.iter().map(model_from_row).collect()
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, allowed_models, is_active
            FROM channels
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch channels")?;

        rows.iter().map(channel_from_row).collect()
    }

    async fn find_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, allowed_models, is_active
            FROM channels
            WHERE id = ?
            "#,
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch channel")?;

        row.map(|row| channel_from_row(&row)).transpose()
    }

    async fn rules_for_user(&self, user_id: &str) -> Result<Vec<PermissionRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, channel_id, model_id, permission_type, created_at
            FROM user_permissions
            WHERE user_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch permission rules")?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let effect: String = row.try_get("permission_type")?;
            let target = RuleTarget::from_columns(row.try_get("channel_id")?, row.try_get("model_id")?);

            let (Ok(target), Some(effect)) = (target, Effect::parse(&effect)) else {
                warn!("Skipping malformed permission rule {}", id);
                continue;
            };

            rules.push(PermissionRule {
                id,
                user_id: row.try_get("user_id")?,
                target,
                effect,
                created_at: from_micros(row.try_get("created_at")?)?,
            });
        }

        Ok(rules)
    }
}

#[async_trait]
impl TranscriptStore for Store {
    async fn append(&self, msg: &ChatMessage) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, session_id, user_id, role, content, model_id, tokens_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.session_id)
        .bind(&msg.user_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(&msg.model_id)
        .bind(msg.tokens_used as i64)
        .bind(msg.created_at.timestamp_micros())
        .execute(&mut *tx)
        .await
        .context("Failed to save message")?;

        sqlx::query("UPDATE chat_sessions SET updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(msg.created_at.timestamp_micros())
            .bind(&msg.session_id)
            .execute(&mut *tx)
            .await
            .context("Failed to touch session")?;

        tx.commit().await.context("Failed to commit message")?;
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, user_id, role, content, model_id, tokens_used, created_at
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch session messages")?;

        rows.iter().map(message_from_row).collect()
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, user_id, role, content, model_id, tokens_used, created_at
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent messages")?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        // Return in chronological order (oldest -> newest)
        messages.reverse();
        Ok(messages)
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, channel_id, model_id, title, created_at, updated_at
            FROM chat_sessions
            WHERE user_id = ?
            ORDER BY updated_at DESC, rowid DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch sessions")?;

        rows.iter().map(session_from_row).collect()
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, channel_id, model_id, title, created_at, updated_at
            FROM chat_sessions
            WHERE id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session")?;

        row.map(|row| session_from_row(&row)).transpose()
    }

    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, user_id, channel_id, model_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.channel_id)
        .bind(&session.model_id)
        .bind(&session.title)
        .bind(session.created_at.timestamp_micros())
        .bind(session.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .context("Failed to create session")?;

        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("Failed to clear session messages")?;

        Ok(result.rows_affected())
    }
}
