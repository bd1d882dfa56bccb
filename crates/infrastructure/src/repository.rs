use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::{
    Message, MessageContent, MessageId, MessageRepository, NewMessage, PresenceRepository,
    PresenceState, PresenceStatus, RepositoryError, RepositoryFuture, Session, SessionRepository,
    Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        other => RepositoryError::storage(other.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    sender_id: Uuid,
    recipient_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    is_read: bool,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Message {
            id: MessageId(value.id),
            sender_id: UserId::from(value.sender_id),
            recipient_id: UserId::from(value.recipient_id),
            content,
            created_at: value.created_at,
            is_read: value.is_read,
        })
    }
}

#[derive(Debug, FromRow)]
struct PresenceRecord {
    user_id: Uuid,
    status: String,
    last_active: DateTime<Utc>,
}

impl TryFrom<PresenceRecord> for PresenceState {
    type Error = RepositoryError;

    fn try_from(value: PresenceRecord) -> Result<Self, Self::Error> {
        let status: PresenceStatus = value
            .status
            .parse()
            .map_err(|err: domain::DomainError| invalid_data(err.to_string()))?;
        Ok(PresenceState {
            user_id: UserId::from(value.user_id),
            status,
            last_active: value.last_active,
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRecord {
    user_id: Uuid,
    username: String,
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MessageRepository for PgMessageRepository {
    fn append(&self, message: NewMessage) -> RepositoryFuture<Message> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, MessageRecord>(
                r#"
                INSERT INTO private_messages (sender_id, recipient_id, content, created_at, is_read)
                VALUES ($1, $2, $3, $4, FALSE)
                RETURNING id, sender_id, recipient_id, content, created_at, is_read
                "#,
            )
            .bind(Uuid::from(message.sender_id))
            .bind(Uuid::from(message.recipient_id))
            .bind(message.content.as_str())
            .bind(message.created_at)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Message::try_from(record)
        })
    }

    fn mark_read(&self, sender: UserId, recipient: UserId) -> RepositoryFuture<u64> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE private_messages
                SET is_read = TRUE
                WHERE sender_id = $1 AND recipient_id = $2 AND is_read = FALSE
                "#,
            )
            .bind(Uuid::from(sender))
            .bind(Uuid::from(recipient))
            .execute(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(result.rows_affected())
        })
    }
}

#[derive(Clone)]
pub struct PgPresenceRepository {
    pool: PgPool,
}

impl PgPresenceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PresenceRepository for PgPresenceRepository {
    fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    ) -> RepositoryFuture<()> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO user_status (user_id, status, last_active)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id)
                DO UPDATE SET status = EXCLUDED.status, last_active = EXCLUDED.last_active
                "#,
            )
            .bind(Uuid::from(user_id))
            .bind(status.as_str())
            .bind(at)
            .execute(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(())
        })
    }

    fn get_status(&self, user_id: UserId) -> RepositoryFuture<Option<PresenceState>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let record = sqlx::query_as::<_, PresenceRecord>(
                r#"SELECT user_id, status, last_active FROM user_status WHERE user_id = $1"#,
            )
            .bind(Uuid::from(user_id))
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            record.map(PresenceState::try_from).transpose()
        })
    }
}

/// 通过 `sessions` 表解析会话凭据
#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SessionRepository for PgSessionRepository {
    fn resolve(&self, token: &str) -> RepositoryFuture<Option<Session>> {
        let pool = self.pool.clone();
        let token = token.to_owned();
        Box::pin(async move {
            let record = sqlx::query_as::<_, SessionRecord>(
                r#"
                SELECT s.user_id, u.username
                FROM sessions s
                JOIN users u ON u.id = s.user_id
                WHERE s.session_id = $1 AND s.expires_at > NOW()
                "#,
            )
            .bind(&token)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(record.map(|record| Session::new(UserId::from(record.user_id), record.username)))
        })
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub message_repository: Arc<PgMessageRepository>,
    pub presence_repository: Arc<PgPresenceRepository>,
    pub session_repository: Arc<PgSessionRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            presence_repository: Arc::new(PgPresenceRepository::new(pool.clone())),
            session_repository: Arc::new(PgSessionRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
