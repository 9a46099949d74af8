//! SQLite 저장소 (SQLx)

use super::{
    ChannelId, EntityKind, MembershipStore, Message, MessageStore, ServerId, StoreError, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

const MESSAGE_COLUMNS: &str = r#"
    SELECT m.id, m.channel_id, m.user_id, u.username, m.content, m.created_at
    FROM messages m
    JOIN users u ON m.user_id = u.id
"#;

/// 첫 문장이 쓰기여야 WAL에서 읽기 잠금 승격 충돌(SQLITE_BUSY)이 나지 않는다.
/// `created_at`은 채널의 마지막 값보다 작아지지 않는다.
const INSERT_MESSAGE: &str = r#"
    INSERT INTO messages (channel_id, user_id, content, created_at)
    SELECT ?, u.id, ?, MAX(?, COALESCE((SELECT MAX(created_at) FROM messages WHERE channel_id = ?), ''))
    FROM users u
    WHERE u.id = ?
"#;

/// 고정 폭 RFC 3339 (마이크로초, `Z`). 문자열 비교가 시간 순서와 같다.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// 연결 후 마이그레이션 적용. `sqlite::memory:`도 허용한다.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Self::ACQUIRE_TIMEOUT);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 메모리 DB는 연결이 닫히면 사라지므로 연결 하나를 계속 유지한다
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .idle_timeout(Some(Duration::from_secs(60)))
        };

        let pool = pool_options
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(url = %url, "Database connected, migrations applied");

        Ok(Self { pool })
    }

    // 아래 쓰기 연산은 외부 CRUD 서비스의 몫이다. 초기 데이터와 테스트에 쓴다.

    pub async fn add_user(&self, username: &str) -> Result<UserId, StoreError> {
        let result = sqlx::query("INSERT INTO users (username) VALUES (?)")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn add_server(&self, name: &str, owner_id: UserId) -> Result<ServerId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let server_id = sqlx::query("INSERT INTO servers (name, owner_id) VALUES (?, ?)")
            .bind(name)
            .bind(owner_id)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        sqlx::query("INSERT INTO server_members (server_id, user_id, role) VALUES (?, ?, 'admin')")
            .bind(server_id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(server_id)
    }

    /// 이미 멤버면 아무것도 하지 않는다.
    pub async fn add_server_member(
        &self,
        server_id: ServerId,
        user_id: UserId,
        role: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO server_members (server_id, user_id, role) VALUES (?, ?, ?)",
        )
        .bind(server_id)
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 채널 생성. 생성자는 자동으로 채널 멤버가 된다.
    pub async fn add_channel(
        &self,
        name: &str,
        server_id: Option<ServerId>,
        created_by: UserId,
    ) -> Result<ChannelId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let channel_id =
            sqlx::query("INSERT INTO channels (name, server_id, created_by) VALUES (?, ?, ?)")
                .bind(name)
                .bind(server_id)
                .bind(created_by)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
        sqlx::query("INSERT INTO channel_members (channel_id, user_id) VALUES (?, ?)")
            .bind(channel_id)
            .bind(created_by)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(channel_id)
    }

    pub async fn add_channel_member(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO channel_members (channel_id, user_id) VALUES (?, ?)")
            .bind(channel_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for SqliteStore {
    async fn is_member(
        &self,
        kind: EntityKind,
        entity_id: i64,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        let query = match kind {
            EntityKind::Server => {
                "SELECT EXISTS(SELECT 1 FROM server_members WHERE server_id = ? AND user_id = ?)"
            }
            EntityKind::Channel => {
                "SELECT EXISTS(SELECT 1 FROM channel_members WHERE channel_id = ? AND user_id = ?)"
            }
        };
        let exists: bool = sqlx::query_scalar(query)
            .bind(entity_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn channel_server(&self, channel_id: ChannelId) -> Result<Option<ServerId>, StoreError> {
        let server_id: Option<Option<ServerId>> =
            sqlx::query_scalar("SELECT server_id FROM channels WHERE id = ?")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(server_id.flatten())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(INSERT_MESSAGE)
            .bind(channel_id)
            .bind(content)
            .bind(timestamp(Utc::now()))
            .bind(channel_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                tracing::error!(channel_id, error = %e, "Failed to insert message");
                e
            })?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::UnknownUser(user_id));
        }
        let id = inserted.last_insert_rowid();

        let message: Message = sqlx::query_as(&format!("{MESSAGE_COLUMNS} WHERE m.id = ?"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(message)
    }

    async fn list_by_channel(&self, channel_id: ChannelId) -> Result<Vec<Message>, StoreError> {
        let messages = sqlx::query_as(&format!(
            "{MESSAGE_COLUMNS} WHERE m.channel_id = ? ORDER BY m.id ASC"
        ))
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}
