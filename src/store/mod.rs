//! 영속 저장소 인터페이스
//!
//! 릴레이는 멤버십을 조회만 하고 소유하지 않는다. 메시지 저장소는 append-only이며
//! `id`/`created_at` 할당이 채널 내 전체 순서를 정의한다.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub type UserId = i64;
pub type ServerId = i64;
pub type ChannelId = i64;

/// 저장소 에러
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("storage unavailable")]
    Unavailable,
}

/// 멤버십 대상
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Server,
    Channel,
}

/// 영속화된 채널 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn is_member(
        &self,
        kind: EntityKind,
        entity_id: i64,
        user_id: UserId,
    ) -> Result<bool, StoreError>;

    /// 채널이 속한 서버. 레거시(서버 없는) 채널이거나 채널이 없으면 `None`.
    async fn channel_server(&self, channel_id: ChannelId) -> Result<Option<ServerId>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// 시간순 (id 오름차순) 전체 목록
    async fn list_by_channel(&self, channel_id: ChannelId) -> Result<Vec<Message>, StoreError>;
}

/// 저장소 호출에 시간 제한을 건다.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}
