//! 메모리 저장소. 개발 모드(`DATABASE_URL=memory`)와 테스트에서 사용한다.

use super::{
    ChannelId, EntityKind, MembershipStore, Message, MessageStore, ServerId, StoreError, UserId,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, String>,
    channels: HashMap<ChannelId, Option<ServerId>>,
    members: HashSet<(EntityKind, i64, UserId)>,
    messages: Vec<Message>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn add_user(&self, id: UserId, username: &str) {
        self.tables.lock().users.insert(id, username.to_string());
    }

    pub fn add_channel(&self, id: ChannelId, server_id: Option<ServerId>) {
        self.tables.lock().channels.insert(id, server_id);
    }

    pub fn add_member(&self, kind: EntityKind, entity_id: i64, user_id: UserId) {
        self.tables.lock().members.insert((kind, entity_id, user_id));
    }

    /// 저장소 장애 흉내. 켜져 있으면 모든 호출이 `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 느린 저장소 흉내. 모든 호출이 응답 전에 `delay`만큼 기다린다.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    async fn ready(&self) -> Result<(), StoreError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn is_member(
        &self,
        kind: EntityKind,
        entity_id: i64,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        self.ready().await?;
        Ok(self.tables.lock().members.contains(&(kind, entity_id, user_id)))
    }

    async fn channel_server(&self, channel_id: ChannelId) -> Result<Option<ServerId>, StoreError> {
        self.ready().await?;
        Ok(self.tables.lock().channels.get(&channel_id).copied().flatten())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.ready().await?;
        let mut tables = self.tables.lock();
        let username = tables
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::UnknownUser(user_id))?;

        // created_at은 채널 안에서 감소하지 않는다
        let mut created_at = Utc::now();
        if let Some(last) = tables.messages.iter().rev().find(|m| m.channel_id == channel_id) {
            created_at = created_at.max(last.created_at);
        }

        let message = Message {
            id: tables.messages.len() as i64 + 1,
            channel_id,
            user_id,
            username,
            content: content.to_string(),
            created_at,
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn list_by_channel(&self, channel_id: ChannelId) -> Result<Vec<Message>, StoreError> {
        self.ready().await?;
        Ok(self
            .tables
            .lock()
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect())
    }
}
