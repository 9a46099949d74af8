//! 애플리케이션 상태 관리
//!
//! 연결 레지스트리와 방 라우터는 하나의 [`Hub`]가 소유하고, 단일 뮤텍스 아래에서만
//! 변경된다. 허브 락은 절대 `.await`를 넘어서 잡지 않는다.

mod registry;
mod router;

pub use registry::{Binding, Detached, Registry};
pub use router::{Access, BroadcastReport, Router};

use crate::config::Config;
use crate::error::RelayError;
use crate::protocol::{ServerMessage, User};
use crate::store::{ChannelId, MembershipStore, MessageStore, ServerId};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 연결별 송신 큐
pub type Outbox = mpsc::Sender<ServerMessage>;

/// 전송 연결 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 방 키. 와이어에서는 `server:<id>` / `channel:<id>` 문자열.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Server(ServerId),
    Channel(ChannelId),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "server:{id}"),
            Self::Channel(id) => write!(f, "channel:{id}"),
        }
    }
}

impl FromStr for RoomKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed room key: {s}"))?;
        let id = id
            .parse()
            .map_err(|_| format!("malformed room id: {s}"))?;
        match kind {
            "server" => Ok(Self::Server(id)),
            "channel" => Ok(Self::Channel(id)),
            _ => Err(format!("unknown room kind: {s}")),
        }
    }
}

impl Serialize for RoomKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// 연결 레지스트리 + 방 라우터
#[derive(Default)]
pub struct Hub {
    registry: Registry,
    router: Router,
}

impl Hub {
    pub fn connect(&mut self, id: ConnectionId, outbox: Outbox) {
        self.registry.attach(id, outbox);
    }

    pub fn bind(&mut self, id: ConnectionId, user: User) -> Result<Binding, RelayError> {
        self.registry.bind(id, user)
    }

    pub fn identity_of(&self, id: ConnectionId) -> Result<User, RelayError> {
        self.registry.identity_of(id).cloned()
    }

    /// 연결 제거 + 모든 방에서 퇴장. 두 번째 호출부터는 `None`.
    pub fn disconnect(&mut self, id: ConnectionId) -> Option<Detached> {
        let detached = self.registry.unbind(id)?;
        self.router.leave_all(id, detached.rooms.iter().copied());
        Some(detached)
    }

    /// 방 참여. 멤버십 확인 도중 연결이 끊겼으면 `Ok(None)`.
    pub fn join(
        &mut self,
        id: ConnectionId,
        room: RoomKey,
        access: Access,
    ) -> Result<Option<Vec<ConnectionId>>, RelayError> {
        if !self.registry.contains(id) {
            return Ok(None);
        }
        let members = self.router.join(id, room, access)?;
        self.registry.note_joined(id, room);
        Ok(Some(members))
    }

    pub fn leave(&mut self, id: ConnectionId, room: RoomKey) -> bool {
        self.registry.note_left(id, room);
        self.router.leave(id, room)
    }

    pub fn occupies(&self, id: ConnectionId, room: RoomKey) -> bool {
        self.router.contains(room, id)
    }

    pub fn members(&self, room: RoomKey) -> Vec<ConnectionId> {
        self.router.members(room)
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<RoomKey> {
        self.registry.rooms_of(id)
    }

    /// 방 브로드캐스트. 전달된 멤버 수를 반환한다.
    pub fn broadcast(
        &mut self,
        room: RoomKey,
        message: ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let registry = &self.registry;
        let report = self
            .router
            .broadcast(room, &message, exclude, |member, msg| registry.deliver(member, msg));

        for (member, _) in &report.pruned {
            self.registry.note_left(*member, room);
        }
        report.delivered
    }

    /// 방과 무관하게 모든 연결에 전달한다 (presence 용).
    pub fn broadcast_all(&mut self, message: ServerMessage, exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for id in self.registry.ids() {
            if Some(id) == exclude {
                continue;
            }
            match self.registry.deliver(id, message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(connection_id = %id, error = %e, "Global delivery failed"),
            }
        }
        delivered
    }

    /// 단일 연결에 전달. 실패는 로그만 남긴다.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        match self.registry.deliver(id, message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "Direct delivery failed");
                false
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn room_count(&self) -> usize {
        self.router.room_count()
    }
}

/// 전역 애플리케이션 상태
pub struct AppState {
    hub: Mutex<Hub>,
    memberships: Arc<dyn MembershipStore>,
    messages: Arc<dyn MessageStore>,
    /// 채널별 저장→브로드캐스트 직렬화 락
    sequencers: DashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>,
    /// 설정
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Config,
        memberships: Arc<dyn MembershipStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            hub: Mutex::new(Hub::default()),
            memberships,
            messages,
            sequencers: DashMap::new(),
            config: Arc::new(config),
        }
    }

    /// 허브 락. 반환된 가드는 `.await` 전에 반드시 해제해야 한다.
    pub fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock()
    }

    pub fn memberships(&self) -> &dyn MembershipStore {
        self.memberships.as_ref()
    }

    pub fn messages(&self) -> &dyn MessageStore {
        self.messages.as_ref()
    }

    pub fn sequencer(&self, channel_id: ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        self.sequencers.entry(channel_id).or_default().clone()
    }

    /// 아무도 잡고 있지 않은 채널 락 정리
    pub fn prune_sequencers(&self) -> usize {
        let before = self.sequencers.len();
        self.sequencers.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.sequencers.len()
    }
}
