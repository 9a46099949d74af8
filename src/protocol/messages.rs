//! 클라이언트-서버 메시지 프로토콜 정의
//!
//! 모든 프레임은 `{"type": "<event>", "payload": ...}` 형태의 JSON이다.

use crate::state::{ConnectionId, RoomKey};
use crate::store::{ChannelId, Message, ServerId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 인증 서비스가 발급한 사용자 신원. 연결이 살아있는 동안 변하지 않는다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// 클라이언트 → 서버 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    // Connection
    Heartbeat,
    UserJoined(User),

    // Room Management
    JoinServer(ServerId),
    LeaveServer(ServerId),
    JoinChannel(ChannelId),
    LeaveChannel(ChannelId),

    // Chat
    SendMessage(SendMessage),
    FetchHistory(HistoryRequest),

    // WebRTC Signaling
    WebrtcSignal(SignalRequest),
    RequestIceServers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    /// SDP offer/answer 또는 ICE candidate. 릴레이는 `type` 필드만 확인한다.
    pub signal: Value,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub target: Option<ConnectionId>,
}

/// WebRTC 협상 메시지 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn of(signal: &Value) -> Option<Self> {
        match signal.get("type").and_then(Value::as_str)? {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

/// 서버 → 클라이언트 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    // Connection
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: ConnectionId },
    HeartbeatAck,
    Error { code: String, message: String },

    // Presence
    UserOnline(User),
    UserOffline(User),

    // Room Events
    RoomMembers {
        room: RoomKey,
        members: Vec<ConnectionId>,
    },

    // Chat
    NewMessage(Message),
    #[serde(rename_all = "camelCase")]
    ChannelHistory {
        channel_id: ChannelId,
        messages: Vec<Message>,
    },

    // WebRTC Signaling
    WebrtcSignal(RelayedSignal),
    #[serde(rename_all = "camelCase")]
    IceServers {
        ice_servers: Vec<IceServer>,
        ttl: u64,
    },
}

/// 중계된 시그널. `from`은 보낸 연결의 id로, 응답 시 `target`으로 사용된다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSignal {
    pub signal: Value,
    pub from: ConnectionId,
    pub user_id: UserId,
}

/// ICE 서버 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}
