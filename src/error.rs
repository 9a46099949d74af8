//! 릴레이 에러 타입

use crate::state::RoomKey;
use crate::store::StoreError;
use thiserror::Error;

/// 클라이언트 요청 처리 중 발생하는 에러.
///
/// 어떤 변형도 연결을 끊지 않는다. 소켓 루프가 `error` 이벤트로 응답한다.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("identify with user-joined before sending this request")]
    NotBound,
    #[error("connection is already bound to another user")]
    DuplicateBind,
    #[error("payload user id {claimed} does not match bound user {bound}")]
    IdentityMismatch { claimed: i64, bound: i64 },
    #[error("connection is no longer registered")]
    UnknownConnection,
    #[error("not a member of {room}")]
    MembershipDenied { room: RoomKey },
    #[error("invalid message content: {0}")]
    InvalidContent(&'static str),
    #[error("storage unavailable: {0}")]
    Persistence(#[from] StoreError),
    #[error("connection has not joined channel {channel_id}")]
    NotInChannel { channel_id: i64 },
    #[error("unsupported signal type")]
    InvalidSignal,
}

impl RelayError {
    /// 와이어 프로토콜에 노출되는 에러 코드
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotBound => "not-bound",
            Self::DuplicateBind => "duplicate-bind",
            Self::IdentityMismatch { .. } => "identity-mismatch",
            Self::UnknownConnection => "unknown-connection",
            Self::MembershipDenied { .. } => "membership-denied",
            Self::InvalidContent(_) => "invalid-content",
            Self::Persistence(_) => "persistence",
            Self::NotInChannel { .. } => "not-in-channel",
            Self::InvalidSignal => "invalid-signal",
        }
    }
}

/// 개별 방 멤버에게 전달 실패. 로그만 남기고 해당 멤버는 방에서 제외된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("transport closed")]
    Closed,
    #[error("outbound queue full")]
    Backlogged,
}
