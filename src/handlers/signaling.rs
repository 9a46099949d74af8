//! WebRTC 시그널링 핸들러
//!
//! 시그널은 해석하거나 저장하지 않고 같은 채널 방의 연결 사이에서만 전달한다.
//! 전달 확인이나 재전송은 하지 않는다.

use crate::error::RelayError;
use crate::protocol::{RelayedSignal, ServerMessage, SignalKind, SignalRequest};
use crate::state::{AppState, ConnectionId, RoomKey};
use serde_json::Value;

/// 시그널 전달 대상
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct(ConnectionId),
    /// 대상이 지정됐지만 연결 id로 읽을 수 없음
    Unroutable,
    Room,
}

impl Route {
    /// 최상위 `target`이 우선이고, 없으면 브라우저 클라이언트가 넣는 `signal.target`을 본다.
    fn of(request: &SignalRequest) -> Self {
        if let Some(target) = request.target {
            return Self::Direct(target);
        }
        match request.signal.get("target").and_then(Value::as_str) {
            Some(raw) => raw.parse().map(Self::Direct).unwrap_or(Self::Unroutable),
            None => Self::Room,
        }
    }
}

/// `webrtc-signal` 처리
pub fn handle_signal(
    state: &AppState,
    from: ConnectionId,
    request: SignalRequest,
) -> Result<(), RelayError> {
    let mut hub = state.hub();
    let sender = hub.identity_of(from)?;
    let kind = SignalKind::of(&request.signal).ok_or(RelayError::InvalidSignal)?;
    let channel_id = request.channel_id;
    let room = RoomKey::Channel(channel_id);
    let route = Route::of(&request);

    if let Some(claimed) = request.user_id {
        if claimed != sender.id {
            return Err(RelayError::IdentityMismatch {
                claimed,
                bound: sender.id,
            });
        }
    }
    if !hub.occupies(from, room) {
        return Err(RelayError::NotInChannel { channel_id });
    }

    let message = ServerMessage::WebrtcSignal(RelayedSignal {
        signal: request.signal,
        from,
        user_id: sender.id,
    });

    match route {
        Route::Direct(target) if target != from && hub.occupies(target, room) => {
            hub.send_to(target, message);
            tracing::debug!(from = %from, to = %target, kind = kind.as_str(), "Relayed signal");
        }
        Route::Direct(target) => {
            tracing::debug!(
                from = %from,
                to = %target,
                channel_id,
                "Signal target not in channel, dropped"
            );
        }
        Route::Unroutable => {
            tracing::debug!(from = %from, channel_id, "Unparseable signal target, dropped");
        }
        Route::Room => {
            let delivered = hub.broadcast(room, message, Some(from));
            tracing::debug!(
                from = %from,
                room = %room,
                kind = kind.as_str(),
                delivered,
                "Relayed signal to room"
            );
        }
    }

    Ok(())
}
