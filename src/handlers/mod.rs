//! 핸들러 모듈
//!
//! [`dispatch`]가 이벤트 종류별로 핸들러를 고르고, 실패는 `error` 이벤트로
//! 요청한 연결에만 돌려준다. 저장소를 거치는 이벤트는 연결별 [`Pipeline`]에서
//! 차례로 처리되어 시그널링과 방 이벤트를 막지 않는다.

pub mod connection;
pub mod ice;
pub mod message;
pub mod presence;
pub mod room;
pub mod signaling;

pub use connection::*;
pub use ice::*;
pub use message::*;
pub use room::*;
pub use signaling::*;

use crate::error::RelayError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{AppState, ConnectionId, RoomKey};
use std::sync::Arc;
use tokio::sync::mpsc;

/// 이벤트 → 핸들러
pub async fn dispatch(
    state: &AppState,
    connection_id: ConnectionId,
    msg: ClientMessage,
) -> Result<(), RelayError> {
    match msg {
        ClientMessage::Heartbeat => {
            handle_heartbeat(state, connection_id);
            Ok(())
        }
        ClientMessage::UserJoined(user) => handle_user_joined(state, connection_id, user),
        ClientMessage::JoinServer(server_id) => {
            handle_join_room(state, connection_id, RoomKey::Server(server_id)).await
        }
        ClientMessage::LeaveServer(server_id) => {
            handle_leave_room(state, connection_id, RoomKey::Server(server_id));
            Ok(())
        }
        ClientMessage::JoinChannel(channel_id) => {
            handle_join_room(state, connection_id, RoomKey::Channel(channel_id)).await
        }
        ClientMessage::LeaveChannel(channel_id) => {
            handle_leave_room(state, connection_id, RoomKey::Channel(channel_id));
            Ok(())
        }
        ClientMessage::SendMessage(request) => handle_send_message(state, connection_id, request)
            .await
            .map(|_| ()),
        ClientMessage::FetchHistory(request) => {
            handle_fetch_history(state, connection_id, request).await
        }
        ClientMessage::WebrtcSignal(request) => handle_signal(state, connection_id, request),
        ClientMessage::RequestIceServers => handle_ice_request(state, connection_id),
    }
}

/// 채팅 저장/조회처럼 저장소 I/O를 기다리는 이벤트인지
pub fn is_pipelined(msg: &ClientMessage) -> bool {
    matches!(
        msg,
        ClientMessage::SendMessage(_) | ClientMessage::FetchHistory(_)
    )
}

/// 프레임 해석. 실패하면 `malformed` 에러를 돌려주고 `None`.
pub fn parse_frame(state: &AppState, connection_id: ConnectionId, text: &str) -> Option<ClientMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "Malformed frame");
            state.hub().send_to(
                connection_id,
                ServerMessage::Error {
                    code: "malformed".to_string(),
                    message: e.to_string(),
                },
            );
            None
        }
    }
}

/// 이벤트 하나를 처리하고 실패를 `error`로 응답한다.
pub async fn handle_message(state: &AppState, connection_id: ConnectionId, msg: ClientMessage) {
    if let Err(e) = dispatch(state, connection_id, msg).await {
        tracing::debug!(connection_id = %connection_id, code = e.code(), error = %e, "Request rejected");
        state.hub().send_to(
            connection_id,
            ServerMessage::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        );
    }
}

/// 수신한 텍스트 프레임 하나를 그 자리에서 처리한다.
pub async fn handle_frame(state: &AppState, connection_id: ConnectionId, text: &str) {
    if let Some(msg) = parse_frame(state, connection_id, text) {
        handle_message(state, connection_id, msg).await;
    }
}

/// 연결별 순서 큐
///
/// 한 연결이 보낸 메시지는 보낸 순서대로 저장된다. 큐가 가득 차면 수신 루프가
/// 기다린다. 드롭되면 남은 이벤트를 마저 처리하고 태스크가 끝난다.
pub struct Pipeline {
    tx: mpsc::Sender<ClientMessage>,
}

impl Pipeline {
    pub fn spawn(state: Arc<AppState>, connection_id: ConnectionId, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ClientMessage>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handle_message(&state, connection_id, msg).await;
            }
            tracing::debug!(connection_id = %connection_id, "Pipeline drained");
        });
        Self { tx }
    }

    /// 프레임을 해석해 저장소 이벤트는 큐로, 나머지는 바로 처리한다.
    /// 큐 태스크가 끝났으면 `false`.
    pub async fn route(&self, state: &AppState, connection_id: ConnectionId, text: &str) -> bool {
        let Some(msg) = parse_frame(state, connection_id, text) else {
            return true;
        };
        if is_pipelined(&msg) {
            return self.tx.send(msg).await.is_ok();
        }
        handle_message(state, connection_id, msg).await;
        true
    }
}
