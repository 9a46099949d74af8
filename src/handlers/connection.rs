//! 연결 핸들러

use crate::error::RelayError;
use crate::handlers::presence;
use crate::protocol::{ServerMessage, User};
use crate::state::{AppState, Binding, ConnectionId, Outbox};

/// 새 연결 처리
pub fn handle_connection(state: &AppState, outbox: Outbox) -> ConnectionId {
    let connection_id = ConnectionId::new();

    let mut hub = state.hub();
    hub.connect(connection_id, outbox);
    hub.send_to(connection_id, ServerMessage::Connected { connection_id });

    tracing::info!(connection_id = %connection_id, "New connection established");
    connection_id
}

/// `user-joined`: 신원 연결 후 온라인 알림
pub fn handle_user_joined(
    state: &AppState,
    connection_id: ConnectionId,
    user: User,
) -> Result<(), RelayError> {
    let mut hub = state.hub();
    match hub.bind(connection_id, user.clone())? {
        Binding::Bound => {
            tracing::info!(connection_id = %connection_id, user_id = user.id, "Identity bound");
            presence::announce_online(&mut hub, &user, connection_id);
        }
        Binding::Unchanged => {
            tracing::debug!(connection_id = %connection_id, "Repeated user-joined ignored");
        }
    }
    Ok(())
}

/// 연결 해제 처리. 연결당 정확히 한 번 오프라인 알림을 보낸다.
pub fn handle_disconnect(state: &AppState, connection_id: ConnectionId) {
    let mut hub = state.hub();
    let Some(detached) = hub.disconnect(connection_id) else {
        return;
    };

    if let Some(user) = &detached.user {
        presence::announce_offline(&mut hub, user);
    }

    tracing::info!(
        connection_id = %connection_id,
        rooms = detached.rooms.len(),
        connected_secs = detached.connected_for.as_secs(),
        "Connection closed"
    );
}

/// Heartbeat 처리
pub fn handle_heartbeat(state: &AppState, connection_id: ConnectionId) {
    state.hub().send_to(connection_id, ServerMessage::HeartbeatAck);
}
