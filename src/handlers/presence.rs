//! 접속 상태 알림
//!
//! 방과 무관하게 살아있는 모든 연결에 알린다. 방 단위 접속자는 `room-members`
//! 스냅샷으로 클라이언트가 따로 계산한다.

use crate::protocol::{ServerMessage, User};
use crate::state::{ConnectionId, Hub};

pub fn announce_online(hub: &mut Hub, user: &User, origin: ConnectionId) {
    let notified = hub.broadcast_all(ServerMessage::UserOnline(user.clone()), Some(origin));
    tracing::debug!(user_id = user.id, notified, "Announced online");
}

/// 연결이 레지스트리에서 빠진 뒤에 호출한다.
pub fn announce_offline(hub: &mut Hub, user: &User) {
    let notified = hub.broadcast_all(ServerMessage::UserOffline(user.clone()), None);
    tracing::debug!(user_id = user.id, notified, "Announced offline");
}
