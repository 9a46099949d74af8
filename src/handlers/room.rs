//! 방 관리 핸들러

use crate::error::RelayError;
use crate::protocol::ServerMessage;
use crate::state::{Access, AppState, ConnectionId, RoomKey};
use crate::store::{bounded, EntityKind, UserId};

/// 방 참여 처리
///
/// 멤버십 확인은 허브 락 밖에서 기다린다. 확인하는 사이 연결이 끊겼다면 조용히 끝난다.
pub async fn handle_join_room(
    state: &AppState,
    connection_id: ConnectionId,
    room: RoomKey,
) -> Result<(), RelayError> {
    let user = state.hub().identity_of(connection_id)?;
    let access = check_access(state, room, user.id).await?;

    let joined = state.hub().join(connection_id, room, access);
    let members = match joined {
        Ok(Some(members)) => members,
        Ok(None) => {
            tracing::debug!(connection_id = %connection_id, room = %room, "Connection gone before join");
            return Ok(());
        }
        Err(e) => {
            tracing::info!(connection_id = %connection_id, room = %room, user_id = user.id, "Join denied");
            return Err(e);
        }
    };

    tracing::info!(
        connection_id = %connection_id,
        room = %room,
        user_count = members.len(),
        "User joined room"
    );
    state
        .hub()
        .send_to(connection_id, ServerMessage::RoomMembers { room, members });
    Ok(())
}

/// 방 나가기 처리. 참여하지 않은 방이면 no-op.
pub fn handle_leave_room(state: &AppState, connection_id: ConnectionId, room: RoomKey) {
    if state.hub().leave(connection_id, room) {
        tracing::info!(connection_id = %connection_id, room = %room, "User left room");
    }
}

/// 멤버십 저장소로 입장 가능 여부 판정.
///
/// 서버에 속한 채널은 채널 멤버이면서 서버 멤버여야 한다.
pub async fn check_access(
    state: &AppState,
    room: RoomKey,
    user_id: UserId,
) -> Result<Access, RelayError> {
    let limit = state.config.limits.persist_timeout();
    let store = state.memberships();

    let allowed = match room {
        RoomKey::Server(server_id) => {
            bounded(limit, store.is_member(EntityKind::Server, server_id, user_id)).await?
        }
        RoomKey::Channel(channel_id) => {
            let in_channel =
                bounded(limit, store.is_member(EntityKind::Channel, channel_id, user_id)).await?;
            if !in_channel {
                false
            } else {
                match bounded(limit, store.channel_server(channel_id)).await? {
                    Some(server_id) => {
                        bounded(limit, store.is_member(EntityKind::Server, server_id, user_id))
                            .await?
                    }
                    None => true,
                }
            }
        }
    };

    Ok(Access::from(allowed))
}
