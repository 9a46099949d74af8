//! 채팅 메시지 파이프라인: 검증 → 저장 → 브로드캐스트
//!
//! 저장에 성공한 레코드만 브로드캐스트한다. 같은 채널의 저장과 브로드캐스트는
//! 채널 락으로 직렬화되므로 모든 멤버가 저장 순서대로 받는다.

use crate::error::RelayError;
use crate::handlers::room::check_access;
use crate::protocol::{HistoryRequest, SendMessage, ServerMessage};
use crate::state::{Access, AppState, ConnectionId, RoomKey};
use crate::store::{bounded, Message};

/// `send-message` 처리
pub async fn handle_send_message(
    state: &AppState,
    connection_id: ConnectionId,
    request: SendMessage,
) -> Result<Message, RelayError> {
    let author = state.hub().identity_of(connection_id)?;
    if let Some(claimed) = request.user_id {
        if claimed != author.id {
            return Err(RelayError::IdentityMismatch {
                claimed,
                bound: author.id,
            });
        }
    }
    validate_content(&request.content, state.config.limits.max_message_len)?;

    let room = RoomKey::Channel(request.channel_id);
    let occupies = state.hub().occupies(connection_id, room);
    if !occupies && check_access(state, room, author.id).await? == Access::Denied {
        return Err(RelayError::MembershipDenied { room });
    }

    let sequencer = state.sequencer(request.channel_id);
    let _turn = sequencer.lock().await;

    let message = bounded(
        state.config.limits.persist_timeout(),
        state
            .messages()
            .append(request.channel_id, author.id, &request.content),
    )
    .await
    .map_err(|e| {
        tracing::warn!(
            connection_id = %connection_id,
            channel_id = request.channel_id,
            error = %e,
            "Message not persisted, skipping broadcast"
        );
        RelayError::Persistence(e)
    })?;

    let delivered = state
        .hub()
        .broadcast(room, ServerMessage::NewMessage(message.clone()), None);

    tracing::debug!(
        message_id = message.id,
        channel_id = message.channel_id,
        delivered,
        "Message broadcast"
    );
    Ok(message)
}

/// `fetch-history` 처리. 채널 방에 들어와 있는 연결만 조회할 수 있다.
pub async fn handle_fetch_history(
    state: &AppState,
    connection_id: ConnectionId,
    request: HistoryRequest,
) -> Result<(), RelayError> {
    state.hub().identity_of(connection_id)?;
    let channel_id = request.channel_id;
    let occupies = state.hub().occupies(connection_id, RoomKey::Channel(channel_id));
    if !occupies {
        return Err(RelayError::NotInChannel { channel_id });
    }

    let messages = bounded(
        state.config.limits.persist_timeout(),
        state.messages().list_by_channel(channel_id),
    )
    .await?;

    tracing::debug!(connection_id = %connection_id, channel_id, count = messages.len(), "History sent");
    state.hub().send_to(
        connection_id,
        ServerMessage::ChannelHistory {
            channel_id,
            messages,
        },
    );
    Ok(())
}

fn validate_content(content: &str, max_len: usize) -> Result<(), RelayError> {
    if content.trim().is_empty() {
        return Err(RelayError::InvalidContent("message is empty"));
    }
    if content.chars().count() > max_len {
        return Err(RelayError::InvalidContent("message is too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_content_is_invalid() {
        assert!(validate_content("hi", 10).is_ok());
        assert!(matches!(
            validate_content(" \n\t ", 10),
            Err(RelayError::InvalidContent(_))
        ));
        assert!(matches!(validate_content("", 10), Err(RelayError::InvalidContent(_))));
    }

    #[test]
    fn length_is_counted_in_characters() {
        assert!(validate_content("두부두부", 4).is_ok());
        assert!(validate_content("두부두부두", 4).is_err());
    }
}
