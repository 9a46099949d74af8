//! 연결 레지스트리: 전송 연결 ↔ 사용자 신원, 참여 중인 방 추적

use super::{ConnectionId, Outbox, RoomKey};
use crate::error::{DeliveryFailure, RelayError};
use crate::protocol::{ServerMessage, User};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;

/// 살아있는 연결 하나의 상태. 영속화되지 않는다.
struct Connection {
    user: Option<User>,
    rooms: HashSet<RoomKey>,
    outbox: Outbox,
    connected_at: Instant,
}

/// `bind` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// 처음으로 신원이 연결됨
    Bound,
    /// 같은 사용자로 다시 요청됨 (no-op)
    Unchanged,
}

/// 연결 해제 시 레지스트리에서 빠져나온 상태
#[derive(Debug)]
pub struct Detached {
    pub user: Option<User>,
    pub rooms: Vec<RoomKey>,
    pub connected_for: std::time::Duration,
}

#[derive(Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn attach(&mut self, id: ConnectionId, outbox: Outbox) {
        self.connections.insert(
            id,
            Connection {
                user: None,
                rooms: HashSet::new(),
                outbox,
                connected_at: Instant::now(),
            },
        );
    }

    /// 신원 연결. 다른 사용자로의 전환은 허용하지 않는다.
    pub fn bind(&mut self, id: ConnectionId, user: User) -> Result<Binding, RelayError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RelayError::UnknownConnection)?;

        match &connection.user {
            Some(existing) if *existing == user => Ok(Binding::Unchanged),
            Some(_) => Err(RelayError::DuplicateBind),
            None => {
                connection.user = Some(user);
                Ok(Binding::Bound)
            }
        }
    }

    /// 연결 제거. 이미 제거된 연결이면 `None`.
    pub fn unbind(&mut self, id: ConnectionId) -> Option<Detached> {
        let connection = self.connections.remove(&id)?;
        Some(Detached {
            user: connection.user,
            rooms: connection.rooms.into_iter().collect(),
            connected_for: connection.connected_at.elapsed(),
        })
    }

    pub fn identity_of(&self, id: ConnectionId) -> Result<&User, RelayError> {
        self.connections
            .get(&id)
            .and_then(|c| c.user.as_ref())
            .ok_or(RelayError::NotBound)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn note_joined(&mut self, id: ConnectionId, room: RoomKey) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.rooms.insert(room);
        }
    }

    pub fn note_left(&mut self, id: ConnectionId, room: RoomKey) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.rooms.remove(&room);
        }
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<RoomKey> {
        self.connections
            .get(&id)
            .map(|c| c.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 송신 큐에 넣기만 하고 기다리지 않는다.
    pub fn deliver(&self, id: ConnectionId, message: ServerMessage) -> Result<(), DeliveryFailure> {
        let connection = self.connections.get(&id).ok_or(DeliveryFailure::Closed)?;
        connection.outbox.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::Backlogged,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
