//! 방 라우터: `server:<id>` / `channel:<id>` 멀티캐스트 그룹
//!
//! 방은 멤버가 한 명 이상일 때만 존재한다. 미리 만들어두지 않는다.

use super::{ConnectionId, RoomKey};
use crate::error::{DeliveryFailure, RelayError};
use crate::protocol::ServerMessage;
use std::collections::{BTreeSet, HashMap};

/// 멤버십 저장소가 판정한 입장 가능 여부
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied,
}

impl From<bool> for Access {
    fn from(allowed: bool) -> Self {
        if allowed {
            Self::Granted
        } else {
            Self::Denied
        }
    }
}

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: Vec<(ConnectionId, DeliveryFailure)>,
}

#[derive(Default)]
pub struct Router {
    rooms: HashMap<RoomKey, BTreeSet<ConnectionId>>,
}

impl Router {
    /// 방 참여. 이미 멤버면 no-op. 참여 후 멤버 목록을 반환한다.
    pub fn join(
        &mut self,
        id: ConnectionId,
        room: RoomKey,
        access: Access,
    ) -> Result<Vec<ConnectionId>, RelayError> {
        if access == Access::Denied {
            return Err(RelayError::MembershipDenied { room });
        }

        let members = self.rooms.entry(room).or_default();
        if members.insert(id) {
            tracing::debug!(connection_id = %id, room = %room, size = members.len(), "Joined room");
        }
        Ok(members.iter().copied().collect())
    }

    /// 방 나가기. 멤버가 아니었으면 `false`.
    pub fn leave(&mut self, id: ConnectionId, room: RoomKey) -> bool {
        let Some(members) = self.rooms.get_mut(&room) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            self.rooms.remove(&room);
            tracing::debug!(room = %room, "Room emptied");
        }
        removed
    }

    /// 주어진 방들에서 연결을 모두 제거한다.
    pub fn leave_all(&mut self, id: ConnectionId, rooms: impl IntoIterator<Item = RoomKey>) -> usize {
        rooms
            .into_iter()
            .filter(|room| self.leave(id, *room))
            .count()
    }

    pub fn contains(&self, room: RoomKey, id: ConnectionId) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|members| members.contains(&id))
    }

    pub fn members(&self, room: RoomKey) -> Vec<ConnectionId> {
        self.rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// `exclude`를 제외한 모든 멤버에게 전달한다.
    ///
    /// 전달에 실패한 멤버는 방에서 제외되고, 나머지 멤버에게는 계속 전달된다.
    pub fn broadcast<F>(
        &mut self,
        room: RoomKey,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
        mut deliver: F,
    ) -> BroadcastReport
    where
        F: FnMut(ConnectionId, ServerMessage) -> Result<(), DeliveryFailure>,
    {
        let mut report = BroadcastReport::default();
        let Some(members) = self.rooms.get_mut(&room) else {
            return report;
        };

        for &member in members.iter() {
            if Some(member) == exclude {
                continue;
            }
            match deliver(member, message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    tracing::warn!(
                        connection_id = %member,
                        room = %room,
                        error = %failure,
                        "Delivery failed, pruning member"
                    );
                    report.pruned.push((member, failure));
                }
            }
        }

        for (member, _) in &report.pruned {
            members.remove(member);
        }
        if members.is_empty() {
            self.rooms.remove(&room);
        }

        report
    }
}
