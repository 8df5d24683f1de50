//! Presence and directory broadcasts.
//!
//! Each helper snapshots its recipients and payload under the registry
//! lock, releases it, then fans out. They return the connections whose
//! queues overflowed so the caller can evict them.

use std::sync::Arc;

use murmur_shared::protocol::ServerMessage;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::hub::Hub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined,
    Left,
}

impl PresenceEvent {
    fn message(self, nickname: &str) -> ServerMessage {
        let nickname = nickname.to_string();
        match self {
            PresenceEvent::Joined => ServerMessage::UserJoined { nickname },
            PresenceEvent::Left => ServerMessage::UserLeft { nickname },
        }
    }
}

impl Hub {
    /// Greet a freshly registered client with its nickname and the directory.
    pub async fn send_welcome(&self, conn: &Arc<ConnectionHandle>) -> Vec<ConnectionId> {
        let welcome = {
            let state = self.registry().lock().await;
            let Some(nickname) = state.nickname_of(conn.id()) else {
                return Vec::new();
            };
            ServerMessage::Welcome {
                nickname,
                users: state.directory(),
            }
        };
        self.fan_out(std::slice::from_ref(conn), &welcome)
    }

    pub async fn broadcast_user_list(&self) -> Vec<ConnectionId> {
        let (targets, users) = {
            let state = self.registry().lock().await;
            (state.peers(None), state.directory())
        };
        self.fan_out(&targets, &ServerMessage::UserListUpdate { users })
    }

    /// Announce a join or leave to everyone but the subject.
    pub async fn broadcast_presence_change(
        &self,
        event: PresenceEvent,
        nickname: &str,
    ) -> Vec<ConnectionId> {
        if nickname.is_empty() {
            return Vec::new();
        }
        let targets = {
            let state = self.registry().lock().await;
            let subject = state.resolve_nickname(nickname).map(|c| c.id());
            state.peers(subject)
        };
        self.fan_out(&targets, &event.message(nickname))
    }

    pub async fn broadcast_nickname_change(&self, old: &str, new: &str) -> Vec<ConnectionId> {
        let (targets, users) = {
            let state = self.registry().lock().await;
            (state.peers(None), state.directory())
        };
        let message = ServerMessage::NicknameChanged {
            old_nickname: old.to_string(),
            new_nickname: new.to_string(),
            users,
        };
        self.fan_out(&targets, &message)
    }
}
