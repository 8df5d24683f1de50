//! Inbound message router.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_shared::protocol::{ClientMessage, Recipient, ServerMessage};

use crate::connection::ConnectionHandle;
use crate::files;
use crate::hub::Hub;
use crate::presence::PresenceEvent;
use crate::session::{self, NicknameError, RegisterOutcome, Registration};

impl Hub {
    /// Decode one text frame and run its handler.
    ///
    /// Malformed frames and unknown kinds are dropped; nothing is sent back.
    pub async fn dispatch(&self, conn: &Arc<ConnectionHandle>, text: &str) {
        let message = match ClientMessage::decode(text) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(conn = %conn.id(), "Ignoring unknown message type");
                return;
            }
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "Dropping malformed envelope");
                return;
            }
        };

        match message {
            ClientMessage::Register {
                client_id,
                public_key,
                proposed_nickname,
            } => {
                let registration = Registration {
                    client_id,
                    public_key,
                    proposed_nickname,
                };
                self.handle_register(conn, registration).await
            }
            ClientMessage::PrivateMessage { to, data } => {
                self.handle_private_message(conn, &to, data).await
            }
            ClientMessage::GroupMessage { data } => self.handle_group_message(conn, data).await,
            ClientMessage::FileShare { uuid, to, data } => {
                self.handle_file_share(conn, &uuid, to, data).await
            }
            ClientMessage::ChangeNickname { nickname } => {
                self.handle_change_nickname(conn, session::normalize_nickname(&nickname))
                    .await
            }
        }
    }

    async fn handle_register(&self, conn: &Arc<ConnectionHandle>, registration: Registration) {
        let outcome = {
            let mut state = self.registry().lock().await;
            session::register(&mut state, conn.id(), registration, Utc::now())
        };

        let nickname = match outcome {
            RegisterOutcome::Joined { nickname } => nickname,
            RegisterOutcome::Resumed {
                nickname,
                displaced,
            } => {
                if let Some(old) = displaced {
                    debug!(old = %old.id(), new = %conn.id(), "Closing displaced connection");
                    old.close();
                }
                nickname
            }
            RegisterOutcome::Rejected => {
                warn!(conn = %conn.id(), "Registration rejected, closing connection");
                conn.close();
                return;
            }
            RegisterOutcome::AlreadyRegistered => {
                debug!(conn = %conn.id(), "Ignoring repeated registration");
                return;
            }
        };

        info!(conn = %conn.id(), nickname = %nickname, "Client registered");
        let mut overflowed = self.send_welcome(conn).await;
        overflowed.extend(self.broadcast_user_list().await);
        overflowed.extend(
            self.broadcast_presence_change(PresenceEvent::Joined, &nickname)
                .await,
        );
        self.evict(overflowed).await;
    }

    async fn handle_private_message(&self, conn: &Arc<ConnectionHandle>, to: &str, data: Value) {
        let (from, recipient) = {
            let state = self.registry().lock().await;
            (state.nickname_of(conn.id()), state.resolve_nickname(to))
        };
        let Some(from) = from else {
            debug!(conn = %conn.id(), "Private message from unregistered connection");
            return;
        };
        // The recipient may simply have left.
        let Some(recipient) = recipient else {
            debug!(from = %from, to = %to, "Private message to unknown recipient");
            return;
        };

        let overflowed = self.fan_out(&[recipient], &ServerMessage::PrivateMessage { from, data });
        self.evict(overflowed).await;
    }

    async fn handle_group_message(&self, conn: &Arc<ConnectionHandle>, data: Value) {
        let (from, targets) = {
            let state = self.registry().lock().await;
            (state.nickname_of(conn.id()), state.peers(Some(conn.id())))
        };
        let Some(from) = from else {
            debug!(conn = %conn.id(), "Group message from unregistered connection");
            return;
        };

        let overflowed = self.fan_out(&targets, &ServerMessage::GroupMessage { from, data });
        self.evict(overflowed).await;
    }

    async fn handle_file_share(
        &self,
        conn: &Arc<ConnectionHandle>,
        uuid: &str,
        to: Recipient,
        data: Value,
    ) {
        let Ok(file_id) = Uuid::parse_str(uuid) else {
            debug!(conn = %conn.id(), uuid = %uuid, "File share with invalid identifier");
            return;
        };

        let (from, targets) = {
            let mut state = self.registry().lock().await;
            let Some(from) = state.nickname_of(conn.id()) else {
                debug!(conn = %conn.id(), "File share from unregistered connection");
                return;
            };
            if let Err(e) = files::add_reference(&mut state, self.store(), file_id, &from, to.clone()) {
                warn!(uuid = %file_id, from = %from, error = %e, "Rejected file share");
                return;
            }
            let targets = match &to {
                // Includes the sender so its other views stay in sync.
                Recipient::Group => state.peers(None),
                Recipient::User(nickname) => state.resolve_nickname(nickname).into_iter().collect(),
            };
            (from, targets)
        };

        let relay = ServerMessage::FileShare {
            from,
            to: to.to_string(),
            uuid: file_id.to_string(),
            data,
        };
        let overflowed = self.fan_out(&targets, &relay);
        self.evict(overflowed).await;
    }

    async fn handle_change_nickname(&self, conn: &Arc<ConnectionHandle>, requested: &str) {
        let result = {
            let mut state = self.registry().lock().await;
            session::change_nickname(&mut state, conn.id(), requested)
        };

        let old = match result {
            Ok(old) => old,
            Err(NicknameError::NotRegistered) => {
                debug!(conn = %conn.id(), "Nickname change from unregistered connection");
                return;
            }
            Err(e) => {
                debug!(conn = %conn.id(), requested = %requested, error = %e, "Nickname change refused");
                let reply = ServerMessage::NicknameError { data: e.to_string() };
                let overflowed = self.fan_out(std::slice::from_ref(conn), &reply);
                self.evict(overflowed).await;
                return;
            }
        };

        info!(conn = %conn.id(), old = %old, new = %requested, "Nickname changed");
        let overflowed = self.broadcast_nickname_change(&old, requested).await;
        self.evict(overflowed).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::hub::testing::{test_hub, Peer};
    use crate::hub::Hub;

    async fn finished_upload(hub: &Hub) -> uuid::Uuid {
        let uuid = hub.start_upload().await.unwrap();
        hub.append_chunk(uuid, b"blob").await.unwrap();
        hub.finish_upload(uuid, None).await.unwrap();
        uuid
    }

    #[tokio::test]
    async fn test_private_message_delivery() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        let mut carol = Peer::registered(&hub, "c-c", "carol").await;
        alice.drain();
        bob.drain();
        carol.drain();

        alice
            .say(&hub, r#"{"type":"privateMessage","to":"bob","data":"cipher"}"#)
            .await;
        let frames = bob.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "privateMessage");
        assert_eq!(frames[0]["from"], "alice");
        assert_eq!(frames[0]["data"], "cipher");
        assert!(carol.drain().is_empty());
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn test_private_message_to_unknown_is_silent() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        alice.drain();
        alice
            .say(&hub, r#"{"type":"privateMessage","to":"ghost","data":"x"}"#)
            .await;
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn test_group_message_skips_sender() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        let mut lurker = Peer::connect(&hub).await;
        alice.drain();
        bob.drain();

        alice
            .say(&hub, r#"{"type":"groupMessage","data":{"encryptedData":"e"}}"#)
            .await;
        let frames = bob.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["from"], "alice");
        assert_eq!(frames[0]["data"]["encryptedData"], "e");
        assert!(alice.drain().is_empty());
        // Not registered yet, so not part of the room.
        assert!(lurker.drain().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        alice.drain();
        bob.drain();

        alice.say(&hub, "{oops").await;
        alice.say(&hub, r#"{"type":"typing"}"#).await;
        alice.say(&hub, r#"{"type":"groupMessage","data":"still alive"}"#).await;

        assert!(!alice.conn.is_closed());
        let frames = bob.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"], "still alive");
    }

    #[tokio::test]
    async fn test_unregistered_sender_is_ignored() {
        let (hub, _dir) = test_hub().await;
        let stranger = Peer::connect(&hub).await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        bob.drain();

        stranger
            .say(&hub, r#"{"type":"groupMessage","data":"hi"}"#)
            .await;
        stranger
            .say(&hub, r#"{"type":"privateMessage","to":"bob","data":"hi"}"#)
            .await;
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn test_change_nickname_broadcasts_rename() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        alice.drain();
        bob.drain();

        alice
            .say(&hub, r#"{"type":"changeNickname","data":"alicia"}"#)
            .await;

        for frames in [alice.drain(), bob.drain()] {
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "nicknameChanged");
            assert_eq!(frames[0]["oldNickname"], "alice");
            assert_eq!(frames[0]["newNickname"], "alicia");
            assert_eq!(frames[0]["users"]["alicia"], "PK");
            assert!(frames[0]["users"].get("alice").is_none());
        }
    }

    #[tokio::test]
    async fn test_change_to_taken_nickname_only_tells_requester() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        alice.drain();
        bob.drain();

        alice
            .say(&hub, r#"{"type":"changeNickname","data":"bob"}"#)
            .await;
        alice.say(&hub, r#"{"type":"changeNickname","data":"  "}"#).await;

        let errors = alice.drain_types();
        assert_eq!(errors, vec!["nicknameError", "nicknameError"]);
        assert!(bob.drain().is_empty());

        let state = hub.registry().lock().await;
        assert_eq!(state.nickname_of(alice.id()).as_deref(), Some("alice"));
        assert_eq!(state.resolve_nickname("bob").unwrap().id(), bob.id());
    }

    #[tokio::test]
    async fn test_group_token_cannot_be_claimed() {
        let (hub, _dir) = test_hub().await;
        let mut squatter = Peer::registered(&hub, "c-g", "group").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;

        let welcome = &squatter.drain()[0];
        assert_eq!(welcome["type"], "welcome");
        assert_ne!(welcome["nickname"], "group");
        bob.drain();

        bob.say(&hub, r#"{"type":"changeNickname","data":"group"}"#).await;
        let frames = bob.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "nicknameError");
        assert_eq!(frames[0]["data"], "Nickname is reserved");
        assert!(squatter.drain().is_empty());
        assert!(!hub.registry().lock().await.is_bound("group"));
    }

    #[tokio::test]
    async fn test_change_nickname_broadcasts_trimmed_name() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        alice.drain();

        alice
            .say(&hub, r#"{"type":"changeNickname","data":"  alicia "}"#)
            .await;
        let frames = alice.drain();
        assert_eq!(frames[0]["newNickname"], "alicia");
        assert!(hub.registry().lock().await.is_bound("alicia"));
    }

    #[tokio::test]
    async fn test_file_share_to_group_echoes_to_sender() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        alice.drain();
        bob.drain();

        let uuid = finished_upload(&hub).await;
        alice
            .say(&hub, &format!(r#"{{"type":"fileShare","to":"group","uuid":"{uuid}","data":"meta"}}"#))
            .await;

        for frames in [alice.drain(), bob.drain()] {
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "fileShare");
            assert_eq!(frames[0]["from"], "alice");
            assert_eq!(frames[0]["to"], "group");
            assert_eq!(frames[0]["uuid"], uuid.to_string());
            assert_eq!(frames[0]["data"], "meta");
        }
    }

    #[tokio::test]
    async fn test_repeated_share_appends_reference() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;

        let uuid = finished_upload(&hub).await;
        let share = format!(r#"{{"type":"fileShare","to":"bob","uuid":"{uuid}","data":"m"}}"#);
        alice.say(&hub, &share).await;
        alice.say(&hub, &share).await;
        alice.drain();
        assert_eq!(bob.drain_types(), vec!["welcome", "userListUpdate", "fileShare", "fileShare"]);

        let state = hub.registry().lock().await;
        assert_eq!(state.file_count(), 1);
        assert_eq!(state.lookup_file(&uuid).unwrap().references.len(), 2);
    }

    #[tokio::test]
    async fn test_file_share_of_unknown_upload_is_dropped() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        alice.drain();

        let unknown = uuid::Uuid::new_v4();
        alice
            .say(&hub, &format!(r#"{{"type":"fileShare","to":"group","uuid":"{unknown}","data":"m"}}"#))
            .await;
        alice
            .say(&hub, r#"{"type":"fileShare","to":"group","uuid":"not-a-uuid","data":"m"}"#)
            .await;
        assert!(alice.drain().is_empty());
        assert_eq!(hub.registry().lock().await.file_count(), 0);
    }

    #[tokio::test]
    async fn test_impersonation_closes_new_connection() {
        let (hub, _dir) = test_hub().await;
        let owner = Peer::registered(&hub, "c-a", "alice").await;

        let mut intruder = Peer::connect(&hub).await;
        intruder.register(&hub, "c-a", "FORGED", "mallory").await;

        assert!(intruder.conn.is_closed());
        assert!(intruder.drain().is_empty());
        assert!(!owner.conn.is_closed());

        let state = hub.registry().lock().await;
        assert_eq!(state.resolve_nickname("alice").unwrap().id(), owner.id());
        assert_eq!(state.lookup_session("c-a").unwrap().live, Some(owner.id()));
    }

    #[tokio::test]
    async fn test_reconnect_resumes_nickname_and_reannounces() {
        let (hub, _dir) = test_hub().await;
        let alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;

        hub.disconnect(alice.id()).await;
        bob.drain();

        let mut again = Peer::connect(&hub).await;
        again.register(&hub, "c-a", "PK", "").await;

        let welcome = &again.drain()[0];
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["nickname"], "alice");
        let announced = bob.drain();
        assert!(announced
            .iter()
            .any(|f| f["type"] == "userJoined" && f["nickname"] == "alice"));
    }

    #[tokio::test]
    async fn test_reconnect_displaces_live_connection() {
        let (hub, _dir) = test_hub().await;
        let old = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;
        bob.drain();

        let new = Peer::registered(&hub, "c-a", "").await;
        assert!(old.conn.is_closed());

        // The old socket's teardown arrives late and must not undo the rebind.
        hub.disconnect(old.id()).await;
        assert!(bob.drain().iter().all(|f| f["type"] != "userLeft"));

        let state = hub.registry().lock().await;
        assert_eq!(state.resolve_nickname("alice").unwrap().id(), new.id());
        assert_eq!(state.lookup_session("c-a").unwrap().live, Some(new.id()));
    }
}
