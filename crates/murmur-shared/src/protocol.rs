//! WebSocket wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminant. Inbound frames
//! are first parsed into the loose [`Envelope`] and then narrowed into a
//! [`ClientMessage`], which carries only the fields each kind needs.
//! Outbound frames are built from [`ServerMessage`].
//!
//! The `data` payload is opaque to the server: it is relayed as-is and
//! never inspected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::GROUP_RECIPIENT;
use crate::error::ProtocolError;

/// Nickname -> public key directory sent to clients.
pub type Directory = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Raw message envelope as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(
        rename = "proposedNickname",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub proposed_nickname: Option<String>,
}

/// Addressee of a share: one nickname or the whole room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Group,
    User(String),
}

impl Recipient {
    /// An absent or empty `to`, or the group token, addresses the room.
    pub fn parse(to: Option<&str>) -> Self {
        match to {
            None | Some("") => Recipient::Group,
            Some(GROUP_RECIPIENT) => Recipient::Group,
            Some(nickname) => Recipient::User(nickname.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Recipient::Group => GROUP_RECIPIENT,
            Recipient::User(nickname) => nickname,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Recipient::Group)
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Bind this connection to an identity. `client_id` is `None` for the
    /// legacy `publicKey` handshake, which creates no durable session.
    Register {
        client_id: Option<String>,
        public_key: String,
        proposed_nickname: Option<String>,
    },
    PrivateMessage {
        to: String,
        data: Value,
    },
    GroupMessage {
        data: Value,
    },
    FileShare {
        uuid: String,
        to: Recipient,
        data: Value,
    },
    ChangeNickname {
        nickname: String,
    },
}

impl ClientMessage {
    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for well-formed envelopes of a kind the server
    /// does not handle.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, ProtocolError> {
        let Envelope {
            kind,
            client_id,
            to,
            uuid,
            data,
            public_key,
            proposed_nickname,
            ..
        } = envelope;

        let message = match kind.as_str() {
            "register" => ClientMessage::Register {
                client_id: non_empty(client_id),
                public_key: public_key.unwrap_or_default(),
                proposed_nickname: non_empty(proposed_nickname),
            },
            "publicKey" => ClientMessage::Register {
                client_id: None,
                public_key: data
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(public_key)
                    .unwrap_or_default(),
                proposed_nickname: None,
            },
            "privateMessage" => ClientMessage::PrivateMessage {
                to: non_empty(to).ok_or(ProtocolError::MissingField {
                    kind: "privateMessage",
                    field: "to",
                })?,
                data: data.unwrap_or(Value::Null),
            },
            "groupMessage" => ClientMessage::GroupMessage {
                data: data.unwrap_or(Value::Null),
            },
            "fileShare" => ClientMessage::FileShare {
                uuid: non_empty(uuid).ok_or(ProtocolError::MissingField {
                    kind: "fileShare",
                    field: "uuid",
                })?,
                to: Recipient::parse(to.as_deref()),
                data: data.unwrap_or(Value::Null),
            },
            "changeNickname" => ClientMessage::ChangeNickname {
                nickname: data
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => return Ok(None),
        };

        Ok(Some(message))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Messages the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Sent to a client once its registration succeeds.
    Welcome { nickname: String, users: Directory },

    UserListUpdate { users: Directory },

    /// Rename announcement, carrying the refreshed directory.
    NicknameChanged {
        #[serde(rename = "oldNickname")]
        old_nickname: String,
        #[serde(rename = "newNickname")]
        new_nickname: String,
        users: Directory,
    },

    /// Rename rejected; only the requester receives this.
    NicknameError { data: String },

    UserJoined { nickname: String },

    UserLeft { nickname: String },

    PrivateMessage { from: String, data: Value },

    GroupMessage { from: String, data: Value },

    /// A previously stored file was shared again without re-uploading.
    FileNotification {
        from: String,
        uuid: String,
        #[serde(rename = "originalFilename")]
        original_filename: String,
    },

    /// Relay of a client's share announcement.
    FileShare {
        from: String,
        to: String,
        uuid: String,
        data: Value,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
