//! Session manager.
//!
//! A session binds a client identifier, a public key and a nickname to at
//! most one live connection:
//!
//! ```text
//!   (none) --register--> Active --disconnect--> Disconnected --reap--> (none)
//!                          ^                         |
//!                          +-------reconnect---------+
//! ```
//!
//! A reconnect must present the same public key as the original
//! registration; a mismatch is treated as impersonation and rejected.
//! All functions here run inside one registry critical section.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use murmur_shared::constants::GROUP_RECIPIENT;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::hub::Hub;
use crate::registry::{RegistryState, Session, SessionState};

const ADJECTIVES: &[&str] = &["Happy", "Brave", "Clever", "Mystic", "Quiet", "Lively"];
const NOUNS: &[&str] = &["Tiger", "Dolphin", "Eagle", "Coder", "Explorer", "Thinker"];

/// Identity claimed by a `register` message.
#[derive(Debug, Clone)]
pub struct Registration {
    pub client_id: Option<String>,
    pub public_key: String,
    pub proposed_nickname: Option<String>,
}

#[derive(Debug)]
pub enum RegisterOutcome {
    /// Fresh identity.
    Joined { nickname: String },
    /// Existing session rebound to this connection. `displaced` is the
    /// previous connection if it was still registered.
    Resumed {
        nickname: String,
        displaced: Option<Arc<ConnectionHandle>>,
    },
    /// Known client identifier with a different public key.
    Rejected,
    AlreadyRegistered,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NicknameError {
    #[error("Nickname must not be empty")]
    Empty,

    #[error("Nickname is already taken")]
    Taken,

    #[error("Nickname is reserved")]
    Reserved,

    #[error("Connection is not registered")]
    NotRegistered,
}

/// Random `AdjectiveNoun0000` nickname.
pub fn generate_nickname() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}{}{:04}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        NOUNS[rng.gen_range(0..NOUNS.len())],
        rng.gen_range(0..10_000)
    )
}

/// Nicknames are compared after trimming surrounding whitespace.
pub fn normalize_nickname(raw: &str) -> &str {
    raw.trim()
}

/// The group token addresses the whole room and can never name a user.
pub fn is_reserved(nickname: &str) -> bool {
    nickname.eq_ignore_ascii_case(GROUP_RECIPIENT)
}

fn claim_nickname(state: &RegistryState, proposed: Option<&str>) -> String {
    if let Some(nickname) = proposed.map(normalize_nickname).filter(|n| !n.is_empty()) {
        if !is_reserved(nickname) && !state.nickname_in_use(nickname) {
            return nickname.to_string();
        }
    }
    loop {
        let nickname = generate_nickname();
        if !state.nickname_in_use(&nickname) {
            return nickname;
        }
    }
}

pub fn register(
    state: &mut RegistryState,
    conn: ConnectionId,
    registration: Registration,
    now: DateTime<Utc>,
) -> RegisterOutcome {
    match state.connection(conn) {
        None => return RegisterOutcome::Rejected,
        Some(entry) if entry.nickname.is_some() => return RegisterOutcome::AlreadyRegistered,
        Some(_) => {}
    }

    let Registration {
        client_id,
        public_key,
        proposed_nickname,
    } = registration;

    let Some(client_id) = client_id else {
        // Legacy handshake: no durable session.
        let nickname = claim_nickname(state, proposed_nickname.as_deref());
        if !bind(state, conn, &nickname, public_key, None) {
            return RegisterOutcome::Rejected;
        }
        return RegisterOutcome::Joined { nickname };
    };

    let existing = state
        .lookup_session(&client_id)
        .map(|s| (s.public_key.clone(), s.nickname.clone(), s.live));

    match existing {
        Some((known_key, _, _)) if known_key != public_key => {
            warn!(client = %client_id, conn = %conn, "Public key mismatch on reconnect");
            RegisterOutcome::Rejected
        }
        Some((_, previous, live)) => {
            let displaced = match live {
                Some(old) if old != conn => state.remove_connection(old).map(|e| e.handle),
                _ => None,
            };
            let nickname = if state.is_bound(&previous) {
                claim_nickname(state, None)
            } else {
                previous
            };
            if !bind(state, conn, &nickname, public_key, Some(client_id.clone())) {
                if let Some(old) = &displaced {
                    old.close();
                }
                return RegisterOutcome::Rejected;
            }
            if let Some(session) = state.session_mut(&client_id) {
                session.nickname = nickname.clone();
                session.live = Some(conn);
                session.last_seen = now;
            }
            info!(client = %client_id, conn = %conn, nickname = %nickname, "Session resumed");
            RegisterOutcome::Resumed {
                nickname,
                displaced,
            }
        }
        None => {
            let nickname = claim_nickname(state, proposed_nickname.as_deref());
            if !bind(state, conn, &nickname, public_key.clone(), Some(client_id.clone())) {
                return RegisterOutcome::Rejected;
            }
            state.upsert_session(Session {
                client_id: client_id.clone(),
                nickname: nickname.clone(),
                public_key,
                live: Some(conn),
                last_seen: now,
            });
            info!(client = %client_id, conn = %conn, nickname = %nickname, "Session created");
            RegisterOutcome::Joined { nickname }
        }
    }
}

/// Returns `false`, leaving the connection untouched, if `nickname` is
/// already bound elsewhere.
fn bind(
    state: &mut RegistryState,
    conn: ConnectionId,
    nickname: &str,
    public_key: String,
    session_id: Option<String>,
) -> bool {
    if !state.bind_nickname(nickname, conn) {
        warn!(conn = %conn, nickname = %nickname, "Nickname already bound to another connection");
        return false;
    }
    if let Some(entry) = state.connection_mut(conn) {
        entry.public_key = public_key;
        entry.session_id = session_id;
    }
    true
}

/// Clear the live binding of `client_id`, unless a newer connection has
/// already taken it over.
pub fn release(state: &mut RegistryState, conn: ConnectionId, client_id: &str, now: DateTime<Utc>) {
    let Some(session) = state.session_mut(client_id) else {
        return;
    };
    if session.live != Some(conn) {
        debug!(client = %client_id, conn = %conn, "Ignoring stale disconnect");
        return;
    }
    session.live = None;
    session.last_seen = now;
    debug!(client = %client_id, nickname = %session.nickname, "Session disconnected");
}

/// Delete disconnected sessions idle for longer than `timeout`.
pub fn reap(state: &mut RegistryState, now: DateTime<Utc>, timeout: Duration) -> Vec<Session> {
    state
        .sessions_idle_since(now - timeout)
        .into_iter()
        .filter_map(|client_id| state.expire_session(&client_id))
        .collect()
}

/// Rename the nickname bound to `conn`. Returns the old nickname.
pub fn change_nickname(
    state: &mut RegistryState,
    conn: ConnectionId,
    requested: &str,
) -> Result<String, NicknameError> {
    let requested = normalize_nickname(requested);
    let (old, session_id) = match state.connection(conn) {
        Some(entry) => match &entry.nickname {
            Some(nickname) => (nickname.clone(), entry.session_id.clone()),
            None => return Err(NicknameError::NotRegistered),
        },
        None => return Err(NicknameError::NotRegistered),
    };

    if requested.is_empty() {
        return Err(NicknameError::Empty);
    }
    if is_reserved(requested) {
        return Err(NicknameError::Reserved);
    }
    if state.nickname_in_use(requested) || !state.bind_nickname(requested, conn) {
        return Err(NicknameError::Taken);
    }

    if let Some(session) = session_id.as_deref().and_then(|id| state.session_mut(id)) {
        session.nickname = requested.to_string();
    }
    state.rename_references(&old, requested);
    Ok(old)
}

impl Hub {
    /// One reaper sweep. Returns the number of sessions removed.
    pub async fn reap_expired_sessions(&self, now: DateTime<Utc>) -> usize {
        let (expired, remaining) = {
            let mut state = self.registry().lock().await;
            let expired = reap(&mut state, now, self.settings().session_timeout);
            (expired, state.session_count())
        };
        for session in &expired {
            debug_assert_eq!(session.state(), SessionState::Disconnected);
            info!(client = %session.client_id, nickname = %session.nickname, "Session expired");
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), remaining, "Session reaper sweep");
        }
        expired.len()
    }
}
