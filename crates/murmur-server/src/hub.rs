//! Shared relay hub: registry, file store and delivery.
//!
//! Routing, presence, session and file operations are implemented as
//! `impl Hub` blocks in their own modules; this module owns construction,
//! fan-out and the disconnect path they all funnel into.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use murmur_shared::protocol::ServerMessage;

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, ConnectionId, SendError};
use crate::files::{self, FileStore};
use crate::presence::PresenceEvent;
use crate::registry::Registry;
use crate::session;

/// Runtime knobs the hub needs from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub outbound_queue: usize,
    pub write_timeout: Duration,
    pub session_timeout: chrono::Duration,
}

impl From<&ServerConfig> for HubSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_queue: config.outbound_queue,
            write_timeout: config.write_timeout,
            session_timeout: chrono::Duration::from_std(config.session_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

pub struct Hub {
    registry: Registry,
    store: FileStore,
    settings: HubSettings,
}

impl Hub {
    pub fn new(store: FileStore, settings: HubSettings) -> Self {
        Self {
            registry: Registry::new(),
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Register a fresh, not yet identified connection.
    pub async fn open_connection(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<String>) {
        let (conn, queue) = ConnectionHandle::new(self.settings.outbound_queue);
        let count = {
            let mut state = self.registry.lock().await;
            state.add_connection(conn.clone());
            state.connection_count()
        };
        info!(conn = %conn.id(), connections = count, "Connection opened");
        (conn, queue)
    }

    /// Encode once and enqueue to every target.
    ///
    /// Never blocks: a target whose queue is full is closed and returned
    /// so the caller can evict it once it holds no lock.
    pub fn fan_out(
        &self,
        targets: &[Arc<ConnectionHandle>],
        message: &ServerMessage,
    ) -> Vec<ConnectionId> {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode outbound message");
                return Vec::new();
            }
        };

        let mut overflowed = Vec::new();
        for target in targets {
            match target.send(frame.clone()) {
                Ok(()) | Err(SendError::Closed) => {}
                Err(SendError::Full) => {
                    warn!(conn = %target.id(), "Outbound queue full, dropping slow client");
                    target.close();
                    overflowed.push(target.id());
                }
            }
        }
        overflowed
    }

    pub async fn evict(&self, overflowed: Vec<ConnectionId>) {
        for id in overflowed {
            self.disconnect(id).await;
        }
    }

    /// Tear down a connection: unregister it, release its session binding,
    /// prune file references and announce the departure.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            pending.extend(self.unregister(id).await);
        }
    }

    async fn unregister(&self, id: ConnectionId) -> Vec<ConnectionId> {
        let now = Utc::now();
        let (entry, collected, remaining) = {
            let mut state = self.registry.lock().await;
            let Some(entry) = state.remove_connection(id) else {
                return Vec::new();
            };
            if let Some(client_id) = &entry.session_id {
                session::release(&mut state, id, client_id, now);
            }
            let collected = files::collect_garbage(&mut state, entry.nickname.as_deref());
            (entry, collected, state.connection_count())
        };

        entry.handle.close();
        info!(
            conn = %id,
            nickname = entry.nickname.as_deref().unwrap_or("-"),
            remaining,
            "Connection unregistered"
        );

        self.store.remove_records(&collected).await;

        let Some(nickname) = entry.nickname else {
            return Vec::new();
        };
        let mut overflowed = self
            .broadcast_presence_change(PresenceEvent::Left, &nickname)
            .await;
        overflowed.extend(self.broadcast_user_list().await);
        overflowed
    }
}
