//! Session registry: the live WebSocket connections, keyed by charger id.
//!
//! The registry is the only owner of outbound senders. The model keeps a
//! `connected` mirror of this table; the registry is authoritative.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One live charger connection.
struct Connection {
    sender: mpsc::UnboundedSender<String>,
    connected_at: DateTime<Utc>,
}

/// Thread-safe registry of active charger sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Connection>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. An existing session for the same charger is
    /// evicted: dropping its sender ends the old send task, which tears the
    /// old socket down.
    pub fn register(&self, charger_id: &str, sender: mpsc::UnboundedSender<String>) {
        if let Some((_, old)) = self.sessions.remove(charger_id) {
            warn!(
                charger_id,
                connected_since = %old.connected_at,
                "evicting stale session, new connection replaces old"
            );
        }
        info!(charger_id, "registering charger session");
        self.sessions.insert(
            charger_id.to_string(),
            Connection {
                sender,
                connected_at: Utc::now(),
            },
        );
    }

    pub fn unregister(&self, charger_id: &str) {
        if self.sessions.remove(charger_id).is_some() {
            info!(charger_id, "unregistered charger session");
        }
    }

    /// Send raw text to a charger. Fails when not connected.
    pub fn send_to(&self, charger_id: &str, message: String) -> Result<(), String> {
        match self.sessions.get(charger_id) {
            Some(conn) => conn
                .sender
                .send(message)
                .map_err(|_| format!("send channel closed for {charger_id}")),
            None => Err(format!("charger {charger_id} not connected")),
        }
    }

    pub fn is_connected(&self, charger_id: &str) -> bool {
        self.sessions.contains_key(charger_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
