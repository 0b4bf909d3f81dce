//! Outbound OCPP call transport.
//!
//! Sends `[2, id, action, payload]` frames to chargers and correlates the
//! `CallResult`/`CallError` replies by unique id. Calls to the same charger
//! are serialized, one in flight per charger at a time, while different
//! chargers proceed in parallel. Every call observes a reply timeout so a
//! vanished charger can never wedge the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::support::frame::Frame;

use super::registry::SessionRegistry;

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("charger not connected: {0}")]
    NotConnected(String),
    #[error("failed to send: {0}")]
    SendFailed(String),
    #[error("reply timeout")]
    Timeout,
    #[error("invalid reply: {0}")]
    InvalidResponse(String),
    #[error("CallError {code}: {description}")]
    CallError { code: String, description: String },
    #[error("charger refused: {0}")]
    Rejected(String),
}

struct PendingCall {
    action: String,
    reply: oneshot::Sender<Result<Value, CallError>>,
}

/// Correlated, per-charger-serialized OCPP call sender.
pub struct CallSender {
    registry: Arc<SessionRegistry>,
    pending: DashMap<(String, String), PendingCall>,
    /// One lock per charger enforcing a single call in flight.
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    counter: AtomicU64,
    reply_timeout: Duration,
}

impl CallSender {
    pub fn new(registry: Arc<SessionRegistry>, reply_timeout: Duration) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            counter: AtomicU64::new(1),
            reply_timeout,
        }
    }

    fn next_id(&self) -> String {
        format!("CS-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn charger_lock(&self, charger_id: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .entry(charger_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Send one call and await its reply payload.
    pub async fn send_call(
        &self,
        charger_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CallError> {
        let lock = self.charger_lock(charger_id);
        let _serialized = lock.lock().await;

        let unique_id = self.next_id();
        let text = Frame::Call {
            unique_id: unique_id.clone(),
            action: action.to_string(),
            payload,
        }
        .serialize();

        let (tx, rx) = oneshot::channel();
        let key = (charger_id.to_string(), unique_id.clone());
        self.pending.insert(
            key.clone(),
            PendingCall {
                action: action.to_string(),
                reply: tx,
            },
        );

        debug!(charger_id, action, unique_id = unique_id.as_str(), "sending call");
        if let Err(e) = self.registry.send_to(charger_id, text) {
            self.pending.remove(&key);
            return Err(CallError::NotConnected(e));
        }

        match timeout(self.reply_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&key);
                Err(CallError::InvalidResponse("reply channel closed".into()))
            }
            Err(_) => {
                self.pending.remove(&key);
                warn!(charger_id, action, unique_id = unique_id.as_str(), "call timed out");
                Err(CallError::Timeout)
            }
        }
    }

    /// Route an inbound `CallResult` to its waiting caller.
    pub fn handle_result(&self, charger_id: &str, unique_id: &str, payload: Value) {
        let key = (charger_id.to_string(), unique_id.to_string());
        if let Some((_, pending)) = self.pending.remove(&key) {
            debug!(
                charger_id,
                action = pending.action.as_str(),
                unique_id,
                "reply received"
            );
            let _ = pending.reply.send(Ok(payload));
        } else {
            warn!(charger_id, unique_id, "reply for unknown call");
        }
    }

    /// Route an inbound `CallError` to its waiting caller.
    pub fn handle_error(&self, charger_id: &str, unique_id: &str, code: &str, description: &str) {
        let key = (charger_id.to_string(), unique_id.to_string());
        if let Some((_, pending)) = self.pending.remove(&key) {
            warn!(
                charger_id,
                action = pending.action.as_str(),
                unique_id,
                code,
                description,
                "call errored"
            );
            let _ = pending.reply.send(Err(CallError::CallError {
                code: code.to_string(),
                description: description.to_string(),
            }));
        }
    }

    /// Drop pending state for a charger whose connection went away.
    pub fn cleanup_charger(&self, charger_id: &str) {
        self.pending.retain(|key, _| key.0 != charger_id);
        self.in_flight.remove(charger_id);
    }
}
