//! OCPP 1.6 WebSocket server.
//!
//! Chargers connect at `ws://<host>:<port>/<charger_id>` with subprotocol
//! `ocpp1.6`; the `/api` path dispatches to the admin API instead. Each
//! accepted charger gets a receive loop, an outbound send task and a
//! liveness watchdog that closes silent connections so the charger
//! reconnects.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::api::users::UserTable;
use crate::config::AppConfig;
use crate::model::{csv as model_csv, Store};
use crate::support::authutil::{basic_auth_header, digest_eq, gen_authorization_key, sha256_hex};
use crate::support::frame::Frame;
use crate::support::shutdown::ShutdownSignal;

use super::calls::CallSender;
use super::handlers;
use super::profile::ProfileDriver;
use super::registry::SessionRegistry;

/// OCPP 1.6 WebSocket subprotocol.
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Shared handles every connection needs. Cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    pub cfg: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub calls: Arc<CallSender>,
    pub profiles: Arc<ProfileDriver>,
    pub users: Arc<UserTable>,
    pub started_at: DateTime<Utc>,
}

pub struct OcppServer {
    ctx: ServerContext,
    shutdown: ShutdownSignal,
}

impl OcppServer {
    pub fn new(ctx: ServerContext, shutdown: ShutdownSignal) -> Self {
        Self { ctx, shutdown }
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.ctx.cfg.server.address();
        let listener = TcpListener::bind(&addr).await?;
        info!("🔌 OCPP 1.6 central system listening on ws://{addr}");
        info!("   chargers connect to ws://{addr}/<charger_id>, clients to ws://{addr}/api");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let ctx = self.ctx.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, ctx, shutdown).await {
                                    error!(%peer, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = self.shutdown.wait() => {
                    info!("OCPP server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Charger id is the trailing path component.
fn extract_charger_id(path: &str) -> Option<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    trimmed.rsplit('/').next().map(str::to_string)
}

async fn close_with(
    mut ws: WebSocketStream<TcpStream>,
    code: CloseCode,
    reason: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ws.close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
    .await?;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    shutdown: ShutdownSignal,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let mut authorization: Option<String> = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
        path = req.uri().path().to_string();
        authorization = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let requested = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if requested.split(',').map(str::trim).any(|p| p == OCPP_SUBPROTOCOL) {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", OCPP_SUBPROTOCOL.parse().unwrap());
        }
        Ok(response)
    })
    .await?;

    debug!(%peer, path = path.as_str(), "websocket established");

    // Client connections go to the API handler.
    if path.trim_matches('/') == "api" {
        return crate::api::handle_api(ws_stream, ctx).await;
    }

    let Some(charger_id) = extract_charger_id(&path) else {
        warn!(%peer, path = path.as_str(), "connection without charger id");
        return close_with(ws_stream, CloseCode::Invalid, "missing charge point id".into()).await;
    };

    // Unknown chargers are auto-registered into the configured group, or
    // rejected.
    if !ctx.store.has_charger(&charger_id) {
        if ctx.cfg.model.charger_autoregister {
            let group = ctx.cfg.model.charger_autoregister_group.clone();
            info!(charger_id = charger_id.as_str(), group = group.as_str(), "auto-registering charger");
            if let Err(e) =
                ctx.store
                    .add_charger(&charger_id, &group, &charger_id, 1, 1, None, None, None)
            {
                error!(charger_id = charger_id.as_str(), error = %e, "auto-registration failed");
                return close_with(ws_stream, CloseCode::Invalid, format!("Charge point {charger_id} unknown")).await;
            }
        } else {
            let msg = format!("Charge point {charger_id} unknown");
            error!("{msg}");
            return close_with(ws_stream, CloseCode::Invalid, msg).await;
        }
    }

    // HTTP Basic authentication. A charger with a stored digest must match
    // it; one without gets a key provisioned after a grace delay.
    let mut provision_key = false;
    if ctx.cfg.server.http_auth {
        match ctx.store.auth_sha(&charger_id) {
            Some(expected) => {
                let Some(header) = authorization.as_deref() else {
                    warn!(charger_id = charger_id.as_str(), "rejecting connection, missing Basic auth");
                    return close_with(ws_stream, CloseCode::Policy, "missing Basic auth".into()).await;
                };
                if !digest_eq(&sha256_hex(header), &expected) {
                    error!(charger_id = charger_id.as_str(), "rejecting connection, wrong Basic auth");
                    return close_with(ws_stream, CloseCode::Policy, "authentication error".into()).await;
                }
            }
            None => provision_key = true,
        }
    }

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    ctx.registry.register(&charger_id, tx);
    ctx.store.mark_connected(&charger_id, Utc::now());
    info!(charger_id = charger_id.as_str(), %peer, "charger connected");

    // Outbound pump.
    let send_id = charger_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            debug!(charger_id = send_id.as_str(), "-> {text}");
            if let Err(e) = ws_sender.send(Message::Text(text)).await {
                error!(charger_id = send_id.as_str(), error = %e, "send failed");
                break;
            }
        }
    });

    // First-contact AuthorizationKey provisioning.
    if provision_key {
        spawn_provisioning(&ctx, charger_id.clone());
    }

    // Inbound loop.
    let recv_ctx = ctx.clone();
    let recv_id = charger_id.clone();
    let recv_loop = async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    debug!(charger_id = recv_id.as_str(), "<- {text}");
                    recv_ctx.store.touch(&recv_id, Utc::now());
                    handle_inbound(&recv_ctx, &recv_id, &text);
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    info!(charger_id = recv_id.as_str(), ?frame, "close frame received");
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!(charger_id = recv_id.as_str(), bytes = data.len(), "ignoring binary message");
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!(charger_id = recv_id.as_str(), error = %e, "websocket error");
                    break;
                }
            }
        }
    };

    // Liveness watchdog: a silent charger gets its socket closed and is
    // expected to reconnect.
    let dog_ctx = ctx.clone();
    let dog_id = charger_id.clone();
    let watchdog = async move {
        let period = Duration::from_secs(dog_ctx.cfg.server.watchdog_interval.max(1));
        loop {
            tokio::time::sleep(period).await;
            let last = dog_ctx
                .store
                .with_model(|m| m.chargers.get(&dog_id).and_then(|c| c.last_update));
            let elapsed = last.map(|t| (Utc::now() - t).num_seconds());
            if elapsed.map(|e| e > dog_ctx.cfg.server.watchdog_stale).unwrap_or(false) {
                error!(
                    charger_id = dog_id.as_str(),
                    elapsed = elapsed.unwrap_or(0),
                    "no activity, closing connection"
                );
                return;
            }
        }
    };

    tokio::select! {
        _ = recv_loop => {}
        _ = watchdog => {}
        _ = shutdown.wait() => {
            info!(charger_id = charger_id.as_str(), "closing connection for shutdown");
        }
    }

    send_task.abort();
    ctx.registry.unregister(&charger_id);
    ctx.calls.cleanup_charger(&charger_id);
    // last_update is kept so the stale-transaction watchdog can still act.
    ctx.store.mark_disconnected(&charger_id);
    info!(charger_id = charger_id.as_str(), "charger disconnected");
    Ok(())
}

/// Parse one inbound text frame and route it.
fn handle_inbound(ctx: &ServerContext, charger_id: &str, text: &str) {
    match Frame::parse(text) {
        Ok(Frame::Call {
            unique_id,
            action,
            payload,
        }) => {
            let reply = handlers::handle_call(&ctx.store, charger_id, &unique_id, &action, &payload);
            if let Err(e) = ctx.registry.send_to(charger_id, reply.serialize()) {
                error!(charger_id, error = %e, "failed to send reply");
            }
        }
        Ok(Frame::CallResult { unique_id, payload }) => {
            ctx.calls.handle_result(charger_id, &unique_id, payload);
        }
        Ok(Frame::CallError {
            unique_id,
            error_code,
            error_description,
            ..
        }) => {
            ctx.calls
                .handle_error(charger_id, &unique_id, &error_code, &error_description);
        }
        Err(e) => {
            // Malformed traffic is answered with a protocol error; the
            // socket stays open.
            warn!(charger_id, error = %e, "malformed frame");
            let reply = Frame::error("", "ProtocolError", e.to_string());
            let _ = ctx.registry.send_to(charger_id, reply.serialize());
        }
    }
}

/// After a grace delay, set a generated AuthorizationKey on the charger and
/// remember the matching Basic-auth digest.
fn spawn_provisioning(ctx: &ServerContext, charger_id: String) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(ctx.cfg.server.http_auth_delay)).await;

        let key = gen_authorization_key();
        match ctx
            .profiles
            .change_configuration(&charger_id, "AuthorizationKey", &key)
            .await
        {
            Ok(status) => {
                let sha = sha256_hex(&basic_auth_header(&charger_id, &key));
                if let Err(e) = ctx.store.set_auth_sha(&charger_id, sha) {
                    error!(charger_id = charger_id.as_str(), error = %e, "failed to store auth digest");
                    return;
                }
                info!(
                    charger_id = charger_id.as_str(),
                    status = status.as_str(),
                    "AuthorizationKey provisioned"
                );
                if let Some(path) = ctx.cfg.model.chargers_csv.as_deref() {
                    if let Err(e) = model_csv::write_chargers(&ctx.store, Path::new(path)) {
                        warn!(error = %e, "failed to rewrite chargers CSV");
                    }
                }
            }
            Err(e) => {
                warn!(charger_id = charger_id.as_str(), error = %e, "AuthorizationKey provisioning failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charger_id_is_the_trailing_path_component() {
        assert_eq!(extract_charger_id("/CP-1"), Some("CP-1".to_string()));
        assert_eq!(extract_charger_id("/ocpp/CP-1"), Some("CP-1".to_string()));
        assert_eq!(extract_charger_id("/CP-1/"), Some("CP-1".to_string()));
        assert_eq!(extract_charger_id("/"), None);
        assert_eq!(extract_charger_id(""), None);
    }
}
