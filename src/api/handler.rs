//! The admin/observer API.
//!
//! Served on the `/api` path of the same WebSocket endpoint the chargers
//! use, framed like OCPP-J: `[2, id, command, payload]` in,
//! `[3, id, result]` / `[4, id, {"status": …}]` out. A `Login` call gates
//! everything else; commands are whitelisted per role.

use std::path::Path;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::model::views;
use crate::model::{csv as model_csv, Tag, TagStatus};
use crate::ocpp::{CallError, ServerContext};
use crate::support::timeutil::time_str;

use super::users::Role;

/// Drive one API client connection until it closes.
pub async fn handle_api(
    ws_stream: WebSocketStream<TcpStream>,
    ctx: ServerContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut sender, mut receiver) = ws_stream.split();
    let mut role: Option<Role> = None;

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let reply = dispatch(&ctx, &mut role, &text).await;
                if sender.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "api connection error");
                break;
            }
        }
    }
    Ok(())
}

fn ok(message_id: &Value, payload: Value) -> Value {
    json!([3, message_id, payload])
}

fn fail(message_id: &Value, status: &str) -> Value {
    json!([4, message_id, { "status": status }])
}

fn call_error_status(e: &CallError) -> String {
    match e {
        CallError::NotConnected(_) => "ChargerNotConnected".to_string(),
        CallError::Timeout => "Timeout".to_string(),
        CallError::Rejected(status) => status.clone(),
        CallError::CallError { code, .. } => code.clone(),
        CallError::SendFailed(_) | CallError::InvalidResponse(_) => "InternalError".to_string(),
    }
}

/// Minimum role per command. Commands absent here do not exist.
fn required_role(command: &str) -> Option<Role> {
    Some(match command {
        "GetStatus" | "GetGroups" | "GetChargers" => Role::Status,
        "GetSessions" => Role::Analysis,
        "SetChargePriority" => Role::SessionPriority,
        "GetTags" | "CreateTag" | "UpdateTag" | "DeleteTag" | "ReloadTags" | "WriteTags" => {
            Role::Tags
        }
        "SetBalanzState"
        | "UpdateGroup"
        | "UpdateCharger"
        | "ReloadGroups"
        | "WriteGroups"
        | "ReloadChargers"
        | "WriteChargers"
        | "ClearDefaultProfiles"
        | "SetTxProfile"
        | "Reset"
        | "RemoteStartTransaction"
        | "RemoteStopTransaction"
        | "GetConfiguration"
        | "ChangeConfiguration"
        | "TriggerMessage"
        | "UpdateFirmware" => Role::Admin,
        _ => return None,
    })
}

/// Commands that address a charger and require it to be connected.
fn needs_connected_charger(command: &str) -> bool {
    matches!(
        command,
        "ClearDefaultProfiles"
            | "SetTxProfile"
            | "Reset"
            | "RemoteStartTransaction"
            | "RemoteStopTransaction"
            | "GetConfiguration"
            | "ChangeConfiguration"
            | "TriggerMessage"
            | "UpdateFirmware"
            | "SetChargePriority"
    )
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

fn int_field(payload: &Value, key: &str) -> Option<i64> {
    payload.get(key).and_then(Value::as_i64)
}

fn float_field(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

/// Resolve the addressed charger: an explicit id wins, otherwise an
/// unambiguous alias.
fn resolve_charger(ctx: &ServerContext, payload: &Value) -> Option<String> {
    if let Some(id) = str_field(payload, "charger_id") {
        return Some(id);
    }
    str_field(payload, "alias").and_then(|alias| ctx.store.charger_id_for_alias(&alias))
}

pub async fn dispatch(ctx: &ServerContext, role: &mut Option<Role>, text: &str) -> Value {
    let Ok(call) = serde_json::from_str::<Value>(text) else {
        return fail(&json!("0"), "ProtocolError");
    };
    let Some(parts) = call.as_array() else {
        return fail(&json!("0"), "ProtocolError");
    };
    if parts.len() != 4 || parts[0].as_u64() != Some(2) {
        warn!("malformed api call");
        return fail(parts.get(1).unwrap_or(&json!("0")), "ProtocolError");
    }
    let message_id = parts[1].clone();
    let Some(command) = parts[2].as_str() else {
        return fail(&message_id, "ProtocolError");
    };
    let payload = parts[3].clone();

    // Tokens stay out of the log.
    if command != "Login" {
        info!(command, %payload, "api command");
    }

    if command == "Login" {
        let token = str_field(&payload, "token").unwrap_or_default();
        return match ctx.users.check_token(&token) {
            Some(granted) => {
                *role = Some(granted);
                ok(&message_id, json!({"status": "Accepted"}))
            }
            None => fail(&message_id, "InvalidLogin"),
        };
    }

    let Some(current) = *role else {
        return fail(&message_id, "NotAuthorized");
    };
    let Some(required) = required_role(command) else {
        return fail(&message_id, "UnknownCommand");
    };
    if current < required {
        return fail(&message_id, "NotAuthorized");
    }

    // Common precondition for charger-addressed commands.
    let mut target_charger: Option<String> = None;
    if needs_connected_charger(command) {
        let Some(charger_id) = resolve_charger(ctx, &payload) else {
            return fail(&message_id, "NoSuchCharger");
        };
        if !ctx.store.has_charger(&charger_id) {
            return fail(&message_id, "NoSuchCharger");
        }
        if !ctx.registry.is_connected(&charger_id) {
            return fail(&message_id, "ChargerNotConnected");
        }
        target_charger = Some(charger_id);
    }

    match command {
        "GetStatus" => ok(
            &message_id,
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "started": time_str(ctx.started_at),
                "chargers_connected": ctx.registry.count(),
            }),
        ),

        "GetGroups" => {
            let groups = ctx.store.with_model(|m| {
                let mut ids: Vec<_> = m.groups.keys().cloned().collect();
                ids.sort();
                ids.iter()
                    .filter_map(|id| views::group_view(m, id))
                    .collect::<Vec<_>>()
            });
            ok(&message_id, serde_json::to_value(groups).unwrap_or_default())
        }

        "GetChargers" => {
            let group_id = str_field(&payload, "group_id");
            let charger_id = resolve_charger(ctx, &payload);
            let chargers = ctx.store.with_model(|m| {
                let mut list: Vec<_> = m
                    .chargers
                    .values()
                    .filter(|c| group_id.as_deref().map(|g| c.group_id == g).unwrap_or(true))
                    .filter(|c| {
                        charger_id
                            .as_deref()
                            .map(|id| c.charger_id == id)
                            .unwrap_or(true)
                    })
                    .collect();
                list.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
                list.iter().map(|c| views::charger_view(c)).collect::<Vec<_>>()
            });
            ok(&message_id, serde_json::to_value(chargers).unwrap_or_default())
        }

        "GetSessions" => {
            let group_id = str_field(&payload, "group_id");
            let charger_id = str_field(&payload, "charger_id");
            let sessions = ctx.store.with_model(|m| {
                serde_json::to_value(views::sessions_view(
                    m,
                    charger_id.as_deref(),
                    group_id.as_deref(),
                ))
                .unwrap_or_default()
            });
            ok(&message_id, sessions)
        }

        "SetBalanzState" => {
            let suspend = payload.get("suspend").and_then(Value::as_bool).unwrap_or(false);
            let Some(group_id) = str_field(&payload, "group_id") else {
                return fail(&message_id, "NoSuchGroup");
            };
            match ctx.store.set_balanz_suspend(&group_id, suspend) {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, e.status()),
            }
        }

        "SetChargePriority" => {
            let charger_id = target_charger.unwrap_or_default();
            let connector_id = int_field(&payload, "connector_id").unwrap_or(1) as u32;
            let Some(priority) = int_field(&payload, "priority") else {
                return fail(&message_id, "PriorityNotSupplied");
            };
            match ctx
                .store
                .set_charge_priority(&charger_id, connector_id, priority as i32)
            {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, e.status()),
            }
        }

        "UpdateGroup" => {
            let Some(group_id) = str_field(&payload, "group_id") else {
                return fail(&message_id, "NoSuchGroup");
            };
            match ctx.store.update_group(
                &group_id,
                str_field(&payload, "description"),
                str_field(&payload, "max_allocation").as_deref(),
            ) {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, e.status()),
            }
        }

        "UpdateCharger" => {
            let Some(charger_id) = resolve_charger(ctx, &payload) else {
                return fail(&message_id, "NoSuchCharger");
            };
            match ctx.store.update_charger(
                &charger_id,
                str_field(&payload, "alias"),
                int_field(&payload, "priority").map(|p| p as i32),
                str_field(&payload, "description"),
                float_field(&payload, "conn_max"),
            ) {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, e.status()),
            }
        }

        "GetTags" => {
            let tags = ctx.store.with_model(|m| {
                let mut tags: Vec<_> = m.tags.values().cloned().collect();
                tags.sort_by(|a, b| a.id_tag.cmp(&b.id_tag));
                serde_json::to_value(tags).unwrap_or_default()
            });
            ok(&message_id, tags)
        }

        "CreateTag" => {
            let Some(id_tag) = str_field(&payload, "id_tag") else {
                return fail(&message_id, "NoSuchTag");
            };
            let status = match str_field(&payload, "status").as_deref() {
                Some("Blocked") => TagStatus::Blocked,
                _ => TagStatus::Activated,
            };
            let tag = Tag::new(
                &id_tag,
                str_field(&payload, "user_name"),
                str_field(&payload, "parent_id_tag"),
                str_field(&payload, "description"),
                status,
                int_field(&payload, "priority").map(|p| p as i32),
            );
            match ctx.store.create_tag(tag) {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(_) => fail(&message_id, "TagExists"),
            }
        }

        "UpdateTag" => {
            let Some(id_tag) = str_field(&payload, "id_tag") else {
                return fail(&message_id, "NoSuchTag");
            };
            let status = match str_field(&payload, "status").as_deref() {
                Some("Blocked") => Some(TagStatus::Blocked),
                Some("Activated") => Some(TagStatus::Activated),
                _ => None,
            };
            match ctx.store.update_tag(
                &id_tag,
                str_field(&payload, "user_name"),
                str_field(&payload, "parent_id_tag"),
                str_field(&payload, "description"),
                status,
                int_field(&payload, "priority").map(|p| p as i32),
            ) {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, e.status()),
            }
        }

        "DeleteTag" => {
            let Some(id_tag) = str_field(&payload, "id_tag") else {
                return fail(&message_id, "NoSuchTag");
            };
            match ctx.store.delete_tag(&id_tag) {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, e.status()),
            }
        }

        "ReloadGroups" | "WriteGroups" | "ReloadChargers" | "WriteChargers" | "ReloadTags"
        | "WriteTags" => {
            let path = match command {
                "ReloadGroups" | "WriteGroups" => ctx.cfg.model.groups_csv.as_deref(),
                "ReloadChargers" | "WriteChargers" => ctx.cfg.model.chargers_csv.as_deref(),
                _ => ctx.cfg.model.tags_csv.as_deref(),
            };
            let Some(path) = path else {
                return fail(&message_id, "NotConfigured");
            };
            let path = Path::new(path);
            let result = match command {
                "ReloadGroups" => model_csv::load_groups(&ctx.store, path),
                "WriteGroups" => model_csv::write_groups(&ctx.store, path),
                "ReloadChargers" => model_csv::load_chargers(&ctx.store, path),
                "WriteChargers" => model_csv::write_chargers(&ctx.store, path),
                "ReloadTags" => model_csv::load_tags(&ctx.store, path),
                _ => model_csv::write_tags(&ctx.store, path),
            };
            match result {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, e.status()),
            }
        }

        // ── OCPP pass-through ──────────────────────────────────
        "ClearDefaultProfiles" => {
            let charger_id = target_charger.unwrap_or_default();
            match ctx.profiles.clear_all_default_profiles(&charger_id).await {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "SetTxProfile" => {
            let charger_id = target_charger.unwrap_or_default();
            let connector_id = int_field(&payload, "connector_id").unwrap_or(1) as u32;
            let transaction_id =
                int_field(&payload, "transaction_id").unwrap_or(connector_id as i64) as i32;
            let Some(limit) = float_field(&payload, "limit") else {
                return fail(&message_id, "LimitNotSupplied");
            };
            match ctx
                .profiles
                .set_tx_profile(&charger_id, connector_id, transaction_id, limit)
                .await
            {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "Reset" => {
            let charger_id = target_charger.unwrap_or_default();
            let hard = matches!(str_field(&payload, "type").as_deref(), Some("Hard"));
            match ctx.profiles.reset(&charger_id, hard).await {
                Ok(status) => ok(&message_id, json!({"status": status})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "RemoteStartTransaction" => {
            let charger_id = target_charger.unwrap_or_default();
            let Some(id_tag) = str_field(&payload, "id_tag") else {
                return fail(&message_id, "NoSuchTag");
            };
            let connector_id = int_field(&payload, "connector_id").map(|c| c as u32);
            match ctx
                .profiles
                .remote_start_transaction(&charger_id, &id_tag, connector_id)
                .await
            {
                Ok(status) => ok(&message_id, json!({"status": status})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "RemoteStopTransaction" => {
            let charger_id = target_charger.unwrap_or_default();
            let Some(transaction_id) = int_field(&payload, "transaction_id") else {
                return fail(&message_id, "NoSuchTransaction");
            };
            match ctx
                .profiles
                .remote_stop_transaction(&charger_id, transaction_id as i32)
                .await
            {
                Ok(status) => ok(&message_id, json!({"status": status})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "GetConfiguration" => {
            let charger_id = target_charger.unwrap_or_default();
            let keys = payload.get("keys").and_then(Value::as_array).map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            });
            match ctx.profiles.get_configuration(&charger_id, keys).await {
                Ok(config) => ok(&message_id, config),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "ChangeConfiguration" => {
            let charger_id = target_charger.unwrap_or_default();
            let (Some(key), Some(value)) =
                (str_field(&payload, "key"), str_field(&payload, "value"))
            else {
                return fail(&message_id, "KeyOrValueNotSupplied");
            };
            match ctx.profiles.change_configuration(&charger_id, &key, &value).await {
                Ok(status) => ok(&message_id, json!({"status": status})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "TriggerMessage" => {
            let charger_id = target_charger.unwrap_or_default();
            let Some(requested) = str_field(&payload, "requested_message") else {
                return fail(&message_id, "MessageNotSupplied");
            };
            let connector_id = int_field(&payload, "connector_id").map(|c| c as u32);
            match ctx
                .profiles
                .trigger_message(&charger_id, &requested, connector_id)
                .await
            {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        "UpdateFirmware" => {
            let charger_id = target_charger.unwrap_or_default();
            let Some(location) = str_field(&payload, "location") else {
                return fail(&message_id, "LocationNotSupplied");
            };
            match ctx
                .profiles
                .update_firmware(&charger_id, &location, Utc::now())
                .await
            {
                Ok(()) => ok(&message_id, json!({"status": "Accepted"})),
                Err(e) => fail(&message_id, &call_error_status(&e)),
            }
        }

        // required_role() already rejected anything unknown.
        _ => fail(&message_id, "UnknownCommand"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::model::{Store, TagStatus};
    use crate::ocpp::{CallSender, ProfileDriver, SessionRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::users::UserTable;

    fn context() -> ServerContext {
        let cfg = Arc::new(AppConfig::default());
        let store = Arc::new(Store::new(cfg.clone()));
        store.add_group("SITE", None, Some("00:00-23:59>0=24:3=40:5=48")).unwrap();
        store
            .add_charger("CP-1", "SITE", "Bay 1", 1, 1, None, Some(32.0), None)
            .unwrap();
        store.upsert_tag(Tag::new("CARD", None, None, None, TagStatus::Activated, None));

        let registry = Arc::new(SessionRegistry::new());
        let calls = Arc::new(CallSender::new(registry.clone(), Duration::from_secs(5)));
        let profiles = Arc::new(ProfileDriver::new(calls.clone(), cfg.balanz.min_allocation));
        let users = Arc::new(UserTable::new());
        users.put("ops", Role::Admin, "admin-token");
        users.put("viewer", Role::Status, "viewer-token");

        ServerContext {
            cfg,
            store,
            registry,
            calls,
            profiles,
            users,
            started_at: Utc::now(),
        }
    }

    fn call(command: &str, payload: Value) -> String {
        json!([2, "m1", command, payload]).to_string()
    }

    async fn login(ctx: &ServerContext, role: &mut Option<Role>, token: &str) -> Value {
        dispatch(ctx, role, &call("Login", json!({"token": token}))).await
    }

    #[tokio::test]
    async fn commands_require_login() {
        let ctx = context();
        let mut role = None;
        let reply = dispatch(&ctx, &mut role, &call("GetChargers", json!({}))).await;
        assert_eq!(reply[0], 4);
        assert_eq!(reply[2]["status"], "NotAuthorized");
    }

    #[tokio::test]
    async fn bad_token_is_invalid_login() {
        let ctx = context();
        let mut role = None;
        let reply = login(&ctx, &mut role, "nope").await;
        assert_eq!(reply[2]["status"], "InvalidLogin");
        assert!(role.is_none());
    }

    #[tokio::test]
    async fn role_gating_is_a_ladder() {
        let ctx = context();
        let mut role = None;
        let reply = login(&ctx, &mut role, "viewer-token").await;
        assert_eq!(reply[2]["status"], "Accepted");

        // Status role may read…
        let reply = dispatch(&ctx, &mut role, &call("GetChargers", json!({}))).await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[2][0]["charger_id"], "CP-1");

        // …but not mutate engine state.
        let reply = dispatch(
            &ctx,
            &mut role,
            &call("SetBalanzState", json!({"group_id": "SITE", "suspend": true})),
        )
        .await;
        assert_eq!(reply[2]["status"], "NotAuthorized");
    }

    #[tokio::test]
    async fn set_balanz_state_flips_the_suspend_flag() {
        let ctx = context();
        let mut role = None;
        login(&ctx, &mut role, "admin-token").await;

        let reply = dispatch(
            &ctx,
            &mut role,
            &call("SetBalanzState", json!({"group_id": "SITE", "suspend": true})),
        )
        .await;
        assert_eq!(reply[2]["status"], "Accepted");
        assert!(ctx.store.group_suspended("SITE"));

        let reply = dispatch(
            &ctx,
            &mut role,
            &call("SetBalanzState", json!({"group_id": "nope", "suspend": true})),
        )
        .await;
        assert_eq!(reply[2]["status"], "NoSuchGroup");
    }

    #[tokio::test]
    async fn set_charge_priority_paths() {
        let ctx = context();
        let mut role = None;
        login(&ctx, &mut role, "admin-token").await;

        // Charger not connected.
        let reply = dispatch(
            &ctx,
            &mut role,
            &call("SetChargePriority", json!({"charger_id": "CP-1", "priority": 5})),
        )
        .await;
        assert_eq!(reply[2]["status"], "ChargerNotConnected");

        // Attach a session; missing priority is rejected.
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        ctx.registry.register("CP-1", tx);
        let reply = dispatch(
            &ctx,
            &mut role,
            &call("SetChargePriority", json!({"charger_id": "CP-1"})),
        )
        .await;
        assert_eq!(reply[2]["status"], "PriorityNotSupplied");

        // No transaction on the connector yet.
        let reply = dispatch(
            &ctx,
            &mut role,
            &call("SetChargePriority", json!({"charger_id": "CP-1", "priority": 5})),
        )
        .await;
        assert_eq!(reply[2]["status"], "ConnectorNotInTransaction");

        // With a live transaction the override lands, via alias resolution.
        ctx.store.start_transaction("CP-1", 1, "CARD", 0, Utc::now()).unwrap();
        let reply = dispatch(
            &ctx,
            &mut role,
            &call("SetChargePriority", json!({"alias": "Bay 1", "priority": 5})),
        )
        .await;
        assert_eq!(reply[2]["status"], "Accepted");
        ctx.store
            .with_model(|m| assert_eq!(m.chargers["CP-1"].connector_priority(1), 5));
    }

    #[tokio::test]
    async fn malformed_and_unknown_commands() {
        let ctx = context();
        let mut role = None;
        login(&ctx, &mut role, "admin-token").await;

        let reply = dispatch(&ctx, &mut role, "not json").await;
        assert_eq!(reply[2]["status"], "ProtocolError");

        let reply = dispatch(&ctx, &mut role, &json!([3, "m1", {}]).to_string()).await;
        assert_eq!(reply[2]["status"], "ProtocolError");

        let reply = dispatch(&ctx, &mut role, &call("MakeCoffee", json!({}))).await;
        assert_eq!(reply[2]["status"], "UnknownCommand");
    }

    #[tokio::test]
    async fn tag_crud_round_trip() {
        let ctx = context();
        let mut role = None;
        login(&ctx, &mut role, "admin-token").await;

        let reply = dispatch(
            &ctx,
            &mut role,
            &call("CreateTag", json!({"id_tag": "new01", "user_name": "Nils"})),
        )
        .await;
        assert_eq!(reply[2]["status"], "Accepted");

        // Duplicate (case-insensitively) is a conflict.
        let reply = dispatch(&ctx, &mut role, &call("CreateTag", json!({"id_tag": "NEW01"}))).await;
        assert_eq!(reply[2]["status"], "TagExists");

        let reply = dispatch(
            &ctx,
            &mut role,
            &call("UpdateTag", json!({"id_tag": "new01", "status": "Blocked"})),
        )
        .await;
        assert_eq!(reply[2]["status"], "Accepted");
        ctx.store.with_model(|m| {
            assert_eq!(m.tags["NEW01"].status, TagStatus::Blocked);
        });

        let reply = dispatch(&ctx, &mut role, &call("DeleteTag", json!({"id_tag": "NEW01"}))).await;
        assert_eq!(reply[2]["status"], "Accepted");
        let reply = dispatch(&ctx, &mut role, &call("DeleteTag", json!({"id_tag": "NEW01"}))).await;
        assert_eq!(reply[2]["status"], "NoSuchTag");
    }

    #[tokio::test]
    async fn get_groups_reports_allocation_state() {
        let ctx = context();
        let mut role = None;
        login(&ctx, &mut role, "viewer-token").await;

        let reply = dispatch(&ctx, &mut role, &call("GetGroups", json!({}))).await;
        assert_eq!(reply[0], 3);
        let group = &reply[2][0];
        assert_eq!(group["group_id"], "SITE");
        assert_eq!(group["suspended"], false);
        assert_eq!(group["chargers"][0], "CP-1");
        assert!(group["max_allocation"].as_str().unwrap().contains("0=24"));
    }
}
