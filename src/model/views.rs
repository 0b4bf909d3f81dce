//! External (JSON) views of the model served by the admin API.
//!
//! Engine-private state stays hidden except `ev_max_usage` and
//! `suspend_until`, which operators need for diagnosing delayed sessions.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use super::charger::Charger;
use super::connector::Connector;
use super::session::SessionRecord;
use super::store::Model;
use super::transaction::{ChargingHistory, Transaction};

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub group_id: String,
    pub description: Option<String>,
    pub chargers: Vec<String>,
    pub max_allocation: Option<String>,
    pub max_allocation_now: Vec<(i32, f64)>,
    pub offered: f64,
    pub usage: f64,
    pub suspended: bool,
}

#[derive(Debug, Serialize)]
pub struct ChargerView {
    pub charger_id: String,
    pub alias: String,
    pub group_id: String,
    pub priority: i32,
    pub description: Option<String>,
    pub conn_max: f64,
    pub charge_point_vendor: Option<String>,
    pub charge_point_model: Option<String>,
    pub firmware_version: Option<String>,
    pub network_connected: bool,
    pub connectors: Vec<ConnectorView>,
}

#[derive(Debug, Serialize)]
pub struct ConnectorView {
    pub connector_id: u32,
    pub status: Option<String>,
    pub offered: Option<f64>,
    pub priority: i32,
    pub transaction_id: Option<i32>,
    pub ev_max_usage: Option<f64>,
    pub suspend_until: Option<DateTime<Utc>>,
    pub transaction: Option<TransactionView>,
}

#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub id_tag: String,
    pub user_name: String,
    pub start_time: DateTime<Utc>,
    pub meter_start: i64,
    pub usage_meter: Option<f64>,
    pub energy_meter: i64,
    pub priority: Option<i32>,
    pub charging_history: Vec<ChargingHistory>,
}

pub fn group_view(model: &Model, group_id: &str) -> Option<GroupView> {
    let group = model.groups.get(group_id)?;
    let members: Vec<&Charger> = model
        .chargers
        .values()
        .filter(|c| c.group_id == group_id)
        .collect();
    let mut chargers: Vec<String> = members.iter().map(|c| c.charger_id.clone()).collect();
    chargers.sort();
    let now = Utc::now().with_timezone(&Local).time();
    Some(GroupView {
        group_id: group.group_id.clone(),
        description: group.description.clone(),
        chargers,
        max_allocation: group.max_allocation.as_ref().map(|s| s.to_string()),
        max_allocation_now: group
            .max_allocation
            .as_ref()
            .and_then(|s| s.buckets_at(now).map(<[_]>::to_vec))
            .unwrap_or_default(),
        offered: members.iter().map(|c| c.offered()).sum(),
        usage: members.iter().map(|c| c.usage()).sum(),
        suspended: group.suspended,
    })
}

pub fn charger_view(charger: &Charger) -> ChargerView {
    ChargerView {
        charger_id: charger.charger_id.clone(),
        alias: charger.alias.clone(),
        group_id: charger.group_id.clone(),
        priority: charger.priority,
        description: charger.description.clone(),
        conn_max: charger.conn_max,
        charge_point_vendor: some_nonempty(&charger.boot_info.charge_point_vendor),
        charge_point_model: some_nonempty(&charger.boot_info.charge_point_model),
        firmware_version: charger.boot_info.firmware_version.clone(),
        network_connected: charger.connected,
        connectors: charger
            .connectors
            .values()
            .map(|conn| connector_view(conn, charger.connector_priority(conn.connector_id)))
            .collect(),
    }
}

fn connector_view(conn: &Connector, priority: i32) -> ConnectorView {
    ConnectorView {
        connector_id: conn.connector_id,
        status: conn.status.map(|s| format!("{s:?}")),
        offered: conn.offered,
        priority,
        transaction_id: conn.transaction.as_ref().map(|t| t.transaction_id),
        ev_max_usage: conn.balanz.ev_max_usage,
        suspend_until: conn.balanz.suspend_until,
        transaction: conn.transaction.as_ref().map(transaction_view),
    }
}

fn transaction_view(trans: &Transaction) -> TransactionView {
    TransactionView {
        id_tag: trans.id_tag.clone(),
        user_name: trans.user_name.clone(),
        start_time: trans.start_time,
        meter_start: trans.meter_start,
        usage_meter: trans.usage_meter,
        energy_meter: trans.energy_meter,
        priority: trans.priority,
        charging_history: trans.charging_history.clone(),
    }
}

/// Sessions, optionally filtered to one charger or one group.
pub fn sessions_view<'a>(
    model: &'a Model,
    charger_id: Option<&str>,
    group_id: Option<&str>,
) -> Vec<&'a SessionRecord> {
    model
        .sessions
        .values()
        .filter(|s| match (group_id, charger_id) {
            (Some(g), _) => s.group_id == g,
            (None, Some(c)) => s.charger_id == c,
            (None, None) => true,
        })
        .collect()
}

fn some_nonempty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
