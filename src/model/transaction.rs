//! Live transactions and the changes the engine asks the loop to apply.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One allocation/offer change over the course of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChargingHistory {
    pub timestamp: DateTime<Utc>,
    pub offered: f64,
}

/// A change the engine wants applied to a connector, in amps.
///
/// `transaction_id` is `None` for the starting case, where no transaction
/// exists yet and the change is implemented through the blocking default
/// profile instead of a TxProfile.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeChange {
    pub charger_id: String,
    pub connector_id: u32,
    pub transaction_id: Option<i32>,
    pub allocation: f64,
}

/// An active charging session on one connector, between StartTransaction
/// and StopTransaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: i32,
    pub charger_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    /// Resolved from the tag table at start, "Unknown" otherwise.
    pub user_name: String,
    pub start_time: DateTime<Utc>,
    /// Wh register reading at start.
    pub meter_start: i64,
    /// Last usage in amps as reported by the charger.
    pub usage_meter: Option<f64>,
    /// Wh register, updated by MeterValues.
    pub energy_meter: i64,
    pub last_usage_time: DateTime<Utc>,
    /// Priority override (from the tag, or set through the API); falls back
    /// to the charger's static priority when absent.
    pub priority: Option<i32>,
    pub charging_history: Vec<ChargingHistory>,
}

impl Transaction {
    pub fn new(
        transaction_id: i32,
        charger_id: &str,
        connector_id: u32,
        id_tag: &str,
        user_name: String,
        start_time: DateTime<Utc>,
        meter_start: i64,
        priority: Option<i32>,
    ) -> Self {
        Self {
            transaction_id,
            charger_id: charger_id.to_string(),
            connector_id,
            id_tag: id_tag.to_string(),
            user_name,
            start_time,
            meter_start,
            usage_meter: None,
            energy_meter: meter_start,
            last_usage_time: start_time,
            priority,
            charging_history: Vec::new(),
        }
    }

    pub fn id_str(&self) -> String {
        format!(
            "{}/{}:{}",
            self.charger_id, self.connector_id, self.transaction_id
        )
    }
}
