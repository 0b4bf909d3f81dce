//! Charger model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::connector::Connector;

/// Dynamic metadata reported in BootNotification. Unknown payload keys are
/// ignored by the handler.
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    pub charge_box_serial_number: Option<String>,
    pub charge_point_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub meter_type: Option<String>,
}

/// A physical charger with 1..N connectors, belonging to exactly one group.
#[derive(Debug, Clone)]
pub struct Charger {
    pub charger_id: String,
    pub alias: String,
    pub group_id: String,
    /// Static priority, higher = served earlier. Transactions may override
    /// it per connector via their tag or the API.
    pub priority: i32,
    pub description: Option<String>,
    /// Per-connector amp ceiling.
    pub conn_max: f64,
    /// sha-256 of the expected HTTP Basic `Authorization` header value.
    pub auth_sha: Option<String>,
    pub boot_info: BootInfo,
    /// Keyed 1..N; connector 0 is not modelled.
    pub connectors: BTreeMap<u32, Connector>,
    /// When the charger was last heard from. Survives disconnects so the
    /// stale-transaction watchdog can still time out its transactions.
    pub last_update: Option<DateTime<Utc>>,
    /// Whether a live OCPP session is attached right now.
    pub connected: bool,
    /// Default profiles have been (re)installed since the last connect.
    pub profile_initialized: bool,
    /// Post-(re)connect state triggers have been sent.
    pub requested_status: bool,
}

impl Charger {
    pub fn new(
        charger_id: &str,
        group_id: &str,
        alias: &str,
        no_connectors: u32,
        priority: i32,
        description: Option<String>,
        conn_max: f64,
        auth_sha: Option<String>,
    ) -> Self {
        let connectors = (1..=no_connectors.max(1))
            .map(|connector_id| (connector_id, Connector::new(charger_id, connector_id)))
            .collect();
        Self {
            charger_id: charger_id.to_string(),
            alias: alias.to_string(),
            group_id: group_id.to_string(),
            priority,
            description,
            conn_max,
            auth_sha,
            boot_info: BootInfo::default(),
            connectors,
            last_update: None,
            connected: false,
            profile_initialized: false,
            requested_status: false,
        }
    }

    /// Effective priority of a connector: the transaction override when one
    /// is set, else the charger's static priority.
    pub fn connector_priority(&self, connector_id: u32) -> i32 {
        self.connectors
            .get(&connector_id)
            .and_then(|c| c.transaction.as_ref())
            .and_then(|t| t.priority)
            .unwrap_or(self.priority)
    }

    /// Sum of offers across connectors.
    pub fn offered(&self) -> f64 {
        self.connectors
            .values()
            .filter_map(|c| c.offered)
            .sum()
    }

    /// Sum of reported usage across connectors with live transactions.
    pub fn usage(&self) -> f64 {
        self.connectors
            .values()
            .filter_map(|c| c.transaction.as_ref())
            .filter_map(|t| t.usage_meter)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transaction::Transaction;
    use chrono::Utc;

    fn charger() -> Charger {
        Charger::new("CP-1", "G1", "Bay 1", 2, 1, None, 32.0, None)
    }

    #[test]
    fn connectors_are_one_based() {
        let c = charger();
        assert_eq!(c.connectors.len(), 2);
        assert!(c.connectors.contains_key(&1));
        assert!(c.connectors.contains_key(&2));
        assert!(!c.connectors.contains_key(&0));
    }

    #[test]
    fn transaction_priority_overrides_static() {
        let mut c = charger();
        assert_eq!(c.connector_priority(1), 1);

        let mut tx = Transaction::new(1, "CP-1", 1, "TAG", "user".into(), Utc::now(), 0, Some(5));
        c.connectors.get_mut(&1).unwrap().transaction = Some(tx.clone());
        assert_eq!(c.connector_priority(1), 5);

        tx.priority = None;
        c.connectors.get_mut(&1).unwrap().transaction = Some(tx);
        assert_eq!(c.connector_priority(1), 1);
    }
}
