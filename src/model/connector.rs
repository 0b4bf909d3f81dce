//! Connector model: OCPP status, the currently communicated limit and the
//! engine-private planning state.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::transaction::Transaction;

/// OCPP 1.6 connector status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    /// The subset of statuses a live transaction can be in.
    pub fn in_transaction(self) -> bool {
        matches!(
            self,
            Self::Charging | Self::SuspendedEV | Self::SuspendedEVSE
        )
    }
}

/// Engine-private planning state. Not externally visible except for
/// `ev_max_usage` and `suspend_until`, which the API reports for diagnosis.
///
/// Zeroed via [`BalanzScratch::reset`] whenever a transaction starts or the
/// connector leaves the in-transaction statuses.
#[derive(Debug, Clone)]
pub struct BalanzScratch {
    /// Planned allocation of the current engine pass (amps).
    pub allocation: f64,
    /// Desired ceiling computed by the current engine pass (amps).
    pub max_desired: f64,
    /// Set once the current engine pass has finalized this connector.
    pub done: bool,
    /// The connector likely needs an engine look within the next tick.
    pub to_review: bool,
    /// Observed EV ceiling, sticky downward for the rest of the transaction.
    pub ev_max_usage: Option<f64>,
    /// Do not re-offer capacity before this time.
    pub suspend_until: Option<DateTime<Utc>>,
    /// Whether the blocking default profile is believed to be in place.
    pub blocking_profile_reset: bool,
    /// When the current offer was last raised to or above the minimum.
    pub last_offer_time: Option<DateTime<Utc>>,
    /// Sliding window of `(amps, timestamp)` usage samples.
    pub recent_usages: VecDeque<(f64, DateTime<Utc>)>,
}

impl Default for BalanzScratch {
    fn default() -> Self {
        Self {
            allocation: 0.0,
            max_desired: 0.0,
            done: false,
            to_review: false,
            ev_max_usage: None,
            suspend_until: None,
            blocking_profile_reset: true,
            last_offer_time: None,
            recent_usages: VecDeque::new(),
        }
    }
}

impl BalanzScratch {
    /// Clear the per-transaction fields. The blocking-profile flag and the
    /// review flag have their own lifecycles and are left alone.
    pub fn reset(&mut self) {
        self.ev_max_usage = None;
        self.suspend_until = None;
        self.last_offer_time = None;
        self.recent_usages.clear();
    }
}

/// A physical connector on a charger, numbered from 1. Connector 0 (the
/// charger itself) is not modelled.
#[derive(Debug, Clone)]
pub struct Connector {
    pub charger_id: String,
    pub connector_id: u32,
    /// Unset until the first StatusNotification arrives.
    pub status: Option<ConnectorStatus>,
    /// Limit currently communicated to the charger (amps). `None` until the
    /// engine or a MeterValues report establishes one.
    pub offered: Option<f64>,
    /// Present iff a live transaction exists on this connector.
    pub transaction: Option<Transaction>,
    pub balanz: BalanzScratch,
}

impl Connector {
    pub fn new(charger_id: &str, connector_id: u32) -> Self {
        Self {
            charger_id: charger_id.to_string(),
            connector_id,
            status: None,
            offered: None,
            transaction: None,
            balanz: BalanzScratch::default(),
        }
    }

    pub fn id_str(&self) -> String {
        format!("{}/{}", self.charger_id, self.connector_id)
    }

    pub fn status_in_transaction(&self) -> bool {
        self.status.map(ConnectorStatus::in_transaction).unwrap_or(false)
    }

    /// Record a usage sample and expire everything older than `window` seconds.
    pub fn update_recent_usage(&mut self, usage: f64, timestamp: DateTime<Utc>, window: i64) {
        self.balanz.recent_usages.push_back((usage, timestamp));
        self.expire_recent_usage(Utc::now(), window);
    }

    pub fn expire_recent_usage(&mut self, now: DateTime<Utc>, window: i64) {
        self.balanz
            .recent_usages
            .retain(|(_, ts)| (now - *ts).num_seconds() < window);
    }

    /// Maximum usage seen inside the sliding window, 0 when empty.
    pub fn max_recent_usage(&mut self, now: DateTime<Utc>, window: i64) -> f64 {
        self.expire_recent_usage(now, window);
        self.balanz
            .recent_usages
            .iter()
            .map(|(usage, _)| *usage)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn in_transaction_statuses() {
        for status in [
            ConnectorStatus::Charging,
            ConnectorStatus::SuspendedEV,
            ConnectorStatus::SuspendedEVSE,
        ] {
            assert!(status.in_transaction());
        }
        for status in [
            ConnectorStatus::Available,
            ConnectorStatus::Preparing,
            ConnectorStatus::Finishing,
            ConnectorStatus::Faulted,
        ] {
            assert!(!status.in_transaction());
        }
    }

    #[test]
    fn recent_usage_window_keeps_the_max() {
        let mut conn = Connector::new("CP-1", 1);
        let now = Utc::now();
        let window = 300;
        conn.balanz.recent_usages.push_back((9.5, now - Duration::seconds(400)));
        conn.balanz.recent_usages.push_back((6.2, now - Duration::seconds(200)));
        conn.balanz.recent_usages.push_back((5.8, now - Duration::seconds(10)));

        // The 400s-old peak has fallen out of the window.
        assert_eq!(conn.max_recent_usage(now, window), 6.2);
        assert_eq!(conn.balanz.recent_usages.len(), 2);
    }

    #[test]
    fn scratch_reset_preserves_blocking_flag() {
        let mut scratch = BalanzScratch {
            ev_max_usage: Some(10.0),
            suspend_until: Some(Utc::now()),
            last_offer_time: Some(Utc::now()),
            blocking_profile_reset: false,
            ..Default::default()
        };
        scratch.reset();
        assert!(scratch.ev_max_usage.is_none());
        assert!(scratch.suspend_until.is_none());
        assert!(scratch.last_offer_time.is_none());
        assert!(!scratch.blocking_profile_reset);
    }
}
