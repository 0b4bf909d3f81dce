//! Stale-transaction watchdog.
//!
//! Chargers can drop off the network mid-transaction; the OCPP session
//! cleanup deliberately leaves their transactions alone (the charger may
//! reconnect and resume reporting). This sweep synthesizes a stop for any
//! transaction on a charger that has been silent past the timeout, so
//! ghost transactions never hold allocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::model::{ConnectorStatus, Store};
use crate::support::shutdown::ShutdownSignal;

pub async fn run(cfg: Arc<AppConfig>, store: Arc<Store>, shutdown: ShutdownSignal) {
    info!("model watchdog started");
    let period = Duration::from_secs(cfg.csms.transaction_interval.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.wait() => {
                info!("model watchdog stopped");
                return;
            }
        }
        sweep(&store, Utc::now(), cfg.csms.transaction_timeout);
    }
}

/// One watchdog pass: pseudo-stop every transaction on a silent charger and
/// return the connector to `Available`.
pub fn sweep(store: &Store, now: DateTime<Utc>, timeout: i64) {
    for (charger_id, connector_id, transaction_id, energy_meter) in
        store.stale_transactions(now, timeout)
    {
        warn!(
            charger_id = charger_id.as_str(),
            connector_id,
            transaction_id,
            "pseudo-stopping transaction of silent charger"
        );
        match store.stop_transaction(
            &charger_id,
            transaction_id,
            energy_meter,
            now,
            Some("Other".to_string()),
            None,
        ) {
            Ok(_) => {
                store.force_connector_status(&charger_id, connector_id, ConnectorStatus::Available);
            }
            Err(e) => {
                error!(charger_id = charger_id.as_str(), transaction_id, error = %e, "pseudo-stop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::model::{Tag, TagStatus};
    use chrono::Duration as ChronoDuration;

    #[test]
    fn silent_charger_gets_its_transaction_stopped() {
        let store = Store::new(Arc::new(AppConfig::default()));
        store.add_group("G1", None, Some("00:00-23:59>0=48")).unwrap();
        store
            .add_charger("CP-1", "G1", "Bay 1", 1, 1, None, Some(32.0), None)
            .unwrap();
        store.upsert_tag(Tag::new("T1", None, None, None, TagStatus::Activated, None));

        let start = Utc::now();
        store.mark_connected("CP-1", start);
        store.start_transaction("CP-1", 1, "T1", 0, start).unwrap();
        store
            .meter_values("CP-1", 1, 8.0, Some(2200), None, Some(1), start, start)
            .unwrap();
        store.mark_disconnected("CP-1");

        // Not yet past the timeout: nothing happens.
        sweep(&store, start + ChronoDuration::seconds(100), 300);
        store.with_model(|m| {
            assert!(m.chargers["CP-1"].connectors[&1].transaction.is_some());
        });

        // Past the timeout: stopped with reason Other, meter pinned at the
        // last energy reading, connector available again.
        sweep(&store, start + ChronoDuration::seconds(400), 300);
        store.with_model(|m| {
            let conn = &m.chargers["CP-1"].connectors[&1];
            assert!(conn.transaction.is_none());
            assert_eq!(conn.status, Some(ConnectorStatus::Available));
            assert_eq!(m.sessions.len(), 1);
            let session = m.sessions.values().next().unwrap();
            assert_eq!(session.reason.as_deref(), Some("Other"));
            assert_eq!(session.energy, 2200);
        });
    }

    #[test]
    fn live_chargers_are_left_alone() {
        let store = Store::new(Arc::new(AppConfig::default()));
        store.add_group("G1", None, Some("00:00-23:59>0=48")).unwrap();
        store
            .add_charger("CP-1", "G1", "Bay 1", 1, 1, None, Some(32.0), None)
            .unwrap();
        store.upsert_tag(Tag::new("T1", None, None, None, TagStatus::Activated, None));

        let start = Utc::now();
        store.mark_connected("CP-1", start);
        store.start_transaction("CP-1", 1, "T1", 0, start).unwrap();

        // The charger keeps talking.
        let later = start + ChronoDuration::seconds(400);
        store.touch("CP-1", later);
        sweep(&store, later + ChronoDuration::seconds(10), 300);
        store.with_model(|m| {
            assert!(m.chargers["CP-1"].connectors[&1].transaction.is_some());
            assert!(m.sessions.is_empty());
        });
    }
}
