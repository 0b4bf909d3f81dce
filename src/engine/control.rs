//! The per-group balanz control loop.
//!
//! One cooperative task per allocation group. Every tick it initializes
//! newly connected chargers, re-arms blocking profiles, installs post-start
//! TxProfiles, and (on full passes or when a connector demands urgent
//! attention) runs the planner and applies its changes, reduce before
//! grow with a settle delay in between.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::model::{ChargeChange, Store};
use crate::ocpp::{ProfileDriver, SessionRegistry};
use crate::support::errors::ModelError;
use crate::support::shutdown::ShutdownSignal;

use super::planner;

/// A step in the apply sequence. The settle marker separates the reduce
/// changes from the grow changes when both are present.
enum Step {
    Settle,
    Change(ChargeChange),
}

pub struct BalanzLoop {
    cfg: Arc<AppConfig>,
    store: Arc<Store>,
    profiles: Arc<ProfileDriver>,
    registry: Arc<SessionRegistry>,
    group_id: String,
}

impl BalanzLoop {
    pub fn new(
        cfg: Arc<AppConfig>,
        store: Arc<Store>,
        profiles: Arc<ProfileDriver>,
        registry: Arc<SessionRegistry>,
        group_id: String,
    ) -> Self {
        Self {
            cfg,
            store,
            profiles,
            registry,
            group_id,
        }
    }

    /// Run until shutdown. A tick failure is logged and the loop carries
    /// on: the planner is a pure function of current state, so the next
    /// tick self-heals.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let balanz = &self.cfg.balanz;
        info!(group_id = self.group_id.as_str(), "balanz loop started");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(balanz.first_wait)) => {}
            _ = shutdown.wait() => return,
        }

        let mut loop_count: u64 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(balanz.run_interval.max(1))) => {}
                _ = shutdown.wait() => {
                    info!(group_id = self.group_id.as_str(), "balanz loop stopped");
                    return;
                }
            }

            loop_count += 1;
            let full_pass = loop_count % balanz.intervals_full.max(1) == 0;
            if !full_pass && !self.store.group_needs_attention(&self.group_id) {
                continue;
            }

            if self.store.group_suspended(&self.group_id) {
                debug!(group_id = self.group_id.as_str(), "group suspended, skipping run");
                continue;
            }

            debug!(group_id = self.group_id.as_str(), loop_count, "balanz run");
            if let Err(e) = self.tick().await {
                error!(group_id = self.group_id.as_str(), error = %e, "balanz tick failed, retrying next tick");
            }
        }
    }

    async fn tick(&self) -> Result<(), ModelError> {
        // Chargers first connect with their own ideas about charging
        // profiles; installing ours takes priority over balancing.
        let to_initialize = self.store.chargers_not_init(&self.group_id);
        if !to_initialize.is_empty() {
            info!(
                group_id = self.group_id.as_str(),
                chargers = ?to_initialize.iter().map(|(id, _)| id).collect::<Vec<_>>(),
                "initializing charger profiles"
            );
            for (charger_id, connector_ids) in to_initialize {
                self.initialize_charger(&charger_id, &connector_ids).await;
            }
            // Give the chargers time to settle; balance next tick.
            return Ok(());
        }

        // Ask recently (re)connected chargers for their current state.
        for (charger_id, connector_ids) in self.store.chargers_to_request_status(&self.group_id) {
            if !self.registry.is_connected(&charger_id) {
                continue;
            }
            if let Err(e) = self.profiles.trigger_boot_notification(&charger_id).await {
                debug!(charger_id = charger_id.as_str(), error = %e, "boot trigger failed");
            }
            for connector_id in connector_ids {
                if let Err(e) = self
                    .profiles
                    .trigger_status_notification(&charger_id, connector_id)
                    .await
                {
                    debug!(charger_id = charger_id.as_str(), connector_id, error = %e, "status trigger failed");
                }
            }
            if let Err(e) = self.profiles.trigger_meter_values(&charger_id).await {
                debug!(charger_id = charger_id.as_str(), error = %e, "meter trigger failed");
            }
            self.store.set_requested_status(&charger_id);
        }

        // Re-arm blocking profiles on connectors that ended up out of
        // transaction. Soft on errors: the profile may be there anyway.
        for (charger_id, connector_id) in self.store.connectors_reset_blocking(&self.group_id) {
            if !self.registry.is_connected(&charger_id) {
                continue;
            }
            match self
                .profiles
                .set_blocking_default_profile(&charger_id, connector_id)
                .await
            {
                Ok(()) => debug!(charger_id = charger_id.as_str(), connector_id, "blocking profile re-armed"),
                Err(e) => warn!(charger_id = charger_id.as_str(), connector_id, error = %e, "failed to re-arm blocking profile"),
            }
            // Flag regardless of the result, on purpose.
            self.store.set_blocking_profile_reset(&charger_id, connector_id, true);
        }

        // Transactions that started by lifting the blocking profile now
        // need a TxProfile at the minimum, then the blocking default back
        // in place for the next session.
        for (charger_id, connector_id, transaction_id) in
            self.store.transactions_reset_blocking(&self.group_id)
        {
            if !self.registry.is_connected(&charger_id) {
                continue;
            }
            match self
                .profiles
                .set_tx_profile(
                    &charger_id,
                    connector_id,
                    transaction_id,
                    self.cfg.balanz.min_allocation,
                )
                .await
            {
                Ok(()) => {
                    self.store.charge_change_implemented(
                        &ChargeChange {
                            charger_id: charger_id.clone(),
                            connector_id,
                            transaction_id: Some(transaction_id),
                            allocation: self.cfg.balanz.min_allocation,
                        },
                        Utc::now(),
                    );
                    match self
                        .profiles
                        .set_blocking_default_profile(&charger_id, connector_id)
                        .await
                    {
                        Ok(()) => debug!(
                            charger_id = charger_id.as_str(),
                            connector_id, transaction_id, "post-start profiles installed"
                        ),
                        Err(e) => warn!(
                            charger_id = charger_id.as_str(),
                            connector_id, error = %e, "failed to reinstate blocking profile"
                        ),
                    }
                }
                Err(e) => warn!(
                    charger_id = charger_id.as_str(),
                    connector_id, transaction_id, error = %e, "initial TxProfile setup failed"
                ),
            }
            self.store.set_blocking_profile_reset(&charger_id, connector_id, true);
        }

        // The actual rebalancing.
        let (reduce, grow) = self.store.with_model_mut(|model| {
            planner::plan(model, &self.group_id, &self.cfg.balanz, Utc::now())
        })?;
        self.apply(reduce, grow).await;
        Ok(())
    }

    async fn initialize_charger(&self, charger_id: &str, connector_ids: &[u32]) {
        if !self.registry.is_connected(charger_id) {
            warn!(charger_id, "cannot initialize, no live session");
            return;
        }
        if let Err(e) = self.profiles.clear_all_default_profiles(charger_id).await {
            warn!(charger_id, error = %e, "failed to clear default profiles");
        }
        for &connector_id in connector_ids {
            if let Err(e) = self
                .profiles
                .set_blocking_default_profile(charger_id, connector_id)
                .await
            {
                warn!(charger_id, connector_id, error = %e, "failed to set blocking default profile");
            }
        }
        if let Err(e) = self.profiles.set_base_default_profile(charger_id).await {
            warn!(charger_id, error = %e, "failed to set base default profile");
        }
        info!(charger_id, "default profiles installed");
        self.store.set_profile_initialized(charger_id);
    }

    /// Apply planned changes in order: all reduces, a settle delay, then
    /// all grows. A failed reduce or TxProfile write aborts the remainder
    /// so a grow never runs on capacity that was not actually freed.
    pub(crate) async fn apply(&self, reduce: Vec<ChargeChange>, grow: Vec<ChargeChange>) {
        let mut sequence: Vec<Step> = Vec::new();
        let settle = !reduce.is_empty() && !grow.is_empty();
        sequence.extend(reduce.into_iter().map(Step::Change));
        if settle {
            sequence.push(Step::Settle);
        }
        sequence.extend(grow.into_iter().map(Step::Change));

        for step in sequence {
            let change = match step {
                Step::Settle => {
                    tokio::time::sleep(Duration::from_secs(self.cfg.balanz.wait_after_reduce)).await;
                    continue;
                }
                Step::Change(change) => change,
            };

            if !self.registry.is_connected(&change.charger_id) {
                warn!(
                    charger_id = change.charger_id.as_str(),
                    "skipping charge change, charger not connected"
                );
                continue;
            }

            let applied = match change.transaction_id {
                // Starting case: no transaction yet, so the change is
                // carried by the blocking default profile.
                None => {
                    if change.allocation == 0.0 {
                        match self
                            .profiles
                            .set_blocking_default_profile(&change.charger_id, change.connector_id)
                            .await
                        {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(
                                    charger_id = change.charger_id.as_str(),
                                    connector_id = change.connector_id,
                                    error = %e,
                                    "failed to set blocking profile, aborting remaining changes"
                                );
                                break;
                            }
                        }
                    } else {
                        match self
                            .profiles
                            .clear_blocking_default_profile(&change.charger_id, change.connector_id)
                            .await
                        {
                            Ok(()) => {
                                self.store.set_blocking_profile_reset(
                                    &change.charger_id,
                                    change.connector_id,
                                    false,
                                );
                                true
                            }
                            Err(e) => {
                                warn!(
                                    charger_id = change.charger_id.as_str(),
                                    connector_id = change.connector_id,
                                    error = %e,
                                    "failed to clear blocking profile, continuing with other changes"
                                );
                                false
                            }
                        }
                    }
                }
                Some(transaction_id) => {
                    match self
                        .profiles
                        .set_tx_profile(
                            &change.charger_id,
                            change.connector_id,
                            transaction_id,
                            change.allocation,
                        )
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                charger_id = change.charger_id.as_str(),
                                connector_id = change.connector_id,
                                transaction_id,
                                error = %e,
                                "charge change failed, aborting remaining changes"
                            );
                            break;
                        }
                    }
                }
            };

            if applied {
                info!(
                    charger_id = change.charger_id.as_str(),
                    connector_id = change.connector_id,
                    allocation = change.allocation,
                    "balanz change implemented"
                );
                self.store.charge_change_implemented(&change, Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Tag, TagStatus};
    use crate::ocpp::CallSender;
    use crate::support::frame::Frame;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct Harness {
        control: BalanzLoop,
        store: Arc<Store>,
        /// `(charger_id, action, virtual time)` per call hitting the wire.
        wire: Arc<Mutex<Vec<(String, String, Instant)>>>,
    }

    /// Wire chargers up with a responder that acknowledges every call and
    /// records its arrival order and (virtual) time.
    fn harness(chargers: &[&str], reply_status: &'static str) -> Harness {
        let cfg = Arc::new(AppConfig::default());
        let store = Arc::new(Store::new(cfg.clone()));
        store.add_group("SITE", None, Some("00:00-23:59>0=24:3=40:5=48")).unwrap();
        store.upsert_tag(Tag::new("CARD", None, None, None, TagStatus::Activated, None));

        let registry = Arc::new(SessionRegistry::new());
        let calls = Arc::new(CallSender::new(registry.clone(), std::time::Duration::from_secs(30)));
        let profiles = Arc::new(ProfileDriver::new(calls.clone(), cfg.balanz.min_allocation));
        let wire = Arc::new(Mutex::new(Vec::new()));

        for &charger_id in chargers {
            store
                .add_charger(charger_id, "SITE", charger_id, 1, 1, None, Some(32.0), None)
                .unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            registry.register(charger_id, tx);

            let calls = calls.clone();
            let wire = wire.clone();
            let id = charger_id.to_string();
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    if let Ok(Frame::Call { unique_id, action, .. }) = Frame::parse(&text) {
                        wire.lock().push((id.clone(), action, Instant::now()));
                        calls.handle_result(
                            &id,
                            &unique_id,
                            serde_json::json!({"status": reply_status}),
                        );
                    }
                }
            });
        }

        Harness {
            control: BalanzLoop::new(cfg, store.clone(), profiles, registry, "SITE".into()),
            store,
            wire,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reduce_settles_before_grow() {
        let h = harness(&["X", "Y"], "Accepted");
        h.store.start_transaction("X", 1, "CARD", 0, Utc::now()).unwrap();

        let reduce = vec![ChargeChange {
            charger_id: "X".into(),
            connector_id: 1,
            transaction_id: Some(1),
            allocation: 6.0,
        }];
        let grow = vec![ChargeChange {
            charger_id: "Y".into(),
            connector_id: 1,
            transaction_id: None,
            allocation: 6.0,
        }];
        h.control.apply(reduce, grow).await;

        let wire = h.wire.lock();
        assert_eq!(wire.len(), 2, "wire traffic: {wire:?}");
        let (ref first_id, ref first_action, first_at) = wire[0];
        let (ref second_id, ref second_action, second_at) = wire[1];
        assert_eq!((first_id.as_str(), first_action.as_str()), ("X", "SetChargingProfile"));
        assert_eq!((second_id.as_str(), second_action.as_str()), ("Y", "ClearChargingProfile"));
        // The settle delay separates freeing capacity from using it.
        assert!(
            second_at - first_at >= std::time::Duration::from_secs(5),
            "grow applied {:?} after reduce",
            second_at - first_at
        );

        drop(wire);
        h.store.with_model(|m| {
            assert_eq!(m.chargers["X"].connectors[&1].offered, Some(6.0));
            assert_eq!(m.chargers["Y"].connectors[&1].offered, Some(6.0));
            assert!(!m.chargers["Y"].connectors[&1].balanz.blocking_profile_reset);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reduce_aborts_the_remaining_changes() {
        let h = harness(&["X", "Y"], "Rejected");
        h.store.start_transaction("X", 1, "CARD", 0, Utc::now()).unwrap();

        let reduce = vec![ChargeChange {
            charger_id: "X".into(),
            connector_id: 1,
            transaction_id: Some(1),
            allocation: 6.0,
        }];
        let grow = vec![ChargeChange {
            charger_id: "Y".into(),
            connector_id: 1,
            transaction_id: None,
            allocation: 6.0,
        }];
        h.control.apply(reduce, grow).await;

        let wire = h.wire.lock();
        assert_eq!(wire.len(), 1, "the grow must never hit the wire: {wire:?}");
        assert_eq!(wire[0].0, "X");

        drop(wire);
        // Nothing was committed.
        h.store.with_model(|m| {
            assert_ne!(m.chargers["X"].connectors[&1].offered, Some(6.0));
            assert_eq!(m.chargers["Y"].connectors[&1].offered, None);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_charger_is_skipped() {
        let h = harness(&["X"], "Accepted");
        let grow = vec![ChargeChange {
            charger_id: "GONE".into(),
            connector_id: 1,
            transaction_id: None,
            allocation: 6.0,
        }];
        h.control.apply(Vec::new(), grow).await;
        assert!(h.wire.lock().is_empty());
    }
}
