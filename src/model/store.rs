//! The authoritative entity store.
//!
//! One process-wide [`Store`] owns every group, charger, tag, live
//! transaction and completed session. All mutation goes through its methods;
//! the lock is never held across I/O, so readers on any task see consistent
//! snapshots between suspension points.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::charger::{BootInfo, Charger};
use super::connector::{Connector, ConnectorStatus};
use super::group::Group;
use super::schedule::AllocationSchedule;
use super::session::{SessionLog, SessionRecord};
use super::tag::{Tag, TagStatus};
use super::transaction::{ChargeChange, ChargingHistory, Transaction};
use crate::config::AppConfig;
use crate::support::errors::ModelError;
use crate::support::timeutil::time_str;

/// Outcome of an Authorize check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { parent_id_tag: Option<String> },
    Blocked,
    Invalid,
    ConcurrentTx,
}

/// All entity tables. Only reachable through [`Store`].
#[derive(Default)]
pub struct Model {
    pub groups: HashMap<String, Group>,
    pub chargers: HashMap<String, Charger>,
    pub tags: HashMap<String, Tag>,
    pub sessions: BTreeMap<String, SessionRecord>,
}

pub struct Store {
    cfg: Arc<AppConfig>,
    model: RwLock<Model>,
    session_log: Mutex<Option<SessionLog>>,
}

impl Store {
    pub fn new(cfg: Arc<AppConfig>) -> Self {
        Self {
            cfg,
            model: RwLock::new(Model::default()),
            session_log: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    /// Run a closure against a read snapshot of the model.
    pub fn with_model<R>(&self, f: impl FnOnce(&Model) -> R) -> R {
        f(&self.model.read())
    }

    /// Run a closure with mutable access to the model. The closure must not
    /// perform I/O.
    pub fn with_model_mut<R>(&self, f: impl FnOnce(&mut Model) -> R) -> R {
        f(&mut self.model.write())
    }

    /// Start appending completed sessions to the given CSV file.
    pub fn register_session_log(&self, path: &Path) -> Result<(), ModelError> {
        let log = SessionLog::open(path)?;
        *self.session_log.lock() = Some(log);
        info!(path = %path.display(), "appending completed sessions");
        Ok(())
    }

    // ── Group / charger / tag lifecycle ────────────────────────

    pub fn add_group(
        &self,
        group_id: &str,
        description: Option<String>,
        max_allocation: Option<&str>,
    ) -> Result<(), ModelError> {
        let schedule = max_allocation
            .filter(|s| !s.is_empty())
            .map(AllocationSchedule::parse)
            .transpose()?;
        let mut model = self.model.write();
        if model.groups.contains_key(group_id) {
            return Err(ModelError::Conflict(format!("group {group_id}")));
        }
        model
            .groups
            .insert(group_id.to_string(), Group::new(group_id, description, schedule));
        debug!(group_id, "created group");
        Ok(())
    }

    pub fn update_group(
        &self,
        group_id: &str,
        description: Option<String>,
        max_allocation: Option<&str>,
    ) -> Result<(), ModelError> {
        let schedule = max_allocation
            .filter(|s| !s.is_empty())
            .map(AllocationSchedule::parse)
            .transpose()?;
        let mut model = self.model.write();
        let group = model
            .groups
            .get_mut(group_id)
            .ok_or_else(|| ModelError::NoSuchGroup(group_id.to_string()))?;
        if description.is_some() {
            group.description = description;
        }
        if schedule.is_some() {
            group.max_allocation = schedule;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_charger(
        &self,
        charger_id: &str,
        group_id: &str,
        alias: &str,
        no_connectors: u32,
        priority: i32,
        description: Option<String>,
        conn_max: Option<f64>,
        auth_sha: Option<String>,
    ) -> Result<(), ModelError> {
        let mut model = self.model.write();
        if !model.groups.contains_key(group_id) {
            return Err(ModelError::NoSuchGroup(group_id.to_string()));
        }
        if model.chargers.contains_key(charger_id) {
            return Err(ModelError::Conflict(format!("charger {charger_id}")));
        }
        let conn_max = conn_max.unwrap_or(self.cfg.model.default_conn_max);
        model.chargers.insert(
            charger_id.to_string(),
            Charger::new(
                charger_id,
                group_id,
                alias,
                no_connectors,
                priority,
                description,
                conn_max,
                auth_sha,
            ),
        );
        debug!(charger_id, alias, group_id, "created charger");
        Ok(())
    }

    pub fn update_charger(
        &self,
        charger_id: &str,
        alias: Option<String>,
        priority: Option<i32>,
        description: Option<String>,
        conn_max: Option<f64>,
    ) -> Result<(), ModelError> {
        let mut model = self.model.write();
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))?;
        if let Some(alias) = alias {
            charger.alias = alias;
        }
        if let Some(priority) = priority {
            charger.priority = priority;
        }
        if description.is_some() {
            charger.description = description;
        }
        if let Some(conn_max) = conn_max {
            charger.conn_max = conn_max;
        }
        Ok(())
    }

    pub fn remove_charger(&self, charger_id: &str) -> Result<(), ModelError> {
        let mut model = self.model.write();
        model
            .chargers
            .remove(charger_id)
            .map(|_| ())
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))
    }

    pub fn create_tag(&self, tag: Tag) -> Result<(), ModelError> {
        let mut model = self.model.write();
        if model.tags.contains_key(&tag.id_tag) {
            return Err(ModelError::Conflict(format!("tag {}", tag.id_tag)));
        }
        model.tags.insert(tag.id_tag.clone(), tag);
        Ok(())
    }

    pub fn upsert_tag(&self, tag: Tag) {
        self.model.write().tags.insert(tag.id_tag.clone(), tag);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_tag(
        &self,
        id_tag: &str,
        user_name: Option<String>,
        parent_id_tag: Option<String>,
        description: Option<String>,
        status: Option<TagStatus>,
        priority: Option<i32>,
    ) -> Result<(), ModelError> {
        let key = id_tag.to_uppercase();
        let mut model = self.model.write();
        let tag = model
            .tags
            .get_mut(&key)
            .ok_or_else(|| ModelError::NoSuchTag(key.clone()))?;
        if user_name.is_some() {
            tag.user_name = user_name;
        }
        if parent_id_tag.is_some() {
            tag.parent_id_tag = parent_id_tag;
        }
        if description.is_some() {
            tag.description = description;
        }
        if let Some(status) = status {
            tag.status = status;
        }
        if priority.is_some() {
            tag.priority = priority;
        }
        Ok(())
    }

    pub fn delete_tag(&self, id_tag: &str) -> Result<(), ModelError> {
        let key = id_tag.to_uppercase();
        self.model
            .write()
            .tags
            .remove(&key)
            .map(|_| ())
            .ok_or(ModelError::NoSuchTag(key))
    }

    pub fn clear_tags(&self) {
        self.model.write().tags.clear();
    }

    // ── Connection lifecycle ───────────────────────────────────

    pub fn has_charger(&self, charger_id: &str) -> bool {
        self.model.read().chargers.contains_key(charger_id)
    }

    pub fn auth_sha(&self, charger_id: &str) -> Option<String> {
        self.model
            .read()
            .chargers
            .get(charger_id)
            .and_then(|c| c.auth_sha.clone())
    }

    pub fn set_auth_sha(&self, charger_id: &str, sha: String) -> Result<(), ModelError> {
        let mut model = self.model.write();
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))?;
        charger.auth_sha = Some(sha);
        Ok(())
    }

    /// A live OCPP session attached. Re-arms the post-connect triggers.
    pub fn mark_connected(&self, charger_id: &str, now: DateTime<Utc>) {
        if let Some(charger) = self.model.write().chargers.get_mut(charger_id) {
            charger.connected = true;
            charger.requested_status = false;
            charger.last_update = Some(now);
        }
    }

    /// The OCPP session went away. `last_update` is preserved on purpose so
    /// the stale-transaction watchdog can still time out its transactions.
    pub fn mark_disconnected(&self, charger_id: &str) {
        if let Some(charger) = self.model.write().chargers.get_mut(charger_id) {
            charger.connected = false;
            charger.requested_status = false;
            charger.profile_initialized = false;
        }
    }

    pub fn touch(&self, charger_id: &str, now: DateTime<Utc>) {
        if let Some(charger) = self.model.write().chargers.get_mut(charger_id) {
            charger.last_update = Some(now);
        }
    }

    pub fn set_profile_initialized(&self, charger_id: &str) {
        if let Some(charger) = self.model.write().chargers.get_mut(charger_id) {
            charger.profile_initialized = true;
        }
    }

    pub fn set_requested_status(&self, charger_id: &str) {
        if let Some(charger) = self.model.write().chargers.get_mut(charger_id) {
            charger.requested_status = true;
        }
    }

    pub fn set_blocking_profile_reset(&self, charger_id: &str, connector_id: u32, value: bool) {
        let mut model = self.model.write();
        if let Some(conn) = model
            .chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
        {
            conn.balanz.blocking_profile_reset = value;
        }
    }

    // ── OCPP inbound operations ────────────────────────────────

    pub fn boot_notification(&self, charger_id: &str, info: BootInfo) -> Result<(), ModelError> {
        let mut model = self.model.write();
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))?;
        charger.boot_info = info;
        info!(charger_id, "boot notification");
        Ok(())
    }

    /// Authorize a tag presented at a charger. Tag comparison is
    /// case-insensitive; the concurrent check looks for the same tag active
    /// on a *different* charger.
    pub fn authorize(&self, charger_id: &str, id_tag: &str) -> AuthOutcome {
        let key = id_tag.to_uppercase();
        let model = self.model.read();
        let Some(tag) = model.tags.get(&key) else {
            warn!(charger_id, id_tag = key.as_str(), "authorize: unknown tag");
            return AuthOutcome::Invalid;
        };
        if tag.status != TagStatus::Activated {
            warn!(charger_id, id_tag = key.as_str(), "authorize: tag blocked");
            return AuthOutcome::Blocked;
        }
        if !self.cfg.csms.allow_concurrent_tag {
            let in_use_elsewhere = model
                .chargers
                .values()
                .filter(|c| c.charger_id != charger_id)
                .flat_map(|c| c.connectors.values())
                .filter_map(|conn| conn.transaction.as_ref())
                .any(|t| t.id_tag.to_uppercase() == key);
            if in_use_elsewhere {
                info!(charger_id, id_tag = key.as_str(), "authorize: concurrent use");
                return AuthOutcome::ConcurrentTx;
            }
        }
        debug!(charger_id, id_tag = key.as_str(), "authorize: accepted");
        AuthOutcome::Accepted {
            parent_id_tag: tag.parent_id_tag.clone(),
        }
    }

    /// Start a transaction on a connector. Returns the transaction id, which
    /// equals the connector id.
    pub fn start_transaction(
        &self,
        charger_id: &str,
        connector_id: u32,
        id_tag: &str,
        meter_start: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<i32, ModelError> {
        let mut model = self.model.write();

        // Replay / missing-stop handling against any existing transaction.
        let existing = model
            .chargers
            .get(charger_id)
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))?
            .connectors
            .get(&connector_id)
            .ok_or(ModelError::NoSuchConnector {
                charger_id: charger_id.to_string(),
                connector_id,
            })?
            .transaction
            .as_ref()
            .map(|t| (t.transaction_id, t.start_time, t.energy_meter));
        if let Some((old_id, old_start, old_energy)) = existing {
            warn!(
                charger_id,
                connector_id, old_id, "start_transaction: connector already in transaction"
            );
            if old_start == timestamp {
                warn!(charger_id, connector_id, "start_transaction: replay of the same start");
                return Ok(old_id);
            }
            warn!(charger_id, connector_id, "start_transaction: stopping old transaction first");
            self.stop_locked(
                &mut model,
                charger_id,
                old_id,
                old_energy,
                timestamp,
                Some("Start transaction without stop transaction".to_string()),
                None,
            )?;
        }

        let Model { chargers, tags, .. } = &mut *model;
        let tag = tags.get(&id_tag.to_uppercase());
        let user_name = tag
            .and_then(|t| t.user_name.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let priority = tag.and_then(|t| t.priority);

        let conn = chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
            .ok_or(ModelError::NoSuchConnector {
                charger_id: charger_id.to_string(),
                connector_id,
            })?;
        let transaction_id = connector_id as i32;
        conn.transaction = Some(Transaction::new(
            transaction_id,
            charger_id,
            connector_id,
            id_tag,
            user_name,
            timestamp,
            meter_start,
            priority,
        ));
        conn.balanz.reset();
        conn.balanz.last_offer_time = Some(timestamp);
        conn.balanz.blocking_profile_reset = false;
        conn.balanz.to_review = true;

        info!(
            charger_id,
            connector_id,
            transaction_id,
            id_tag,
            meter_start,
            start = %time_str(timestamp),
            "transaction started"
        );
        Ok(transaction_id)
    }

    /// Stop a transaction, producing (and persisting) a completed session.
    pub fn stop_transaction(
        &self,
        charger_id: &str,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
        stop_id_tag: Option<String>,
    ) -> Result<String, ModelError> {
        let mut model = self.model.write();
        self.stop_locked(
            &mut model,
            charger_id,
            transaction_id,
            meter_stop,
            timestamp,
            reason,
            stop_id_tag,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn stop_locked(
        &self,
        model: &mut Model,
        charger_id: &str,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
        stop_id_tag: Option<String>,
    ) -> Result<String, ModelError> {
        let charger = model
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))?;
        let (alias, group_id) = (charger.alias.clone(), charger.group_id.clone());

        let connector_id = charger
            .connectors
            .values()
            .find(|c| {
                c.transaction
                    .as_ref()
                    .map(|t| t.transaction_id == transaction_id)
                    .unwrap_or(false)
            })
            .map(|c| c.connector_id)
            .ok_or(ModelError::NoSuchTransaction {
                charger_id: charger_id.to_string(),
                transaction_id,
            })?;

        let conn = charger
            .connectors
            .get_mut(&connector_id)
            .ok_or(ModelError::NoSuchConnector {
                charger_id: charger_id.to_string(),
                connector_id,
            })?;
        let Some(mut trans) = conn.transaction.take() else {
            return Err(ModelError::ConnectorNotInTransaction {
                charger_id: charger_id.to_string(),
                connector_id,
            });
        };
        trans.charging_history.push(ChargingHistory {
            timestamp,
            offered: 0.0,
        });
        conn.balanz.reset();

        let record = SessionRecord::from_transaction(
            &trans,
            &alias,
            &group_id,
            meter_stop,
            timestamp,
            reason.clone(),
            stop_id_tag.clone(),
        );
        let session_id = record.session_id.clone();
        if let Some(log) = self.session_log.lock().as_mut() {
            if let Err(e) = log.append(&record) {
                warn!(session_id = session_id.as_str(), error = %e, "failed to append session row");
            }
        }
        model.sessions.insert(session_id.clone(), record);

        info!(
            charger_id,
            connector_id,
            transaction_id,
            session_id = session_id.as_str(),
            reason = reason.as_deref().unwrap_or(""),
            "transaction stopped"
        );
        Ok(session_id)
    }

    /// Apply a StatusNotification. Connector 0 (the charger itself) is
    /// ignored.
    pub fn status_notification(
        &self,
        charger_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        if connector_id == 0 {
            debug!(charger_id, ?status, "ignoring status for connector 0");
            return Ok(());
        }
        let window = self.cfg.balanz.usage_monitoring_interval;
        let mut model = self.model.write();
        let conn = model
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))?
            .connectors
            .get_mut(&connector_id)
            .ok_or(ModelError::NoSuchConnector {
                charger_id: charger_id.to_string(),
                connector_id,
            })?;

        if conn.status != Some(status) {
            info!(
                charger_id,
                connector_id,
                old = ?conn.status,
                new = ?status,
                "connector status change"
            );
            conn.status = Some(status);

            // A tag was accepted but no transaction exists yet; flag for a
            // quick engine look.
            if conn.transaction.is_none() && status == ConnectorStatus::SuspendedEVSE {
                conn.balanz.to_review = true;
            }

            // SuspendedEV means zero draw, even if the charger stops sending
            // MeterValues in this state.
            if status == ConnectorStatus::SuspendedEV {
                conn.update_recent_usage(0.0, now, window);
                if let Some(trans) = conn.transaction.as_mut() {
                    trans.usage_meter = Some(0.0);
                }
            }
        }

        // Out of transaction: the profile logic guarantees nothing is
        // offered any more.
        if !status.in_transaction() {
            conn.offered = Some(0.0);
            conn.balanz.reset();
        }
        Ok(())
    }

    /// Apply a MeterValues sample. A transaction id without a known
    /// transaction synthesizes one (restart case), including a status guess.
    #[allow(clippy::too_many_arguments)]
    pub fn meter_values(
        &self,
        charger_id: &str,
        connector_id: u32,
        usage_meter: f64,
        energy_meter: Option<i64>,
        offered: Option<f64>,
        transaction_id: Option<i32>,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        let window = self.cfg.balanz.usage_monitoring_interval;
        let mut model = self.model.write();
        let Some(conn) = model
            .chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
        else {
            warn!(charger_id, connector_id, "meter_values: connector not found");
            return Ok(());
        };

        if let Some(transaction_id) = transaction_id {
            if conn.transaction.is_none() {
                warn!(
                    charger_id,
                    connector_id, transaction_id, "meter_values without transaction, synthesizing"
                );
                conn.transaction = Some(Transaction::new(
                    transaction_id,
                    charger_id,
                    connector_id,
                    "Unknown",
                    "Unknown".to_string(),
                    now,
                    0,
                    None,
                ));
                conn.balanz.reset();
                conn.balanz.last_offer_time = Some(now);
                conn.balanz.blocking_profile_reset = false;

                if !conn.status_in_transaction() {
                    let open = offered.map(|o| o > 0.0).unwrap_or(true);
                    conn.status = Some(if usage_meter > 0.0 && open {
                        ConnectorStatus::Charging
                    } else if usage_meter == 0.0 && open {
                        ConnectorStatus::SuspendedEV
                    } else {
                        ConnectorStatus::SuspendedEVSE
                    });
                }
            }
            if let Some(trans) = conn.transaction.as_mut() {
                trans.usage_meter = Some(usage_meter);
                if let Some(energy) = energy_meter {
                    trans.energy_meter = energy;
                }
                trans.last_usage_time = timestamp;
            }
        }

        debug!(
            charger_id,
            connector_id,
            usage_meter,
            energy_meter = ?energy_meter,
            offered = ?offered,
            "meter values"
        );

        // The charger's view of the offer wins; realign if it disagrees.
        if let Some(offered) = offered {
            if conn.offered != Some(offered) {
                warn!(
                    charger_id,
                    connector_id,
                    reported = offered,
                    expected = ?conn.offered,
                    "reported offer differs, adjusting"
                );
                conn.offered = Some(offered);
                if conn.balanz.last_offer_time.is_none() {
                    conn.balanz.last_offer_time = Some(now);
                }
            }
        }

        conn.update_recent_usage(usage_meter, timestamp, window);
        Ok(())
    }

    /// Commit a change the loop has successfully applied on the wire.
    pub fn charge_change_implemented(&self, change: &ChargeChange, now: DateTime<Utc>) {
        let mut model = self.model.write();
        let Some(conn) = model
            .chargers
            .get_mut(&change.charger_id)
            .and_then(|c| c.connectors.get_mut(&change.connector_id))
        else {
            warn!(charger_id = change.charger_id.as_str(), "charge change for unknown connector");
            return;
        };
        conn.offered = Some(change.allocation);
        if change.allocation >= self.cfg.balanz.min_allocation {
            conn.balanz.last_offer_time = Some(now);
            conn.balanz.recent_usages.clear();
            conn.balanz.suspend_until = None;
        }
        if let Some(trans) = conn.transaction.as_mut() {
            trans.charging_history.push(ChargingHistory {
                timestamp: now,
                offered: change.allocation,
            });
        }
        debug!(
            charger_id = change.charger_id.as_str(),
            connector_id = change.connector_id,
            allocation = change.allocation,
            "charge change implemented"
        );
    }

    // ── Engine / API state toggles ─────────────────────────────

    pub fn set_balanz_suspend(&self, group_id: &str, suspend: bool) -> Result<(), ModelError> {
        let mut model = self.model.write();
        let group = model
            .groups
            .get_mut(group_id)
            .ok_or_else(|| ModelError::NoSuchGroup(group_id.to_string()))?;
        if !group.is_allocation_group() {
            return Err(ModelError::NotAllocationGroup(group_id.to_string()));
        }
        group.suspended = suspend;
        info!(group_id, suspend, "balanz suspend state changed");
        Ok(())
    }

    pub fn set_charge_priority(
        &self,
        charger_id: &str,
        connector_id: u32,
        priority: i32,
    ) -> Result<(), ModelError> {
        let mut model = self.model.write();
        let conn = model
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| ModelError::NoSuchCharger(charger_id.to_string()))?
            .connectors
            .get_mut(&connector_id)
            .ok_or(ModelError::NoSuchConnector {
                charger_id: charger_id.to_string(),
                connector_id,
            })?;
        let trans = conn
            .transaction
            .as_mut()
            .ok_or(ModelError::ConnectorNotInTransaction {
                charger_id: charger_id.to_string(),
                connector_id,
            })?;
        trans.priority = Some(priority);
        info!(charger_id, connector_id, priority, "transaction priority set");
        Ok(())
    }

    // ── Queries for the engine loop and watchdogs ──────────────

    pub fn allocation_group_ids(&self) -> Vec<String> {
        let model = self.model.read();
        let mut ids: Vec<_> = model
            .groups
            .values()
            .filter(|g| g.is_allocation_group())
            .map(|g| g.group_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn group_suspended(&self, group_id: &str) -> bool {
        self.model
            .read()
            .groups
            .get(group_id)
            .map(|g| g.suspended)
            .unwrap_or(false)
    }

    /// Connected chargers whose default profiles still need installing.
    pub fn chargers_not_init(&self, group_id: &str) -> Vec<(String, Vec<u32>)> {
        let model = self.model.read();
        model
            .chargers
            .values()
            .filter(|c| c.group_id == group_id && c.connected && !c.profile_initialized)
            .map(|c| (c.charger_id.clone(), c.connectors.keys().copied().collect()))
            .collect()
    }

    /// Connected chargers that have not yet been asked for post-connect state.
    pub fn chargers_to_request_status(&self, group_id: &str) -> Vec<(String, Vec<u32>)> {
        let model = self.model.read();
        model
            .chargers
            .values()
            .filter(|c| c.group_id == group_id && c.connected && !c.requested_status)
            .map(|c| (c.charger_id.clone(), c.connectors.keys().copied().collect()))
            .collect()
    }

    /// Connectors out of transaction whose blocking profile needs re-arming.
    pub fn connectors_reset_blocking(&self, group_id: &str) -> Vec<(String, u32)> {
        let model = self.model.read();
        model
            .chargers
            .values()
            .filter(|c| c.group_id == group_id)
            .flat_map(|c| c.connectors.values())
            .filter(|conn| {
                conn.transaction.is_none()
                    && !conn.status_in_transaction()
                    && !conn.balanz.blocking_profile_reset
            })
            .map(|conn| (conn.charger_id.clone(), conn.connector_id))
            .collect()
    }

    /// Live transactions whose post-start profile installation is pending.
    pub fn transactions_reset_blocking(&self, group_id: &str) -> Vec<(String, u32, i32)> {
        let model = self.model.read();
        model
            .chargers
            .values()
            .filter(|c| c.group_id == group_id)
            .flat_map(|c| c.connectors.values())
            .filter(|conn| conn.transaction.is_some() && !conn.balanz.blocking_profile_reset)
            .filter_map(|conn| {
                conn.transaction
                    .as_ref()
                    .map(|t| (conn.charger_id.clone(), conn.connector_id, t.transaction_id))
            })
            .collect()
    }

    /// Whether anything in the group needs an engine look before the next
    /// full pass.
    pub fn group_needs_attention(&self, group_id: &str) -> bool {
        let model = self.model.read();
        model
            .chargers
            .values()
            .filter(|c| c.group_id == group_id)
            .any(|c| {
                (c.connected && !c.profile_initialized)
                    || c.connectors.values().any(|conn| {
                        conn.balanz.to_review || !conn.balanz.blocking_profile_reset
                    })
            })
    }

    /// Chargers silent for longer than `timeout` with live transactions, as
    /// `(charger_id, connector_id, transaction_id, energy_meter)`.
    pub fn stale_transactions(
        &self,
        now: DateTime<Utc>,
        timeout: i64,
    ) -> Vec<(String, u32, i32, i64)> {
        let model = self.model.read();
        model
            .chargers
            .values()
            .filter(|c| {
                c.last_update
                    .map(|t| (now - t).num_seconds() > timeout)
                    .unwrap_or(true)
            })
            .flat_map(|c| c.connectors.values())
            .filter_map(|conn| {
                conn.transaction.as_ref().map(|t| {
                    (
                        conn.charger_id.clone(),
                        conn.connector_id,
                        t.transaction_id,
                        t.energy_meter,
                    )
                })
            })
            .collect()
    }

    /// Force a connector's status without the usual side effects; used after
    /// the watchdog pseudo-stops a transaction.
    pub fn force_connector_status(&self, charger_id: &str, connector_id: u32, status: ConnectorStatus) {
        let mut model = self.model.write();
        if let Some(conn) = model
            .chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
        {
            conn.status = Some(status);
        }
    }

    /// Resolve a charger id from its alias, when unambiguous.
    pub fn charger_id_for_alias(&self, alias: &str) -> Option<String> {
        let model = self.model.read();
        let mut matches = model
            .chargers
            .values()
            .filter(|c| c.alias == alias)
            .map(|c| c.charger_id.clone());
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(id),
            _ => None,
        }
    }
}

// Direct access for the engine: the planner runs under one lock acquisition
// and performs no I/O.
impl Model {
    pub fn group(&self, group_id: &str) -> Result<&Group, ModelError> {
        self.groups
            .get(group_id)
            .ok_or_else(|| ModelError::NoSuchGroup(group_id.to_string()))
    }

    pub fn connector_mut(&mut self, charger_id: &str, connector_id: u32) -> Option<&mut Connector> {
        self.chargers
            .get_mut(charger_id)
            .and_then(|c| c.connectors.get_mut(&connector_id))
    }
}
