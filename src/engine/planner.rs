//! The balanz allocation pass.
//!
//! [`plan`] is invoked on one allocation group and computes two ordered
//! change lists: **reduce** (frees capacity) and **grow** (uses it). The
//! caller must apply reduce before grow, and report each applied change via
//! `Store::charge_change_implemented` before the next pass. The pass
//! performs no I/O and is deterministic in `now`, so unchanged inputs yield
//! an empty change pair.
//!
//! Three situations need care beyond plain proportional sharing:
//!
//! *Starting.* A connector in `SuspendedEVSE` has no transaction, so no
//! TxProfile can address it. Such connectors are granted the minimum and
//! the change carries no transaction id; the loop implements it by lifting
//! the blocking default profile.
//!
//! *EV full / delayed start.* A session in `SuspendedEV` that has drawn
//! nothing for `suspended_allocation_timeout` has its offer pulled and a
//! retry time set: shortly before the next top of the hour for an initial
//! delayed charge, one configured delay later otherwise. Until that time a
//! `SuspendedEVSE` connector keeps allocation 0.
//!
//! *Throttling EVs.* A charging session persistently using less than its
//! offer is reduced to the observed ceiling, and that ceiling is sticky
//! downward for the rest of the transaction so the allocator does not
//! ping-pong.

use chrono::{DateTime, Local, Utc};
use tracing::{debug, error, info, warn};

use crate::config::BalanzConfig;
use crate::model::{ChargeChange, ConnectorStatus, Model, PriorityBucket};
use crate::support::errors::ModelError;
use crate::support::timeutil::{next_top_of_hour, time_str};

/// Working copy of one candidate connector.
struct Item {
    charger_id: String,
    connector_id: u32,
    transaction_id: Option<i32>,
    has_transaction: bool,
    usage_meter: Option<f64>,
    energy_meter: i64,
    priority: i32,
    conn_max: f64,
    status: ConnectorStatus,
    offered: f64,
    max_recent: f64,
    ev_max_usage: Option<f64>,
    suspend_until: Option<DateTime<Utc>>,
    last_offer_time: Option<DateTime<Utc>>,
    allocation: f64,
    max_desired: f64,
    done: bool,
}

impl Item {
    fn id_str(&self) -> String {
        format!("{}/{}", self.charger_id, self.connector_id)
    }

    fn seconds_since_offer(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_offer_time.map(|t| (now - t).num_seconds())
    }
}

/// Compute the (reduce, grow) change pair for one allocation group.
pub fn plan(
    model: &mut Model,
    group_id: &str,
    cfg: &BalanzConfig,
    now: DateTime<Utc>,
) -> Result<(Vec<ChargeChange>, Vec<ChargeChange>), ModelError> {
    let group = model.group(group_id)?;
    let schedule = group
        .max_allocation
        .clone()
        .ok_or_else(|| ModelError::NotAllocationGroup(group_id.to_string()))?;
    let buckets: Vec<PriorityBucket> = schedule
        .buckets_at(now.with_timezone(&Local).time())
        .ok_or_else(|| {
            error!(group_id, "no schedule interval covers the current time");
            ModelError::NoScheduleInterval(group_id.to_string())
        })?
        .to_vec();
    // The highest bucket's cap is the absolute group ceiling.
    let ceiling = buckets[0].1;
    debug!(group_id, ?buckets, "planning group");

    let mut items = collect_candidates(model, group_id, cfg, now);

    voluntary_release(&mut items, cfg, now);
    compute_max_desired(&mut items, cfg, now);
    preassign_starters(&mut items, cfg, now, ceiling);
    assign_by_priority(&mut items, cfg, &buckets, ceiling);

    // Persist scratch back onto the connectors.
    for item in &items {
        if let Some(conn) = model.connector_mut(&item.charger_id, item.connector_id) {
            conn.balanz.allocation = item.allocation;
            conn.balanz.max_desired = item.max_desired;
            conn.balanz.done = item.done;
            conn.balanz.ev_max_usage = item.ev_max_usage;
            conn.balanz.suspend_until = item.suspend_until;
        }
    }

    // Build the change lists. Unchanged allocations are dropped silently.
    let mut reduce = Vec::new();
    let mut grow = Vec::new();
    for item in items.into_iter().filter(|i| i.done) {
        let change = ChargeChange {
            charger_id: item.charger_id.clone(),
            connector_id: item.connector_id,
            transaction_id: item.transaction_id,
            allocation: item.allocation,
        };
        if item.allocation > item.offered {
            grow.push(change);
        } else if item.allocation < item.offered {
            reduce.push(change);
        }
    }
    Ok((reduce, grow))
}

/// Gather the connectors in an in-transaction status, normalizing a missing
/// offer to 0 and clearing their review flag.
fn collect_candidates(
    model: &mut Model,
    group_id: &str,
    cfg: &BalanzConfig,
    now: DateTime<Utc>,
) -> Vec<Item> {
    let mut items = Vec::new();
    for charger in model
        .chargers
        .values_mut()
        .filter(|c| c.group_id == group_id)
    {
        let static_priority = charger.priority;
        let conn_max = charger.conn_max;
        for conn in charger.connectors.values_mut() {
            let Some(status) = conn.status else { continue };
            if !status.in_transaction() {
                continue;
            }
            let offered = match conn.offered {
                Some(offered) => offered,
                None => {
                    warn!(conn = %conn.id_str(), "no offered value available, assuming 0");
                    conn.offered = Some(0.0);
                    0.0
                }
            };
            let max_recent = conn.max_recent_usage(now, cfg.usage_monitoring_interval);
            conn.balanz.to_review = false;
            let priority = conn
                .transaction
                .as_ref()
                .and_then(|t| t.priority)
                .unwrap_or(static_priority);
            items.push(Item {
                charger_id: conn.charger_id.clone(),
                connector_id: conn.connector_id,
                transaction_id: conn.transaction.as_ref().map(|t| t.transaction_id),
                has_transaction: conn.transaction.is_some(),
                usage_meter: conn.transaction.as_ref().and_then(|t| t.usage_meter),
                energy_meter: conn.transaction.as_ref().map(|t| t.energy_meter).unwrap_or(0),
                priority,
                conn_max,
                status,
                offered,
                max_recent,
                ev_max_usage: conn.balanz.ev_max_usage,
                suspend_until: conn.balanz.suspend_until,
                last_offer_time: conn.balanz.last_offer_time,
                allocation: 0.0,
                max_desired: 0.0,
                done: false,
            });
        }
    }
    // Deterministic processing order.
    items.sort_by(|a, b| (a.charger_id.as_str(), a.connector_id).cmp(&(b.charger_id.as_str(), b.connector_id)));
    items
}

/// Free capacity a connector no longer uses: EV-full suspension, honoring
/// an active suspension window, and reduce-to-observed.
fn voluntary_release(items: &mut [Item], cfg: &BalanzConfig, now: DateTime<Utc>) {
    for item in items.iter_mut().filter(|i| !i.done) {
        // EV stopped drawing (full, or never started): pull the offer after
        // a grace period and schedule a retry.
        if item.status == ConnectorStatus::SuspendedEV && item.max_recent < cfg.usage_threshold {
            let grace_expired = item
                .seconds_since_offer(now)
                .map(|s| s > cfg.suspended_allocation_timeout)
                .unwrap_or(false);
            if grace_expired {
                item.allocation = 0.0;
                item.done = true;
                item.suspend_until =
                    Some(if item.has_transaction && item.energy_meter >= cfg.energy_threshold {
                        // Mid-session EV-full case.
                        now + chrono::Duration::seconds(cfg.suspended_delayed_time_not_first)
                    } else if cfg.suspend_top_of_hour {
                        // Initial delayed charging: retry around the next
                        // top of the hour.
                        next_top_of_hour(now, cfg.suspended_allocation_timeout)
                    } else {
                        now + chrono::Duration::seconds(cfg.suspended_delayed_time)
                    });
                debug!(
                    conn = %item.id_str(),
                    until = %time_str(item.suspend_until.unwrap_or(now)),
                    "EV suspended, pulling allocation"
                );
            } else {
                debug!(conn = %item.id_str(), "allowing continued allocation for suspended EV");
            }
        }
        // Inside a suspension window: stay at zero.
        else if item.status == ConnectorStatus::SuspendedEVSE
            && item.suspend_until.map(|t| now < t).unwrap_or(false)
        {
            item.allocation = 0.0;
            item.done = true;
            debug!(
                conn = %item.id_str(),
                until = %time_str(item.suspend_until.unwrap_or(now)),
                "staying suspended"
            );
        }
        // Stable under-use of an above-minimum offer: reduce to the
        // observed ceiling, sticky for the rest of the transaction.
        else if item.status == ConnectorStatus::Charging
            && item.has_transaction
            && item.usage_meter.is_some()
            && item
                .seconds_since_offer(now)
                .map(|s| s > cfg.usage_monitoring_interval)
                .unwrap_or(false)
            && item.max_recent >= cfg.min_allocation
            && item.max_recent <= item.offered - cfg.margin_lower
            && item.offered >= cfg.min_allocation
            && !(item.ev_max_usage.is_some()
                && item.usage_meter.map(f64::ceil).unwrap_or(0.0)
                    > item.ev_max_usage.unwrap_or(f64::INFINITY))
        {
            item.allocation = item.max_recent.ceil().max(cfg.min_allocation);
            item.done = true;
            if item.ev_max_usage.map(|m| m > item.allocation).unwrap_or(true) {
                item.ev_max_usage = Some(item.allocation);
                info!(
                    conn = %item.id_str(),
                    from = item.offered,
                    to = item.allocation,
                    "reducing allocation to observed EV usage"
                );
            }
        }
    }
}

/// Determine each remaining connector's desired ceiling.
fn compute_max_desired(items: &mut [Item], cfg: &BalanzConfig, now: DateTime<Utc>) {
    for item in items.iter_mut().filter(|i| !i.done) {
        if item.status == ConnectorStatus::SuspendedEV {
            // If an allocation is kept for a suspended EV, keep it minimal.
            item.max_desired = cfg.min_allocation;
        } else if item.offered == 0.0 || !item.has_transaction {
            item.max_desired = cfg.min_allocation;
        } else {
            let can_increase = item
                .seconds_since_offer(now)
                .map(|s| s >= cfg.min_offer_increase_interval)
                .unwrap_or(true);
            if !can_increase {
                item.max_desired = item.offered;
                debug!(conn = %item.id_str(), "not yet ready to increase offer");
            } else if item.offered - item.max_recent < cfg.margin_increase {
                // Usage tracks the offer closely, so more may be wanted.
                item.max_desired = item.offered + cfg.max_offer_increase;
                debug!(conn = %item.id_str(), max = item.max_desired, "increasing desired offer");
            } else {
                item.max_desired = item.offered;
                debug!(
                    conn = %item.id_str(),
                    recent = item.max_recent,
                    offered = item.offered,
                    "recent usage too low to increase"
                );
            }
            if let Some(ev_max) = item.ev_max_usage {
                item.max_desired = item.max_desired.min(ev_max);
            }
            item.max_desired = item.max_desired.min(item.conn_max);
        }
    }
}

/// Before priority assignment, give waiting connectors without a
/// transaction their chance to start.
fn preassign_starters(items: &mut [Item], cfg: &BalanzConfig, now: DateTime<Utc>, ceiling: f64) {
    let used: f64 = items.iter().filter(|i| i.done).map(|i| i.allocation).sum();
    let mut remaining = ceiling - used;
    for item in items.iter_mut().filter(|i| {
        !i.done
            && !i.has_transaction
            && i.status == ConnectorStatus::SuspendedEVSE
            && i.suspend_until.map(|t| now >= t).unwrap_or(true)
    }) {
        if remaining >= cfg.min_allocation {
            item.allocation = cfg.min_allocation;
            remaining -= cfg.min_allocation;
            item.done = true;
            debug!(conn = %item.id_str(), remaining, "granting start allocation");
        }
    }
}

/// Distribute the remaining capacity by connector priority, highest first.
fn assign_by_priority(
    items: &mut [Item],
    cfg: &BalanzConfig,
    buckets: &[PriorityBucket],
    ceiling: f64,
) {
    let mut priorities: Vec<i32> = items.iter().filter(|i| !i.done).map(|i| i.priority).collect();
    priorities.sort_unstable_by(|a, b| b.cmp(a));
    priorities.dedup();

    // A done allocation counts against the highest bucket whose threshold
    // its priority clears, and only that one.
    let bucket_of = |priority: i32| buckets.iter().position(|(threshold, _)| priority >= *threshold);

    for priority in priorities {
        let mut used_per_bucket = vec![0.0f64; buckets.len()];
        for item in items.iter().filter(|i| i.done && i.allocation > 0.0) {
            if let Some(idx) = bucket_of(item.priority) {
                used_per_bucket[idx] += item.allocation;
            }
        }
        let remaining_in_bucket = match bucket_of(priority) {
            Some(idx) => buckets[idx].1 - used_per_bucket[idx],
            None => {
                error!(priority, ?buckets, "priority below every bucket");
                0.0
            }
        };
        let used_total: f64 = items.iter().filter(|i| i.done).map(|i| i.allocation).sum();
        let mut remaining = remaining_in_bucket.min(ceiling - used_total);
        debug!(priority, remaining_in_bucket, used_total, remaining, "priority round");

        // Snapshot of this priority's contenders; done flags evolve inside.
        let contenders: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.priority == priority && !i.done)
            .map(|(idx, _)| idx)
            .collect();

        // Confirm the minimum for already-running connectors, then for
        // starters. Only a full bucket finalizes anyone here; survivors may
        // still grow below.
        for already_running in [true, false] {
            for &idx in &contenders {
                let item = &mut items[idx];
                if item.done
                    || (item.offered > 0.0) != already_running
                    || item.max_desired < cfg.min_allocation
                {
                    continue;
                }
                if remaining >= cfg.min_allocation {
                    item.allocation = cfg.min_allocation;
                    remaining -= cfg.min_allocation;
                } else {
                    item.allocation = 0.0;
                    item.done = true;
                }
            }
        }

        // Round-robin growth, one amp at a time, until nothing moves.
        loop {
            let mut progressed = false;
            for &idx in &contenders {
                let item = &mut items[idx];
                if item.allocation >= item.max_desired {
                    item.done = true;
                } else if remaining > 0.0 {
                    item.allocation += 1.0;
                    remaining -= 1.0;
                    progressed = true;
                } else {
                    item.done = true;
                }
            }
            if !progressed {
                break;
            }
        }

        for &idx in &contenders {
            debug!(
                conn = %items[idx].id_str(),
                allocation = items[idx].allocation,
                done = items[idx].done,
                "priority round result"
            );
        }
    }
}
