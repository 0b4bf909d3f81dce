//! End-to-end allocation scenarios for the balanz planner, driven with a
//! deterministic clock against a populated store.

use std::sync::Arc;

use balanz::config::AppConfig;
use balanz::engine::planner::plan;
use balanz::model::{ChargeChange, ConnectorStatus, Store, Tag, TagStatus};
use balanz::support::timeutil::next_top_of_hour;
use chrono::{DateTime, Duration, Utc};

const SCHEDULE: &str = "00:00-23:59>0=24:3=40:5=48";

fn setup(chargers: &[(&str, i32)]) -> Store {
    let store = Store::new(Arc::new(AppConfig::default()));
    store.add_group("SITE", None, Some(SCHEDULE)).unwrap();
    for (charger_id, priority) in chargers {
        store
            .add_charger(charger_id, "SITE", charger_id, 1, *priority, None, Some(32.0), None)
            .unwrap();
    }
    store.upsert_tag(Tag::new("CARD", None, None, None, TagStatus::Activated, None));
    store
}

fn run_plan(store: &Store, now: DateTime<Utc>) -> (Vec<ChargeChange>, Vec<ChargeChange>) {
    store
        .with_model_mut(|m| plan(m, "SITE", &store.config().balanz, now))
        .unwrap()
}

fn commit(store: &Store, changes: &[ChargeChange], now: DateTime<Utc>) {
    for change in changes {
        store.charge_change_implemented(change, now);
    }
}

/// Feed a steady usage level into the sliding window and the transaction.
fn feed_usage(store: &Store, charger_id: &str, level: f64, from: DateTime<Utc>, until: DateTime<Utc>) {
    store.with_model_mut(|m| {
        let conn = m.connector_mut(charger_id, 1).unwrap();
        let mut t = from;
        while t <= until {
            conn.balanz.recent_usages.push_back((level, t));
            t += Duration::seconds(30);
        }
        if let Some(trans) = conn.transaction.as_mut() {
            trans.usage_meter = Some(level);
        }
    });
}

fn offered(store: &Store, charger_id: &str) -> Option<f64> {
    store.with_model(|m| m.chargers[charger_id].connectors[&1].offered)
}

fn set_status(store: &Store, charger_id: &str, status: ConnectorStatus, now: DateTime<Utc>) {
    store.status_notification(charger_id, 1, status, now).unwrap();
}

/// Solo low-priority charger ramps 6 → 12 → 18 → 24 and stops at the
/// priority-0 bucket cap.
#[test]
fn solo_charger_ramps_to_its_bucket_cap() {
    let store = setup(&[("A", 1)]);
    let t0 = Utc::now();

    // Tag accepted, no transaction yet: the starter grant.
    set_status(&store, "A", ConnectorStatus::SuspendedEVSE, t0);
    let (reduce, grow) = run_plan(&store, t0);
    assert!(reduce.is_empty());
    assert_eq!(grow.len(), 1);
    assert_eq!(grow[0].allocation, 6.0);
    assert_eq!(grow[0].transaction_id, None);
    commit(&store, &grow, t0);

    // Blocking profile lifted, charging begins.
    store.start_transaction("A", 1, "CARD", 0, t0).unwrap();
    set_status(&store, "A", ConnectorStatus::Charging, t0);

    let mut tick_start = t0;
    for expected in [12.0, 18.0, 24.0] {
        let tick_end = tick_start + Duration::seconds(185);
        feed_usage(&store, "A", expected - 6.2, tick_start, tick_end);
        let (reduce, grow) = run_plan(&store, tick_end);
        assert!(reduce.is_empty());
        assert_eq!(grow.len(), 1, "expected a grow to {expected}");
        assert_eq!(grow[0].allocation, expected);
        assert_eq!(grow[0].transaction_id, Some(1));
        commit(&store, &grow, tick_end);
        tick_start = tick_end;
    }
    assert_eq!(offered(&store, "A"), Some(24.0));

    // Steady state: the next pass changes nothing.
    let settle = tick_start + Duration::seconds(185);
    feed_usage(&store, "A", 23.8, tick_start, settle);
    let (reduce, grow) = run_plan(&store, settle);
    assert!(reduce.is_empty(), "unexpected reduce {reduce:?}");
    assert!(grow.is_empty(), "unexpected grow {grow:?}");
}

/// A higher-priority arrival starts immediately out of its own bucket
/// without disturbing the established session.
#[test]
fn priority_arrival_does_not_preempt_within_budget() {
    let store = setup(&[("A", 1), ("B", 3)]);
    let t0 = Utc::now();

    // A established at 24 A.
    set_status(&store, "A", ConnectorStatus::SuspendedEVSE, t0);
    commit(
        &store,
        &[ChargeChange {
            charger_id: "A".into(),
            connector_id: 1,
            transaction_id: None,
            allocation: 24.0,
        }],
        t0,
    );
    store.start_transaction("A", 1, "CARD", 0, t0).unwrap();
    set_status(&store, "A", ConnectorStatus::Charging, t0);
    store.with_model_mut(|m| {
        let conn = m.connector_mut("A", 1).unwrap();
        conn.offered = Some(24.0);
        conn.balanz.last_offer_time = Some(t0);
    });
    feed_usage(&store, "A", 23.8, t0, t0 + Duration::seconds(60));

    // B tags in.
    let t1 = t0 + Duration::seconds(90);
    set_status(&store, "B", ConnectorStatus::SuspendedEVSE, t1);

    let (reduce, grow) = run_plan(&store, t1);
    assert!(reduce.is_empty(), "A must keep its allocation: {reduce:?}");
    assert_eq!(grow.len(), 1);
    assert_eq!(grow[0].charger_id, "B");
    assert_eq!(grow[0].allocation, 6.0);
    commit(&store, &grow, t1);

    assert_eq!(offered(&store, "A"), Some(24.0));
    assert_eq!(offered(&store, "B"), Some(6.0));
}

/// An EV that reports SuspendedEV and stops drawing gets its offer pulled
/// after the grace period, with a mid-session retry delay.
#[test]
fn ev_full_mid_session_releases_the_offer() {
    let store = setup(&[("A", 1)]);
    let t0 = Utc::now();

    store.start_transaction("A", 1, "CARD", 0, t0).unwrap();
    set_status(&store, "A", ConnectorStatus::Charging, t0);
    commit(
        &store,
        &[ChargeChange {
            charger_id: "A".into(),
            connector_id: 1,
            transaction_id: Some(1),
            allocation: 6.0,
        }],
        t0,
    );
    store.with_model_mut(|m| {
        m.connector_mut("A", 1).unwrap().transaction.as_mut().unwrap().energy_meter = 1500;
    });

    // EV reports full; usage drops to zero.
    let t1 = t0 + Duration::seconds(30);
    set_status(&store, "A", ConnectorStatus::SuspendedEV, t1);

    // Within the grace period the offer is kept.
    let (reduce, grow) = run_plan(&store, t0 + Duration::seconds(200));
    assert!(reduce.is_empty() && grow.is_empty());

    // Past the grace period it is pulled, with the mid-session retry delay
    // (energy is beyond the initial-charging threshold).
    let t2 = t0 + Duration::seconds(301);
    let (reduce, grow) = run_plan(&store, t2);
    assert!(grow.is_empty());
    assert_eq!(reduce.len(), 1);
    assert_eq!(reduce[0].allocation, 0.0);
    assert_eq!(reduce[0].transaction_id, Some(1));
    store.with_model(|m| {
        let scratch = &m.chargers["A"].connectors[&1].balanz;
        assert_eq!(scratch.suspend_until, Some(t2 + Duration::seconds(3600)));
    });
}

/// A delayed-start EV (no energy drawn yet) is retried shortly before the
/// next top of the hour, and no capacity is granted inside the window.
#[test]
fn delayed_start_aligns_retry_to_top_of_hour() {
    let store = setup(&[("A", 1)]);
    let t0 = Utc::now();

    store.start_transaction("A", 1, "CARD", 0, t0).unwrap();
    store.with_model_mut(|m| {
        let conn = m.connector_mut("A", 1).unwrap();
        conn.offered = Some(6.0);
        conn.transaction.as_mut().unwrap().energy_meter = 100;
    });
    set_status(&store, "A", ConnectorStatus::SuspendedEV, t0);

    let t1 = t0 + Duration::seconds(301);
    let (reduce, _) = run_plan(&store, t1);
    assert_eq!(reduce.len(), 1);
    assert_eq!(reduce[0].allocation, 0.0);
    let expected_retry = next_top_of_hour(t1, 300);
    store.with_model(|m| {
        assert_eq!(
            m.chargers["A"].connectors[&1].balanz.suspend_until,
            Some(expected_retry)
        );
    });
    commit(&store, &reduce, t1);

    // The charger settles into SuspendedEVSE; transaction ends.
    store.stop_transaction("A", 1, 100, t1, Some("Local".into()), None).unwrap();
    store.with_model_mut(|m| {
        let conn = m.connector_mut("A", 1).unwrap();
        conn.status = Some(ConnectorStatus::SuspendedEVSE);
        conn.offered = Some(0.0);
        conn.balanz.suspend_until = Some(expected_retry);
    });

    // Inside the window: no start grant.
    let (reduce, grow) = run_plan(&store, t1 + Duration::seconds(30));
    assert!(reduce.is_empty() && grow.is_empty());

    // After the window: the starter minimum is offered again.
    let (reduce, grow) = run_plan(&store, expected_retry + Duration::seconds(1));
    assert!(reduce.is_empty());
    assert_eq!(grow.len(), 1);
    assert_eq!(grow[0].allocation, 6.0);
    assert_eq!(grow[0].transaction_id, None);
}

/// Reduce-to-observed frees capacity for a waiting starter, reduce listed
/// before grow, and the observed ceiling becomes sticky.
#[test]
fn underuse_is_reduced_before_a_starter_grows() {
    let store = setup(&[("X", 1), ("Y", 1)]);
    let t0 = Utc::now();

    store.start_transaction("X", 1, "CARD", 0, t0).unwrap();
    set_status(&store, "X", ConnectorStatus::Charging, t0);
    commit(
        &store,
        &[ChargeChange {
            charger_id: "X".into(),
            connector_id: 1,
            transaction_id: Some(1),
            allocation: 12.0,
        }],
        t0,
    );
    let t1 = t0 + Duration::seconds(310);
    feed_usage(&store, "X", 6.0, t0, t1);

    set_status(&store, "Y", ConnectorStatus::SuspendedEVSE, t1);

    let (reduce, grow) = run_plan(&store, t1);
    assert_eq!(reduce.len(), 1);
    assert_eq!(reduce[0].charger_id, "X");
    assert_eq!(reduce[0].allocation, 6.0);
    assert_eq!(grow.len(), 1);
    assert_eq!(grow[0].charger_id, "Y");
    assert_eq!(grow[0].allocation, 6.0);

    // The observed ceiling sticks for the rest of the transaction.
    store.with_model(|m| {
        assert_eq!(m.chargers["X"].connectors[&1].balanz.ev_max_usage, Some(6.0));
    });

    // At the minimum there is nothing further to reduce, even if usage
    // drifts lower still.
    commit(&store, &reduce, t1);
    commit(&store, &grow, t1);
    let t2 = t1 + Duration::seconds(310);
    feed_usage(&store, "X", 5.0, t1, t2);
    let (reduce, grow) = run_plan(&store, t2);
    assert!(reduce.is_empty(), "already at the minimum: {reduce:?}");
    assert!(grow.is_empty(), "usage is below the offer: {grow:?}");
    store.with_model(|m| {
        assert_eq!(m.chargers["X"].connectors[&1].balanz.ev_max_usage, Some(6.0));
    });
}

/// A transaction-level priority override moves the connector into a higher
/// bucket.
#[test]
fn transaction_priority_override_raises_the_cap() {
    let store = setup(&[("A", 1)]);
    let t0 = Utc::now();

    store.start_transaction("A", 1, "CARD", 0, t0).unwrap();
    set_status(&store, "A", ConnectorStatus::Charging, t0);
    store.set_charge_priority("A", 1, 3).unwrap();
    commit(
        &store,
        &[ChargeChange {
            charger_id: "A".into(),
            connector_id: 1,
            transaction_id: Some(1),
            allocation: 24.0,
        }],
        t0,
    );

    // At priority 3 the 40 A bucket applies, so growth continues past 24.
    let t1 = t0 + Duration::seconds(185);
    feed_usage(&store, "A", 23.8, t0, t1);
    let (reduce, grow) = run_plan(&store, t1);
    assert!(reduce.is_empty());
    assert_eq!(grow.len(), 1);
    assert_eq!(grow[0].allocation, 30.0);
}
