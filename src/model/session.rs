//! Completed charging sessions and their append-only CSV log.

use std::fs::{File, OpenOptions};
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use super::transaction::{ChargingHistory, Transaction};
use crate::support::errors::ModelError;
use crate::support::timeutil::{clock_str, duration_str, time_str};

/// Immutable record of a completed transaction.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub charger_id: String,
    pub charger_alias: String,
    pub group_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub user_name: String,
    pub stop_id_tag: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds.
    pub duration: i64,
    /// Wh, `meter_stop - meter_start`.
    pub energy: i64,
    pub reason: Option<String>,
    pub charging_history: Vec<ChargingHistory>,
}

impl SessionRecord {
    pub fn from_transaction(
        trans: &Transaction,
        charger_alias: &str,
        group_id: &str,
        meter_stop: i64,
        end_time: DateTime<Utc>,
        reason: Option<String>,
        stop_id_tag: Option<String>,
    ) -> Self {
        let session_id = format!(
            "{}-{}",
            trans.charger_id,
            trans
                .start_time
                .with_timezone(&Local)
                .format("%Y-%m-%d-%H:%M:%S")
        );
        Self {
            session_id,
            charger_id: trans.charger_id.clone(),
            charger_alias: charger_alias.to_string(),
            group_id: group_id.to_string(),
            connector_id: trans.connector_id,
            id_tag: trans.id_tag.clone(),
            user_name: trans.user_name.clone(),
            stop_id_tag,
            start_time: trans.start_time,
            end_time,
            duration: (end_time - trans.start_time).num_seconds(),
            energy: meter_stop - trans.meter_start,
            reason,
            charging_history: trans.charging_history.clone(),
        }
    }

    /// The `history` CSV column: `HH:MM:SS=<A>A;…`.
    pub fn history_str(&self) -> String {
        self.charging_history
            .iter()
            .map(|ch| format!("{}={}A", clock_str(ch.timestamp), ch.offered))
            .collect::<Vec<_>>()
            .join(";")
    }
}

const SESSION_CSV_HEADER: [&str; 13] = [
    "session_id",
    "charger_id",
    "charger_alias",
    "group_id",
    "id_tag",
    "user_name",
    "stop_id_tag",
    "start_time",
    "end_time",
    "duration",
    "energy",
    "stop_reason",
    "history",
];

/// Append-only writer for the completed-sessions CSV.
pub struct SessionLog {
    writer: csv::Writer<File>,
}

impl SessionLog {
    /// Open (or create with header) the sessions CSV for appending.
    pub fn open(path: &Path) -> Result<Self, ModelError> {
        let fresh = !path.exists();
        if fresh {
            let mut writer = csv::Writer::from_path(path)?;
            writer.write_record(SESSION_CSV_HEADER)?;
            writer.flush()?;
        }
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            writer: csv::WriterBuilder::new().has_headers(false).from_writer(file),
        })
    }

    pub fn append(&mut self, session: &SessionRecord) -> Result<(), ModelError> {
        let row = [
            session.session_id.clone(),
            session.charger_id.clone(),
            session.charger_alias.clone(),
            session.group_id.clone(),
            session.id_tag.clone(),
            session.user_name.clone(),
            session.stop_id_tag.clone().unwrap_or_default(),
            time_str(session.start_time),
            time_str(session.end_time),
            duration_str(session.duration),
            session.energy.to_string(),
            session.reason.clone().unwrap_or_default(),
            session.history_str(),
        ];
        self.writer.write_record(&row)?;
        self.writer.flush()?;
        Ok(())
    }
}
