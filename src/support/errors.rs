//! Error types for the entity store and its callers.
//!
//! `ModelError` is the single tagged error surfaced by store operations.
//! At the API boundary each variant maps onto a descriptive `CallError`
//! status string; internal engine code treats them as ordinary `Result`s.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no such group: {0}")]
    NoSuchGroup(String),

    #[error("no such charger: {0}")]
    NoSuchCharger(String),

    #[error("no such connector: {charger_id}/{connector_id}")]
    NoSuchConnector { charger_id: String, connector_id: u32 },

    #[error("no such tag: {0}")]
    NoSuchTag(String),

    #[error("transaction {transaction_id} not found on {charger_id}")]
    NoSuchTransaction { charger_id: String, transaction_id: i32 },

    #[error("connector {charger_id}/{connector_id} not in transaction")]
    ConnectorNotInTransaction { charger_id: String, connector_id: u32 },

    #[error("group {0} has no allocation schedule")]
    NotAllocationGroup(String),

    #[error("no schedule interval covers the current time for group {0}")]
    NoScheduleInterval(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// Short status code used in API `CallError` replies.
    pub fn status(&self) -> &'static str {
        match self {
            Self::NoSuchGroup(_) => "NoSuchGroup",
            Self::NoSuchCharger(_) => "NoSuchCharger",
            Self::NoSuchConnector { .. } => "NoSuchConnector",
            Self::NoSuchTag(_) => "NoSuchTag",
            Self::NoSuchTransaction { .. } => "NoSuchTransaction",
            Self::ConnectorNotInTransaction { .. } => "ConnectorNotInTransaction",
            Self::NotAllocationGroup(_) => "NotAllocationGroup",
            Self::NoScheduleInterval(_) => "NoScheduleInterval",
            Self::Conflict(_) => "Conflict",
            Self::IllegalArgument(_) => "IllegalArgument",
            Self::Csv(_) => "CsvError",
            Self::Io(_) => "IoError",
        }
    }
}
