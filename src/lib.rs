//! # balanz
//!
//! OCPP 1.6 Central System with smart-charging load balancing for fleets of
//! EV chargers sharing a constrained electrical supply.
//!
//! ## Architecture
//!
//! - **support**: Cross-cutting utilities (errors, OCPP-J framing, shutdown, time)
//! - **model**: Authoritative in-memory entity store (groups, chargers,
//!   connectors, tags, transactions, sessions) and its CSV persistence
//! - **ocpp**: WebSocket server, per-charger sessions, outbound call
//!   correlation and the charging-profile driver
//! - **engine**: The balanz allocation engine, per-group control loops and
//!   the stale-transaction watchdog
//! - **api**: Admin/observer JSON API served on the `/api` path
//! - **config**: Application configuration (TOML-based)

pub mod api;
pub mod config;
pub mod engine;
pub mod model;
pub mod ocpp;
pub mod support;

// Re-export commonly used types at crate root
pub use config::AppConfig;
pub use model::{ChargeChange, Store};
pub use ocpp::{CallError, CallSender, ProfileDriver, SessionRegistry};
pub use support::errors::ModelError;
pub use support::shutdown::ShutdownSignal;
