//! Charger-facing OCPP 1.6 layer: the WebSocket server, per-charger
//! sessions, correlated outbound calls and the charging-profile driver.

pub mod calls;
pub mod handlers;
pub mod profile;
pub mod registry;
pub mod server;

pub use calls::{CallError, CallSender};
pub use profile::ProfileDriver;
pub use registry::SessionRegistry;
pub use server::{OcppServer, ServerContext};
