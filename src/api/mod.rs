//! Admin/observer JSON API over WebSocket.

pub mod handler;
pub mod users;

pub use handler::handle_api;
pub use users::{Role, UserTable};
