//! The authoritative in-memory entity model.
//!
//! Groups own chargers, chargers own connectors, connectors own their live
//! transaction. Completed transactions become immutable [`SessionRecord`]s.
//! Tags validate Authorize requests. All of it hangs off one [`Store`].

pub mod charger;
pub mod connector;
pub mod csv;
pub mod group;
pub mod schedule;
pub mod session;
pub mod store;
pub mod tag;
pub mod transaction;
pub mod views;

pub use charger::{BootInfo, Charger};
pub use connector::{BalanzScratch, Connector, ConnectorStatus};
pub use group::Group;
pub use schedule::{AllocationSchedule, PriorityBucket};
pub use session::SessionRecord;
pub use store::{AuthOutcome, Model, Store};
pub use tag::{Tag, TagStatus};
pub use transaction::{ChargeChange, ChargingHistory, Transaction};
