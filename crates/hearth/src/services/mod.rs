//! Background services
//!
//! Periodic and event-driven work around the hub, run by the
//! [`hearth_runtime::service::ServiceManager`].

mod janitor;
mod liveness;
mod reload;

pub use janitor::*;
pub use liveness::*;
pub use reload::*;
