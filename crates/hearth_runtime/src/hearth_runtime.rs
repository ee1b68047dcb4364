//! Hearth service runtime
//!
//! Long-running background work in hearth (liveness sweeps, intent retention,
//! the field-controller link, home reloads) runs as a [`service::Service`]
//! managed by a [`service::ServiceManager`].

pub mod service;
