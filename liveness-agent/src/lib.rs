//! A self-registering liveness agent.
//!
//! The agent registers a service entry with a TTL health check in a remote
//! registry, then keeps asserting it is alive on a fixed cadence for as long as
//! its [`probe::LivenessProbe`] says the process is healthy. It deregisters
//! exactly once on every stop path: probe failure, shutdown request, or an
//! internal fault. If it vanishes without deregistering, the registry's TTL
//! expiry reaps the entry.

pub mod agent;
pub mod config;
pub mod error;
pub mod handlers;
pub mod heartbeat;
mod metrics;
pub mod net;
pub mod phase;
pub mod probe;
pub mod registration;
pub mod signals;
