use std::time;

use registry_common::registry::RegistryError;
use thiserror::Error;

use crate::phase::LifecyclePhase;

/// Enumeration of errors the agent surfaces to its owner.
///
/// Failures during steady-state reporting are absorbed and logged by the liveness
/// loop, so they never show up here.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to register with the registry, not entering the reporting phase: {0}")]
    StartupRegistration(#[source] RegistryError),
    #[error("agent was already started, a registration is owned by this instance")]
    AlreadyStarted,
    #[error("lifecycle cannot move from {from} to {to}")]
    InvalidTransition {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },
    #[error("probe timeout ({probe_timeout:?}) plus registry call timeout ({call_timeout:?}) must be shorter than the heartbeat interval ({interval:?})")]
    TickTooLong {
        probe_timeout: time::Duration,
        call_timeout: time::Duration,
        interval: time::Duration,
    },
    #[error("check ttl ({ttl:?}) must not be shorter than the heartbeat interval ({interval:?})")]
    TtlTooShort {
        ttl: time::Duration,
        interval: time::Duration,
    },
    #[error("heartbeat interval must be greater than zero")]
    ZeroInterval,
    #[error("liveness loop panicked")]
    LoopPanicked,
}
