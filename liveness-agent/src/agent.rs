//! Glue between the registration manager and the liveness loop.
//!
//! [`Agent::run`] registers, runs the loop, and then deregisters on every exit
//! path: probe failure, cancellation, or a panic inside the loop. If the `run`
//! future itself is dropped mid-flight, the registration guard's drop hook
//! takes over the deregistration.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time;

use futures::FutureExt;
use registry_common::registry::{RegistrationRecord, RegistryClient};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::AgentError;
use crate::heartbeat::{LivenessLoop, LoopStats, ReportFailurePolicy, StopCause};
use crate::phase::{LifecyclePhase, PhaseTracker};
use crate::probe::{LivenessProbe, ProcessProbe, TimeoutProbe};
use crate::registration::{Deregistration, RegistrationManager};

pub const DEFAULT_HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(10);
pub const DEFAULT_CHECK_TTL: time::Duration = time::Duration::from_secs(15);
pub const DEFAULT_CALL_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: time::Duration = time::Duration::from_secs(2);

/// How an agent run ended, when it got past registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub cause: StopCause,
    pub stats: LoopStats,
    pub deregistration: Deregistration,
}

pub struct AgentBuilder {
    registry: Arc<dyn RegistryClient>,
    record: RegistrationRecord,
    probe: Option<Arc<dyn LivenessProbe>>,
    probe_timeout: time::Duration,
    heartbeat_interval: time::Duration,
    call_timeout: time::Duration,
    report_failure_policy: ReportFailurePolicy,
}

impl AgentBuilder {
    /// Defaults to a [`ProcessProbe`] on the current process.
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// A probe that does not answer within `timeout` counts as unhealthy.
    pub fn with_probe_timeout(mut self, timeout: time::Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: time::Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Upper bound on every registry call. Together with the probe timeout it
    /// must stay below the heartbeat interval.
    pub fn with_call_timeout(mut self, timeout: time::Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_report_failure_policy(mut self, policy: ReportFailurePolicy) -> Self {
        self.report_failure_policy = policy;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let interval = self.heartbeat_interval;
        if interval.is_zero() {
            return Err(AgentError::ZeroInterval);
        }
        // A tick is one probe plus one report, cancellation waits for both.
        if self.probe_timeout.saturating_add(self.call_timeout) >= interval {
            return Err(AgentError::TickTooLong {
                probe_timeout: self.probe_timeout,
                call_timeout: self.call_timeout,
                interval,
            });
        }
        if self.record.check.ttl < interval {
            return Err(AgentError::TtlTooShort {
                ttl: self.record.check.ttl,
                interval,
            });
        }

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcessProbe::current()));
        let probe = Arc::new(TimeoutProbe::new(probe, self.probe_timeout));
        let phase = PhaseTracker::new(&self.record.service_id);
        let heartbeat = LivenessLoop::new(
            self.registry.clone(),
            probe,
            &self.record.service_id,
            interval,
            self.call_timeout,
            self.report_failure_policy,
        )
        .with_alive_note(&self.record.check.note);
        let registration =
            RegistrationManager::new(self.registry, self.record, self.call_timeout, phase.clone());

        Ok(Agent {
            registration,
            heartbeat,
            phase,
        })
    }
}

/// A self-registering liveness agent for one registry entry. Single use:
/// once [`run`](Agent::run) returns the instance is spent.
pub struct Agent {
    registration: RegistrationManager,
    heartbeat: LivenessLoop,
    phase: PhaseTracker,
}

impl Agent {
    pub fn builder(registry: Arc<dyn RegistryClient>, record: RegistrationRecord) -> AgentBuilder {
        AgentBuilder {
            registry,
            record,
            probe: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            report_failure_policy: ReportFailurePolicy::default(),
        }
    }

    /// Observe lifecycle phase changes. Read-only: only the agent moves the phase.
    pub fn phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    /// Register, keep the entry alive until the probe fails or `shutdown` is
    /// cancelled, then deregister.
    ///
    /// Registration failures are returned before any heartbeat is sent. Once
    /// registered, every exit path attempts exactly one deregistration.
    pub async fn run(self, shutdown: CancellationToken) -> Result<AgentExit, AgentError> {
        let service_id = self.registration.record().service_id.clone();
        if shutdown.is_cancelled() {
            info!(%service_id, "shutdown requested before registration, not registering");
            return Ok(AgentExit {
                cause: StopCause::Cancelled,
                stats: LoopStats::default(),
                deregistration: Deregistration::Skipped,
            });
        }

        let guard = self.registration.register().await?;

        let outcome = AssertUnwindSafe(self.heartbeat.run(&guard, &self.phase, &shutdown))
            .catch_unwind()
            .await;

        let deregistration = guard.release().await;

        match outcome {
            Ok(exit) => {
                match &exit.cause {
                    StopCause::Cancelled => info!(
                        %service_id,
                        ticks = exit.stats.ticks,
                        ?deregistration,
                        "agent stopped on shutdown request"
                    ),
                    StopCause::Released => info!(
                        %service_id,
                        ticks = exit.stats.ticks,
                        "agent stopped after its registration was released"
                    ),
                    StopCause::ProbeUnhealthy(reason) => warn!(
                        %service_id,
                        ticks = exit.stats.ticks,
                        ?deregistration,
                        reason = %reason,
                        "agent stopped after failed probe"
                    ),
                }
                Ok(AgentExit {
                    cause: exit.cause,
                    stats: exit.stats,
                    deregistration,
                })
            }
            Err(_) => {
                error!(%service_id, ?deregistration, "liveness loop panicked");
                Err(AgentError::LoopPanicked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_common::registry::{RegistryError, TtlCheck};

    struct NoopRegistry;

    #[async_trait::async_trait]
    impl RegistryClient for NoopRegistry {
        async fn register(&self, _record: &RegistrationRecord) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn report_alive(&self, _service_id: &str, _note: &str) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn report_failing(
            &self,
            _service_id: &str,
            _note: &str,
        ) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn deregister(&self, _service_id: &str) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    fn builder(ttl: time::Duration) -> AgentBuilder {
        let check = TtlCheck::new("ttl", "test", ttl);
        let record = RegistrationRecord::new("svc-1", "svc", "127.0.0.1", check);
        Agent::builder(Arc::new(NoopRegistry), record)
    }

    #[test]
    fn defaults_are_valid() {
        assert!(builder(DEFAULT_CHECK_TTL).build().is_ok());
    }

    #[test]
    fn call_timeout_must_be_shorter_than_interval() {
        let err = builder(DEFAULT_CHECK_TTL)
            .with_call_timeout(DEFAULT_HEARTBEAT_INTERVAL)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::TickTooLong { .. }));
    }

    #[test]
    fn probe_and_call_timeouts_must_fit_in_one_interval() {
        let err = builder(DEFAULT_CHECK_TTL)
            .with_probe_timeout(time::Duration::from_secs(5))
            .with_call_timeout(time::Duration::from_secs(5))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            AgentError::TickTooLong {
                probe_timeout,
                call_timeout,
                interval,
            } if probe_timeout + call_timeout == interval
        ));

        assert!(builder(DEFAULT_CHECK_TTL)
            .with_probe_timeout(time::Duration::from_secs(4))
            .with_call_timeout(time::Duration::from_secs(5))
            .build()
            .is_ok());
    }

    #[test]
    fn ttl_must_cover_the_interval() {
        let err = builder(time::Duration::from_secs(5)).build().err().unwrap();
        assert!(matches!(err, AgentError::TtlTooShort { .. }));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = builder(DEFAULT_CHECK_TTL)
            .with_heartbeat_interval(time::Duration::ZERO)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::ZeroInterval));
    }

    #[tokio::test]
    async fn cancelled_before_start_never_registers() {
        let agent = builder(DEFAULT_CHECK_TTL).build().unwrap();
        let phase = agent.phase();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let exit = agent.run(shutdown).await.unwrap();
        assert_eq!(exit.cause, StopCause::Cancelled);
        assert_eq!(exit.deregistration, Deregistration::Skipped);
        assert_eq!(*phase.borrow(), LifecyclePhase::NotRegistered);
    }
}
