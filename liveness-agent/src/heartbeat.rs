//! The liveness loop: probe on a fixed cadence, report the result to the registry.
use std::sync::Arc;
use std::time;

use registry_common::registry::{LivenessReport, RegistryClient, RegistryError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::phase::{LifecyclePhase, PhaseTracker};
use crate::probe::{LivenessProbe, ProbeResult};
use crate::registration::{bounded, RegistrationGuard};

/// What to do about heartbeats the registry did not accept.
///
/// Report failures never end the loop: only the probe decides health. After
/// `escalate_after` consecutive failures each further failure is logged as an
/// error instead of a warning, and the counter resets on the next success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportFailurePolicy {
    pub escalate_after: u32,
}

impl Default for ReportFailurePolicy {
    fn default() -> Self {
        Self { escalate_after: 3 }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// The probe reported unhealthy; a failing report was attempted first.
    ProbeUnhealthy(String),
    /// External cancellation, no report was sent.
    Cancelled,
    /// Deregistration started elsewhere while the loop was running.
    Released,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub alive_reports: u64,
    pub report_failures: u64,
    pub consecutive_report_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopExit {
    pub cause: StopCause,
    pub stats: LoopStats,
}

pub struct LivenessLoop {
    registry: Arc<dyn RegistryClient>,
    probe: Arc<dyn LivenessProbe>,
    service_id: String,
    interval: time::Duration,
    call_timeout: time::Duration,
    policy: ReportFailurePolicy,
    alive_note: String,
}

impl LivenessLoop {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        probe: Arc<dyn LivenessProbe>,
        service_id: &str,
        interval: time::Duration,
        call_timeout: time::Duration,
        policy: ReportFailurePolicy,
    ) -> Self {
        Self {
            registry,
            probe,
            service_id: service_id.to_owned(),
            interval,
            call_timeout,
            policy,
            alive_note: format!("{} probe healthy", service_id),
        }
    }

    pub fn with_alive_note(mut self, note: &str) -> Self {
        self.alive_note = note.to_owned();
        self
    }

    /// Run until the probe reports unhealthy, `shutdown` is cancelled, or the
    /// registration is released.
    ///
    /// Borrowing the [`RegistrationGuard`] ties every heartbeat to a live
    /// registration: the loop cannot start before `register()` succeeded, and
    /// it sends nothing once deregistration has started.
    pub async fn run(
        &self,
        registration: &RegistrationGuard,
        phase: &PhaseTracker,
        shutdown: &CancellationToken,
    ) -> LoopExit {
        let released = registration.released();
        let mut stats = LoopStats::default();
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            service_id = %self.service_id,
            interval_secs = self.interval.as_secs_f64(),
            probe = self.probe.name(),
            "starting liveness loop"
        );

        loop {
            // The wait is the only suspension point that observes cancellation.
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(
                        service_id = %self.service_id,
                        ticks = stats.ticks,
                        "liveness loop cancelled"
                    );
                    return self.stop(phase, StopCause::Cancelled, stats);
                }
                _ = released.cancelled() => {
                    return self.on_released(stats);
                }
                _ = interval.tick() => {}
            }

            stats.ticks += 1;
            let result = self.probe.probe().await;
            if released.is_cancelled() {
                return self.on_released(stats);
            }

            match result {
                ProbeResult::Healthy => {
                    self.advance(phase, LifecyclePhase::Reporting);
                    let report = LivenessReport::alive(&self.service_id, &self.alive_note);
                    self.send_alive(&report, &mut stats).await;
                }
                ProbeResult::Unhealthy(reason) => {
                    warn!(
                        service_id = %self.service_id,
                        probe = self.probe.name(),
                        tick = stats.ticks,
                        reason = %reason,
                        "probe reported unhealthy, stopping liveness loop"
                    );
                    metrics::emit_probe_unhealthy(&self.service_id, self.probe.name());
                    self.advance(phase, LifecyclePhase::Stopping);
                    self.send_failing(&LivenessReport::failing(&self.service_id, &reason))
                        .await;
                    return LoopExit {
                        cause: StopCause::ProbeUnhealthy(reason),
                        stats,
                    };
                }
            }
        }
    }

    fn stop(&self, phase: &PhaseTracker, cause: StopCause, stats: LoopStats) -> LoopExit {
        if phase.current().is_active() {
            self.advance(phase, LifecyclePhase::Stopping);
        }
        LoopExit { cause, stats }
    }

    /// The deregistration path already owns the phase, leave it alone.
    fn on_released(&self, stats: LoopStats) -> LoopExit {
        info!(
            service_id = %self.service_id,
            ticks = stats.ticks,
            "registration released, stopping liveness loop"
        );
        LoopExit {
            cause: StopCause::Released,
            stats,
        }
    }

    async fn send(&self, report: &LivenessReport) -> Result<(), RegistryError> {
        let start = Instant::now();
        let result = bounded(self.call_timeout, self.registry.report(report)).await;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(error) => error.kind(),
        };
        metrics::emit_heartbeat(
            &self.service_id,
            report.status,
            outcome,
            start.elapsed().as_secs_f64(),
        );
        result
    }

    async fn send_alive(&self, report: &LivenessReport, stats: &mut LoopStats) {
        match self.send(report).await {
            Ok(()) => {
                stats.alive_reports += 1;
                stats.consecutive_report_failures = 0;
                debug!(service_id = %self.service_id, tick = stats.ticks, "heartbeat sent");
            }
            Err(error) => {
                stats.report_failures += 1;
                stats.consecutive_report_failures += 1;
                if stats.consecutive_report_failures > self.policy.escalate_after {
                    error!(
                        service_id = %self.service_id,
                        tick = stats.ticks,
                        consecutive_failures = stats.consecutive_report_failures,
                        error = %error,
                        "registry keeps rejecting heartbeats, the entry will expire if this persists"
                    );
                } else {
                    warn!(
                        service_id = %self.service_id,
                        tick = stats.ticks,
                        consecutive_failures = stats.consecutive_report_failures,
                        error = %error,
                        "failed to send heartbeat, retrying on next tick"
                    );
                }
            }
        }
        metrics::emit_consecutive_report_failures(
            &self.service_id,
            stats.consecutive_report_failures,
        );
    }

    /// Best effort: the loop exits whether or not the registry got the message.
    async fn send_failing(&self, report: &LivenessReport) {
        if let Err(error) = self.send(report).await {
            warn!(
                service_id = %self.service_id,
                error = %error,
                "failed to report failing status, the registry ttl will expire the check"
            );
        }
    }

    fn advance(&self, phase: &PhaseTracker, next: LifecyclePhase) {
        if let Err(error) = phase.advance(next) {
            error!(
                service_id = %self.service_id,
                error = %error,
                "unexpected lifecycle transition"
            );
        }
    }
}
