//! Ownership of the registry entry: register on start, deregister exactly once on stop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use registry_common::registry::{RegistrationRecord, RegistryClient, RegistryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::metrics;
use crate::phase::{LifecyclePhase, PhaseTracker};

/// Run a registry call, turning an overrun of `timeout` into [`RegistryError::Timeout`].
pub(crate) async fn bounded<F>(timeout: time::Duration, call: F) -> Result<(), RegistryError>
where
    F: Future<Output = Result<(), RegistryError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(RegistryError::Timeout(timeout)))
}

/// Result of a deregistration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    /// The registry confirmed the entry is gone.
    Completed,
    /// The registry could not be told; its TTL expiry will reap the entry.
    Failed,
    /// Nothing to do: never registered, or another stop path already deregistered.
    Skipped,
}

struct RegistrationInner {
    registry: Arc<dyn RegistryClient>,
    record: RegistrationRecord,
    call_timeout: time::Duration,
    phase: PhaseTracker,
    registered: AtomicBool,
    deregister_claimed: AtomicBool,
    /// Cancelled as soon as deregistration is claimed, heartbeats stop here.
    released: CancellationToken,
}

impl RegistrationInner {
    /// Only the first caller gets through, every other stop path is a no-op.
    async fn deregister_once(&self) -> Deregistration {
        if self.deregister_claimed.swap(true, Ordering::SeqCst) {
            debug!(service_id = %self.record.service_id, "deregistration already attempted");
            return Deregistration::Skipped;
        }
        self.released.cancel();

        if self.phase.current().is_active() {
            self.advance(LifecyclePhase::Stopping);
        }

        let service_id = &self.record.service_id;
        let result = bounded(self.call_timeout, self.registry.deregister(service_id)).await;
        let outcome = match result {
            Ok(()) => {
                info!(%service_id, "deregistered from registry");
                metrics::emit_deregistration(service_id, "completed");
                Deregistration::Completed
            }
            Err(error) => {
                warn!(
                    %service_id,
                    error = %error,
                    "failed to deregister, leaving the entry to the registry ttl"
                );
                metrics::emit_deregistration(service_id, error.kind());
                Deregistration::Failed
            }
        };

        if self.phase.current() == LifecyclePhase::Stopping {
            self.advance(LifecyclePhase::Deregistered);
        }
        outcome
    }

    fn advance(&self, next: LifecyclePhase) {
        if let Err(error) = self.phase.advance(next) {
            error!(
                service_id = %self.record.service_id,
                error = %error,
                "unexpected lifecycle transition"
            );
        }
    }
}

/// Registers the agent's [`RegistrationRecord`] and guarantees a single
/// deregistration attempt, whichever stop path runs first.
pub struct RegistrationManager {
    inner: Arc<RegistrationInner>,
}

impl RegistrationManager {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        record: RegistrationRecord,
        call_timeout: time::Duration,
        phase: PhaseTracker,
    ) -> Self {
        Self {
            inner: Arc::new(RegistrationInner {
                registry,
                record,
                call_timeout,
                phase,
                registered: AtomicBool::new(false),
                deregister_claimed: AtomicBool::new(false),
                released: CancellationToken::new(),
            }),
        }
    }

    pub fn record(&self) -> &RegistrationRecord {
        &self.inner.record
    }

    /// Create the registry entry. Must succeed before any heartbeat is sent, the
    /// returned guard is what the liveness loop requires to run.
    ///
    /// A failure is fatal for startup and is returned as-is. When the failure is
    /// ambiguous (timeout, broken connection) the registry may still have
    /// accepted the entry, so one best-effort deregistration is issued first.
    pub async fn register(&self) -> Result<RegistrationGuard, AgentError> {
        let inner = &self.inner;
        if inner.phase.current() != LifecyclePhase::NotRegistered
            || inner.deregister_claimed.load(Ordering::SeqCst)
        {
            return Err(AgentError::AlreadyStarted);
        }

        let record = &inner.record;
        match bounded(inner.call_timeout, inner.registry.register(record)).await {
            Ok(()) => {
                inner.registered.store(true, Ordering::SeqCst);
                inner.phase.advance(LifecyclePhase::Registered)?;
                info!(
                    service_id = %record.service_id,
                    name = %record.name,
                    address = %record.address,
                    port = ?record.port,
                    ttl_secs = record.check.ttl.as_secs_f64(),
                    "registered with registry"
                );
                metrics::emit_registration(&record.service_id, "registered");
                Ok(RegistrationGuard {
                    inner: Some(inner.clone()),
                })
            }
            Err(error) => {
                error!(
                    service_id = %record.service_id,
                    error = %error,
                    "failed to register with registry"
                );
                metrics::emit_registration(&record.service_id, error.kind());
                if error.is_ambiguous() {
                    inner.deregister_once().await;
                }
                Err(AgentError::StartupRegistration(error))
            }
        }
    }

    /// Idempotent deregistration. Safe to call when registration never completed
    /// or was already removed; never fails, failures are logged.
    pub async fn deregister(&self) -> Deregistration {
        if !self.inner.registered.load(Ordering::SeqCst) {
            debug!(
                service_id = %self.inner.record.service_id,
                "not registered, skipping deregistration"
            );
            return Deregistration::Skipped;
        }
        self.inner.deregister_once().await
    }
}

/// Proof that the registry entry exists. [`release`](RegistrationGuard::release)
/// deregisters; dropping an unreleased guard (e.g. the owning future was
/// aborted) spawns the deregistration on the current runtime instead.
pub struct RegistrationGuard {
    inner: Option<Arc<RegistrationInner>>,
}

impl RegistrationGuard {
    pub fn service_id(&self) -> &str {
        self.inner
            .as_ref()
            .map(|inner| inner.record.service_id.as_str())
            .unwrap_or_default()
    }

    /// Resolves once deregistration has started from any path. A released
    /// guard returns an already-cancelled token.
    pub fn released(&self) -> CancellationToken {
        match &self.inner {
            Some(inner) => inner.released.clone(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    pub async fn release(mut self) -> Deregistration {
        match self.inner.take() {
            Some(inner) => inner.deregister_once().await,
            None => Deregistration::Skipped,
        }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if inner.deregister_claimed.load(Ordering::SeqCst) {
            return;
        }
        // Without a runtime there is nothing left to drive the request: the
        // registry ttl expiry takes over.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            drop(handle.spawn(async move {
                inner.deregister_once().await;
            }));
        }
    }
}
