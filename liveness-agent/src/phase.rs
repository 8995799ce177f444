//! Lifecycle phase of the agent's registry entry.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::AgentError;
use crate::metrics;

/// Where the agent is in its registration, reporting and teardown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    NotRegistered,
    Registered,
    Reporting,
    Stopping,
    Deregistered,
}

impl LifecyclePhase {
    /// The only edges the lifecycle may take. `Deregistered` is terminal.
    pub fn can_transition_to(self, next: LifecyclePhase) -> bool {
        use LifecyclePhase as P;
        matches!(
            (self, next),
            (P::NotRegistered, P::Registered)
                | (P::Registered, P::Reporting)
                | (P::Reporting, P::Reporting)
                | (P::Registered, P::Stopping)
                | (P::Reporting, P::Stopping)
                | (P::Stopping, P::Deregistered)
        )
    }

    /// True while the registry entry is expected to exist and be kept alive.
    pub fn is_active(self) -> bool {
        matches!(self, LifecyclePhase::Registered | LifecyclePhase::Reporting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::NotRegistered => "not_registered",
            LifecyclePhase::Registered => "registered",
            LifecyclePhase::Reporting => "reporting",
            LifecyclePhase::Stopping => "stopping",
            LifecyclePhase::Deregistered => "deregistered",
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            LifecyclePhase::NotRegistered => 0,
            LifecyclePhase::Registered => 1,
            LifecyclePhase::Reporting => 2,
            LifecyclePhase::Stopping => 3,
            LifecyclePhase::Deregistered => 4,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single writer for the lifecycle phase. Clones share the same state; observers
/// only get read access through [`subscribe`](PhaseTracker::subscribe).
#[derive(Clone)]
pub struct PhaseTracker {
    tx: Arc<watch::Sender<LifecyclePhase>>,
    service_id: Arc<str>,
}

impl PhaseTracker {
    pub fn new(service_id: &str) -> Self {
        let (tx, _) = watch::channel(LifecyclePhase::NotRegistered);
        Self {
            tx: Arc::new(tx),
            service_id: Arc::from(service_id),
        }
    }

    pub fn current(&self) -> LifecyclePhase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting any edge not allowed by [`LifecyclePhase::can_transition_to`].
    pub fn advance(&self, next: LifecyclePhase) -> Result<(), AgentError> {
        let mut result = Ok(());
        let service_id = &*self.service_id;
        self.tx.send_if_modified(|phase| {
            let from = *phase;
            if !from.can_transition_to(next) {
                result = Err(AgentError::InvalidTransition { from, to: next });
                return false;
            }
            *phase = next;
            if from != next {
                debug!(%service_id, %from, to = %next, "lifecycle phase changed");
                metrics::emit_phase(service_id, next);
            }
            from != next
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecyclePhase as P;

    #[test]
    fn documented_edges_only() {
        assert!(P::NotRegistered.can_transition_to(P::Registered));
        assert!(P::Reporting.can_transition_to(P::Reporting));
        assert!(P::Registered.can_transition_to(P::Stopping));
        assert!(P::Stopping.can_transition_to(P::Deregistered));

        assert!(!P::NotRegistered.can_transition_to(P::Reporting));
        assert!(!P::Registered.can_transition_to(P::Deregistered));
        assert!(!P::Stopping.can_transition_to(P::Reporting));
        for next in [
            P::NotRegistered,
            P::Registered,
            P::Reporting,
            P::Stopping,
            P::Deregistered,
        ] {
            assert!(!P::Deregistered.can_transition_to(next));
        }
    }

    #[tokio::test]
    async fn tracker_walks_the_full_lifecycle() {
        let tracker = PhaseTracker::new("svc-1");
        let mut rx = tracker.subscribe();
        assert_eq!(tracker.current(), P::NotRegistered);

        tracker.advance(P::Registered).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), P::Registered);

        tracker.advance(P::Reporting).unwrap();
        tracker.advance(P::Reporting).unwrap();
        tracker.advance(P::Stopping).unwrap();
        tracker.advance(P::Deregistered).unwrap();
        assert_eq!(tracker.current(), P::Deregistered);
        assert_eq!(*rx.borrow(), P::Deregistered);
    }

    #[test]
    fn rejected_edge_leaves_phase_untouched() {
        let tracker = PhaseTracker::new("svc-1");
        let err = tracker.advance(P::Reporting).unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidTransition {
                from: P::NotRegistered,
                to: P::Reporting
            }
        ));
        assert_eq!(tracker.current(), P::NotRegistered);
    }

    /// Keeps the keys of every gauge registered through it.
    #[derive(Default)]
    struct GaugeKeys(std::sync::Mutex<Vec<::metrics::Key>>);

    impl ::metrics::Recorder for GaugeKeys {
        fn describe_counter(
            &self,
            _: ::metrics::KeyName,
            _: Option<::metrics::Unit>,
            _: ::metrics::SharedString,
        ) {
        }

        fn describe_gauge(
            &self,
            _: ::metrics::KeyName,
            _: Option<::metrics::Unit>,
            _: ::metrics::SharedString,
        ) {
        }

        fn describe_histogram(
            &self,
            _: ::metrics::KeyName,
            _: Option<::metrics::Unit>,
            _: ::metrics::SharedString,
        ) {
        }

        fn register_counter(
            &self,
            _: &::metrics::Key,
            _: &::metrics::Metadata<'_>,
        ) -> ::metrics::Counter {
            ::metrics::Counter::noop()
        }

        fn register_gauge(
            &self,
            key: &::metrics::Key,
            _: &::metrics::Metadata<'_>,
        ) -> ::metrics::Gauge {
            self.0.lock().unwrap().push(key.clone());
            ::metrics::Gauge::noop()
        }

        fn register_histogram(
            &self,
            _: &::metrics::Key,
            _: &::metrics::Metadata<'_>,
        ) -> ::metrics::Histogram {
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn phase_gauge_is_labelled_with_the_service() {
        let recorder = GaugeKeys::default();
        ::metrics::with_local_recorder(&recorder, || {
            PhaseTracker::new("billing-1")
                .advance(P::Registered)
                .unwrap();
        });

        let keys = recorder.0.lock().unwrap();
        let key = keys
            .iter()
            .find(|key| key.name() == "liveness_agent_phase")
            .expect("phase gauge was not emitted");
        assert!(key
            .labels()
            .any(|label| label.key() == "service_id" && label.value() == "billing-1"));
    }
}
