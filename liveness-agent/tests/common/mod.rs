#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use liveness_agent::agent::{Agent, AgentBuilder};
use liveness_agent::probe::{LivenessProbe, ProbeResult};
use registry_common::registry::{RegistrationRecord, RegistryClient, RegistryError, TtlCheck};

pub const INTERVAL: Duration = Duration::from_secs(10);
pub const CALL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register,
    Alive,
    Failing(String),
    Deregister,
}

/// Registry fake that records every call in order.
#[derive(Default)]
pub struct RecordingRegistry {
    calls: Mutex<Vec<Call>>,
    reject_register: bool,
    /// Outcome of upcoming alive reports, `true` fails the call. Empty means succeed.
    alive_failures: Mutex<VecDeque<bool>>,
    hang_alive: bool,
    reject_deregister: bool,
}

impl RecordingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting_register() -> Arc<Self> {
        Arc::new(Self {
            reject_register: true,
            ..Default::default()
        })
    }

    pub fn rejecting_deregister() -> Arc<Self> {
        Arc::new(Self {
            reject_deregister: true,
            ..Default::default()
        })
    }

    pub fn hanging_alive() -> Arc<Self> {
        Arc::new(Self {
            hang_alive: true,
            ..Default::default()
        })
    }

    pub fn failing_alive(outcomes: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            alive_failures: Mutex::new(outcomes.iter().copied().collect()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RegistryClient for RecordingRegistry {
    async fn register(&self, _record: &RegistrationRecord) -> Result<(), RegistryError> {
        self.record(Call::Register);
        if self.reject_register {
            return Err(RegistryError::Rejected {
                status: 500,
                body: "registry unavailable".to_owned(),
            });
        }
        Ok(())
    }

    async fn report_alive(&self, _service_id: &str, _note: &str) -> Result<(), RegistryError> {
        self.record(Call::Alive);
        if self.hang_alive {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let fail = self.alive_failures.lock().unwrap().pop_front();
        if fail == Some(true) {
            return Err(RegistryError::Timeout(CALL_TIMEOUT));
        }
        Ok(())
    }

    async fn report_failing(&self, _service_id: &str, note: &str) -> Result<(), RegistryError> {
        self.record(Call::Failing(note.to_owned()));
        Ok(())
    }

    async fn deregister(&self, _service_id: &str) -> Result<(), RegistryError> {
        self.record(Call::Deregister);
        if self.reject_deregister {
            return Err(RegistryError::Rejected {
                status: 503,
                body: "registry unavailable".to_owned(),
            });
        }
        Ok(())
    }
}

/// Probe that plays back a script, then stays healthy.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeResult>>,
    evaluations: AtomicUsize,
    panic_on: Option<usize>,
    stall: bool,
}

impl ScriptedProbe {
    pub fn healthy() -> Arc<Self> {
        Self::script(&[])
    }

    pub fn script(results: &[ProbeResult]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.iter().cloned().collect()),
            evaluations: AtomicUsize::new(0),
            panic_on: None,
            stall: false,
        })
    }

    /// Panics on the given evaluation, 1-based.
    pub fn panicking_on(evaluation: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            evaluations: AtomicUsize::new(0),
            panic_on: Some(evaluation),
            stall: false,
        })
    }

    /// Never answers.
    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            evaluations: AtomicUsize::new(0),
            panic_on: None,
            stall: true,
        })
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self) -> ProbeResult {
        let evaluation = self.evaluations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on == Some(evaluation) {
            panic!("injected probe panic");
        }
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ProbeResult::Healthy)
    }
}

pub fn record() -> RegistrationRecord {
    let check = TtlCheck::new("Service TTL check", "test agent", Duration::from_secs(15));
    RegistrationRecord::new("svc-1", "svc", "127.0.0.1", check).port(8080)
}

pub fn agent_builder(
    registry: Arc<RecordingRegistry>,
    probe: Arc<ScriptedProbe>,
) -> AgentBuilder {
    Agent::builder(registry, record())
        .with_probe(probe)
        .with_heartbeat_interval(INTERVAL)
        .with_call_timeout(CALL_TIMEOUT)
}
