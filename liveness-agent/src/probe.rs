//! Local self-checks evaluated on every heartbeat.
//!
//! A probe answers "is this process healthy right now?" without touching the
//! registry. Probes must be cheap and must never hang the liveness loop: wrap
//! anything that can stall in a [`TimeoutProbe`]. Errors while probing are
//! reported as unhealthy, never propagated.

use std::sync::Arc;
use std::time;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy,
    /// Carries a human readable reason, forwarded to the registry as the check note.
    Unhealthy(String),
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> ProbeResult;
}

#[async_trait]
impl<P: LivenessProbe + ?Sized> LivenessProbe for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn probe(&self) -> ProbeResult {
        (**self).probe().await
    }
}

/// Healthy as long as the watched process has not terminated. Defaults to the
/// current process.
pub struct ProcessProbe {
    pid: u32,
}

impl ProcessProbe {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
        }
    }

    pub fn for_pid(pid: u32) -> Self {
        Self { pid }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::current()
    }
}

#[cfg(target_os = "linux")]
async fn process_state(pid: u32) -> std::io::Result<char> {
    let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await?;
    // The command name is wrapped in parens and may itself contain spaces or
    // parens, the state is the first field after the last ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed /proc stat line")
        })
}

#[cfg(target_os = "linux")]
async fn check_process(pid: u32) -> ProbeResult {
    match process_state(pid).await {
        Ok(state @ ('Z' | 'X' | 'x')) => {
            ProbeResult::Unhealthy(format!("process {} has terminated (state {})", pid, state))
        }
        Ok(_) => ProbeResult::Healthy,
        Err(error) => ProbeResult::Unhealthy(format!("failed to query process {}: {}", pid, error)),
    }
}

#[cfg(not(target_os = "linux"))]
async fn check_process(pid: u32) -> ProbeResult {
    // Without procfs we can only vouch for ourselves.
    if pid == std::process::id() {
        ProbeResult::Healthy
    } else {
        ProbeResult::Unhealthy(format!("cannot observe process {} on this platform", pid))
    }
}

#[async_trait]
impl LivenessProbe for ProcessProbe {
    fn name(&self) -> &str {
        "process"
    }

    async fn probe(&self) -> ProbeResult {
        check_process(self.pid).await
    }
}

/// Bounds an inner probe: a probe that does not answer in time is unhealthy.
pub struct TimeoutProbe<P> {
    inner: P,
    timeout: time::Duration,
}

impl<P: LivenessProbe> TimeoutProbe<P> {
    pub fn new(inner: P, timeout: time::Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<P: LivenessProbe> LivenessProbe for TimeoutProbe<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn probe(&self) -> ProbeResult {
        match tokio::time::timeout(self.timeout, self.inner.probe()).await {
            Ok(result) => result,
            Err(_) => ProbeResult::Unhealthy(format!(
                "probe {} did not answer within {:?}",
                self.inner.name(),
                self.timeout
            )),
        }
    }
}

/// Healthy only if every inner probe is healthy. Probes run in order and the
/// first failure wins. An empty set is unhealthy.
pub struct AllProbes {
    probes: Vec<Box<dyn LivenessProbe>>,
}

impl AllProbes {
    pub fn new() -> Self {
        Self { probes: Vec::new() }
    }

    pub fn with(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }
}

impl Default for AllProbes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for AllProbes {
    fn name(&self) -> &str {
        "all"
    }

    async fn probe(&self) -> ProbeResult {
        if self.probes.is_empty() {
            return ProbeResult::Unhealthy("no probes configured".to_owned());
        }

        for probe in &self.probes {
            if let ProbeResult::Unhealthy(reason) = probe.probe().await {
                return ProbeResult::Unhealthy(format!("{}: {}", probe.name(), reason));
            }
        }
        ProbeResult::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ProbeResult);

    #[async_trait]
    impl LivenessProbe for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn probe(&self) -> ProbeResult {
            self.0.clone()
        }
    }

    struct Stuck;

    #[async_trait]
    impl LivenessProbe for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn probe(&self) -> ProbeResult {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn current_process_is_healthy() {
        assert_eq!(ProcessProbe::current().probe().await, ProbeResult::Healthy);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn missing_process_fails_closed() {
        let result = ProcessProbe::for_pid(u32::MAX).probe().await;
        assert!(!result.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_probe_times_out_unhealthy() {
        let probe = TimeoutProbe::new(Stuck, time::Duration::from_secs(1));
        match probe.probe().await {
            ProbeResult::Unhealthy(reason) => assert!(reason.contains("stuck")),
            ProbeResult::Healthy => panic!("stalled probe reported healthy"),
        }
    }

    #[tokio::test]
    async fn all_probes_reports_first_failure() {
        let probe = AllProbes::new()
            .with(Fixed(ProbeResult::Healthy))
            .with(Fixed(ProbeResult::Unhealthy("disk full".to_owned())));
        assert_eq!(
            probe.probe().await,
            ProbeResult::Unhealthy("fixed: disk full".to_owned())
        );

        let healthy = AllProbes::new().with(Fixed(ProbeResult::Healthy));
        assert!(healthy.probe().await.is_healthy());
    }

    #[tokio::test]
    async fn empty_probe_set_is_unhealthy() {
        assert!(!AllProbes::new().probe().await.is_healthy());
    }
}
