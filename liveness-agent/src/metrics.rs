use registry_common::registry::ReportStatus;

use crate::phase::LifecyclePhase;

pub(crate) const METRIC_PHASE: &str = "liveness_agent_phase";
pub(crate) const METRIC_REGISTRATION: &str = "liveness_agent_registration_total";
pub(crate) const METRIC_DEREGISTRATION: &str = "liveness_agent_deregistration_total";
pub(crate) const METRIC_HEARTBEAT: &str = "liveness_agent_heartbeat_total";
pub(crate) const METRIC_HEARTBEAT_DURATION: &str = "liveness_agent_heartbeat_duration_seconds";
pub(crate) const METRIC_CONSECUTIVE_REPORT_FAILURES: &str =
    "liveness_agent_consecutive_report_failures";
pub(crate) const METRIC_PROBE_UNHEALTHY: &str = "liveness_agent_probe_unhealthy_total";

pub(crate) fn emit_phase(service_id: &str, phase: LifecyclePhase) {
    metrics::gauge!(METRIC_PHASE, "service_id" => service_id.to_string())
        .set(f64::from(phase.ordinal()));
}

pub(crate) fn emit_registration(service_id: &str, result: &str) {
    metrics::counter!(
        METRIC_REGISTRATION,
        "service_id" => service_id.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_deregistration(service_id: &str, result: &str) {
    metrics::counter!(
        METRIC_DEREGISTRATION,
        "service_id" => service_id.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_heartbeat(
    service_id: &str,
    status: ReportStatus,
    result: &str,
    duration_secs: f64,
) {
    metrics::counter!(
        METRIC_HEARTBEAT,
        "service_id" => service_id.to_string(),
        "status" => status.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
    metrics::histogram!(
        METRIC_HEARTBEAT_DURATION,
        "service_id" => service_id.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_consecutive_report_failures(service_id: &str, count: u32) {
    metrics::gauge!(
        METRIC_CONSECUTIVE_REPORT_FAILURES,
        "service_id" => service_id.to_string()
    )
    .set(f64::from(count));
}

pub(crate) fn emit_probe_unhealthy(service_id: &str, probe: &str) {
    metrics::counter!(
        METRIC_PROBE_UNHEALTHY,
        "service_id" => service_id.to_string(),
        "probe" => probe.to_string()
    )
    .increment(1);
}
