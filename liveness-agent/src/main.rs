//! Register this host with the service registry and keep its TTL check alive.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use liveness_agent::agent::Agent;
use liveness_agent::config::Config;
use liveness_agent::handlers;
use liveness_agent::heartbeat::StopCause;
use liveness_agent::net;
use liveness_agent::probe::ProcessProbe;
use liveness_agent::signals;
use registry_common::consul::ConsulClient;
use registry_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env()?;

    let address = net::advertise_address(config.advertise_address.as_deref());
    let record = config.registration_record(&address);
    info!(
        service_id = %record.service_id,
        registry = %config.registry_url,
        %address,
        "starting liveness agent"
    );

    let registry = ConsulClient::new(
        &config.registry_url,
        config.registry_timeout.0,
        config.registry_token.as_deref(),
    )?;

    let agent = Agent::builder(Arc::new(registry), record)
        .with_probe(Arc::new(ProcessProbe::current()))
        .with_probe_timeout(config.probe_timeout.0)
        .with_heartbeat_interval(config.heartbeat_interval.0)
        .with_call_timeout(config.registry_timeout.0)
        .with_report_failure_policy(config.report_failure_policy())
        .build()?;

    let shutdown = CancellationToken::new();
    let _signal_task = signals::cancel_on_shutdown_signal(shutdown.clone());

    let recorder_handle = setup_metrics_recorder()?;
    let router = setup_metrics_routes(
        handlers::add_routes(axum::Router::new(), agent.phase()),
        recorder_handle,
    );
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    let http_server = tokio::spawn(async move {
        serve(router, &bind, async move { server_shutdown.cancelled().await }).await
    });

    let result = agent.run(shutdown.clone()).await;

    // Whatever stopped the agent, stop serving probes too.
    shutdown.cancel();
    match http_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("status server failed with: {}", e),
        Err(e) => error!("status server task failed with: {}", e),
    }

    let exit = result?;
    info!(
        ticks = exit.stats.ticks,
        alive_reports = exit.stats.alive_reports,
        report_failures = exit.stats.report_failures,
        deregistration = ?exit.deregistration,
        "exiting"
    );

    match exit.cause {
        StopCause::Cancelled | StopCause::Released => Ok(()),
        StopCause::ProbeUnhealthy(reason) => Err(eyre!("liveness probe failed: {}", reason)),
    }
}
