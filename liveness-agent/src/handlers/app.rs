use axum::{extract::State, http::StatusCode, routing, Router};
use tokio::sync::watch;

use crate::phase::LifecyclePhase;

type PhaseState = watch::Receiver<LifecyclePhase>;

pub fn add_routes(router: Router, phase: PhaseState) -> Router {
    router.merge(
        Router::new()
            .route("/", routing::get(index))
            .route("/_readiness", routing::get(readiness))
            .route("/_liveness", routing::get(liveness))
            .with_state(phase),
    )
}

pub async fn index() -> &'static str {
    "liveness agent"
}

/// Ready while the registry entry exists and is being kept alive.
async fn readiness(State(phase): State<PhaseState>) -> (StatusCode, String) {
    let current = *phase.borrow();
    let status = if current.is_active() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, current.to_string())
}

/// Live until the agent has fully deregistered.
async fn liveness(State(phase): State<PhaseState>) -> (StatusCode, String) {
    let current = *phase.borrow();
    let status = if current == LifecyclePhase::Deregistered {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, current.to_string())
}
