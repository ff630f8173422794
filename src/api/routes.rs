//! # API Routes
//!
//! Router assembly for the control-plane HTTP surface.
//!
//! ## Route Structure
//!
//! - `/v1/claim` - Claim code redemption (pre-auth bootstrap)
//! - `/v1/checkin`, `/v1/evidence`, `/v1/telemetry`, `/v1/orders/result`,
//!   `/v1/updates/progress` - Agent surface, HMAC-authenticated
//! - `/v1/admin/*` - Operator and partner surface (deployed behind the
//!   operator proxy, which terminates authentication)
//! - `/healthz` - Liveness

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::middleware::appliance_auth_middleware;

/// Build the complete application router
pub fn create_router(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route("/v1/checkin", post(checkin))
        .route("/v1/checkin/credentials-ack", post(credentials_ack))
        .route("/v1/evidence", post(submit_evidence))
        .route("/v1/telemetry", post(submit_telemetry))
        .route("/v1/orders/ack", post(order_ack))
        .route("/v1/orders/result", post(order_result))
        .route("/v1/updates/progress", post(update_progress))
        .layer(from_fn_with_state(
            Arc::clone(&state.fleet),
            appliance_auth_middleware,
        ));

    let admin_routes = Router::new()
        .route("/v1/admin/sites", post(create_site))
        .route("/v1/admin/sites/:site_id/claim-codes", post(create_claim_code))
        .route("/v1/admin/sites/:site_id/credentials", post(bump_credentials))
        .route("/v1/admin/orders", post(create_order))
        .route("/v1/admin/orders/:order_id", delete(cancel_order))
        .route("/v1/admin/evidence/:site_id/verify", get(verify_chain))
        .route("/v1/admin/evidence/:site_id/repair", post(repair_chain))
        .route(
            "/v1/admin/compliance/:appliance_id/:framework",
            get(get_compliance_score),
        )
        .route("/v1/admin/check-mappings", post(add_check_mapping))
        .route("/v1/admin/candidates", get(list_candidates))
        .route("/v1/admin/candidates/emit/:site_id", post(emit_candidates))
        .route("/v1/admin/candidates/:id/approve", post(approve_candidate))
        .route("/v1/admin/candidates/:id/reject", post(reject_candidate))
        .route("/v1/admin/candidates/:id/forward", post(forward_candidate))
        .route("/v1/admin/rules/:rule_id/revoke", post(revoke_rule))
        .route("/v1/admin/rule-bundles/publish", post(publish_rule_bundles))
        .route("/v1/admin/releases", post(create_release))
        .route(
            "/v1/admin/releases/:version/mark-latest",
            post(mark_latest_release),
        )
        .route("/v1/admin/rollouts", post(create_rollout))
        .route("/v1/admin/rollouts/:id/pause", post(pause_rollout))
        .route("/v1/admin/rollouts/:id/resume", post(resume_rollout))
        .route("/v1/admin/rollouts/:id/cancel", post(cancel_rollout))
        .route("/v1/admin/rollouts/:id/progress", get(rollout_progress));

    Router::new()
        .route("/v1/claim", post(claim_appliance))
        .route("/healthz", get(health))
        .merge(agent_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
