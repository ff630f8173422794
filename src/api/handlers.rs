//! # API Request Handlers
//!
//! Request handlers for the control-plane HTTP surface:
//!
//! - Agent endpoints: claim, checkin, credentials ack, evidence submit,
//!   telemetry submit, order results, update progress
//! - Admin endpoints: sites, claim codes, credentials, orders, evidence
//!   verification and repair, promotion review, releases, rollouts, rules
//!
//! Handlers are thin: parse, call a manager, map the error per the
//! response policy in [`super::responses`].

use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

use crate::checkin::{CheckinDispatcher, CheckinError, CheckinRequest, CheckinResponse};
use crate::crypto::credentials::CredentialMaster;
use crate::evidence::{EvidenceChain, EvidenceError, FrameworkMapper};
use crate::fleet::{FleetError, FleetManager, HealingTier};
use crate::learning::{
    LearningError, PromotionController, RuleBundlePublisher, RuleSyncService,
};
use crate::orders::{AckOutcome, NewOrder, OrderError, OrderKind, OrderManager};
use crate::rollout::{RolloutController, RolloutError, RolloutStage, UpdateStatus};
use crate::telemetry::{TelemetryError, TelemetryIngest, TelemetryRecord};

use super::middleware::AuthenticatedAppliance;
use super::responses::{ApiError, ApiResult};

// ============================================================================
// Shared State
// ============================================================================

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Fleet manager
    pub fleet: Arc<FleetManager>,
    /// Order registry
    pub orders: Arc<OrderManager>,
    /// Checkin dispatcher
    pub checkin: Arc<CheckinDispatcher>,
    /// Evidence chain service
    pub evidence: Arc<EvidenceChain>,
    /// Framework mapper and compliance scores
    pub mapper: Arc<FrameworkMapper>,
    /// Telemetry ingest
    pub telemetry: Arc<TelemetryIngest>,
    /// Promotion controller
    pub promotion: Arc<PromotionController>,
    /// Rule sync service
    pub rule_sync: Arc<RuleSyncService>,
    /// Rule bundle publisher
    pub bundles: Arc<RuleBundlePublisher>,
    /// Rollout controller
    pub rollout: Arc<RolloutController>,
    /// Credential master secret
    pub master: Arc<CredentialMaster>,
    /// Control-plane public key, hex, published to agents at claim
    pub control_plane_public_key: String,
    /// Database pool for view queries
    pub pool: sqlx::PgPool,
}

// ============================================================================
// Agent surface
// ============================================================================

/// Claim request: an appliance redeems its provisioning code
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    /// Claim code minted by the operator
    pub code: String,
    /// Appliance-chosen id
    pub appliance_id: String,
    /// Appliance's Ed25519 public key, hex
    pub public_key: String,
}

/// Claim response carrying the one-time secret handoff
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    /// Registered appliance id
    pub appliance_id: String,
    /// Site the appliance belongs to
    pub site_id: String,
    /// Checkin HMAC secret; delivered exactly once
    pub checkin_secret: String,
    /// Control-plane public key agents verify order signatures against
    pub control_plane_public_key: String,
}

/// `POST /v1/claim`: redeem a claim code (pre-auth bootstrap)
pub async fn claim_appliance(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<ClaimResponse>> {
    let appliance = state
        .fleet
        .redeem_claim_code(&req.code, &req.appliance_id, &req.public_key)
        .await
        .map_err(map_fleet_error)?;

    Ok(Json(ClaimResponse {
        appliance_id: appliance.appliance_id,
        site_id: appliance.site_id,
        checkin_secret: appliance.checkin_secret,
        control_plane_public_key: state.control_plane_public_key.clone(),
    }))
}

/// `POST /v1/checkin`: the per-cycle control surface
pub async fn checkin(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedAppliance>,
    Json(req): Json<CheckinRequest>,
) -> ApiResult<Json<CheckinResponse>> {
    if req.appliance_id != auth.0 {
        return Err(ApiError::unauthorized("appliance id mismatch"));
    }
    let response = state.checkin.dispatch(&req).await.map_err(map_checkin_error)?;
    Ok(Json(response))
}

/// Credentials ack body
#[derive(Debug, Deserialize)]
pub struct CredentialsAckRequest {
    /// Acknowledging appliance
    pub appliance_id: String,
    /// Version the appliance stored
    pub version: i32,
}

/// `POST /v1/checkin/credentials-ack`
pub async fn credentials_ack(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedAppliance>,
    Json(req): Json<CredentialsAckRequest>,
) -> ApiResult<Json<Value>> {
    if req.appliance_id != auth.0 {
        return Err(ApiError::unauthorized("appliance id mismatch"));
    }
    let advanced = state
        .checkin
        .credentials_ack(&req.appliance_id, req.version)
        .await
        .map_err(map_checkin_error)?;
    Ok(Json(json!({ "advanced": advanced })))
}

/// Evidence submit response per the wire contract
#[derive(Debug, Serialize)]
pub struct EvidenceSubmitResponse {
    /// Whether the bundle is in the chain
    pub accepted: bool,
    /// Assigned chain position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_position: Option<i64>,
    /// Chain hash at that position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_hash: Option<String>,
    /// Whether the agent signature verified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_valid: Option<bool>,
    /// Present only on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `POST /v1/evidence`: append a bundle to the site chain
pub async fn submit_evidence(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedAppliance>,
    Json(sub): Json<crate::evidence::BundleSubmission>,
) -> ApiResult<Json<EvidenceSubmitResponse>> {
    if sub.appliance_id != auth.0 {
        return Err(ApiError::unauthorized("appliance id mismatch"));
    }

    match state.evidence.submit(&sub).await {
        Ok(outcome) => Ok(Json(EvidenceSubmitResponse {
            accepted: true,
            chain_position: Some(outcome.chain_position),
            chain_hash: Some(outcome.chain_hash),
            signature_valid: Some(outcome.signature_valid),
            reason: None,
        })),
        Err(EvidenceError::UnknownSite(_)) => Ok(Json(EvidenceSubmitResponse {
            accepted: false,
            chain_position: None,
            chain_hash: None,
            signature_valid: None,
            reason: Some("unknown_site".to_string()),
        })),
        Err(EvidenceError::UnknownAppliance(_)) => Ok(Json(EvidenceSubmitResponse {
            accepted: false,
            chain_position: None,
            chain_hash: None,
            signature_valid: None,
            reason: Some("unknown_appliance".to_string()),
        })),
        Err(EvidenceError::IntegrityViolation { .. }) => Err(ApiError::invariant_for_agent()),
        Err(EvidenceError::Database(_)) => Err(ApiError::upstream("storage unavailable")),
        Err(EvidenceError::Calendar(_)) => Err(ApiError::internal()),
    }
}

/// `POST /v1/telemetry`: batch telemetry submit
pub async fn submit_telemetry(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedAppliance>,
    Json(records): Json<Vec<TelemetryRecord>>,
) -> ApiResult<Json<Value>> {
    if records.iter().any(|r| r.appliance_id != auth.0) {
        return Err(ApiError::unauthorized("appliance id mismatch"));
    }
    let stored = state
        .telemetry
        .ingest_batch(&records)
        .await
        .map_err(map_telemetry_error)?;
    Ok(Json(json!({ "stored": stored })))
}

/// Order acknowledge body
#[derive(Debug, Deserialize)]
pub struct OrderAckRequest {
    /// Order being acknowledged
    pub order_id: Uuid,
    /// Its nonce, echoed back
    pub nonce: Uuid,
    /// Acknowledging appliance
    pub appliance_id: String,
    /// `acknowledged` (default) or `executing`
    #[serde(default)]
    pub status: Option<String>,
}

/// `POST /v1/orders/ack`: agent confirms receipt or start of execution
pub async fn order_ack(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedAppliance>,
    Json(req): Json<OrderAckRequest>,
) -> ApiResult<Json<Value>> {
    if req.appliance_id != auth.0 {
        return Err(ApiError::unauthorized("appliance id mismatch"));
    }

    let outcome = match req.status.as_deref() {
        None | Some("acknowledged") => {
            state
                .orders
                .acknowledge(req.order_id, req.nonce, &req.appliance_id)
                .await
                .map_err(map_order_error)?
        }
        Some("executing") => {
            state
                .orders
                .mark_executing(req.order_id, req.nonce, &req.appliance_id)
                .await
                .map_err(map_order_error)?
        }
        Some(other) => return Err(ApiError::validation(format!("bad status {other}"))),
    };

    Ok(Json(json!({
        "applied": outcome == AckOutcome::Applied,
        "terminal": outcome == AckOutcome::AlreadyTerminal,
    })))
}

/// Order result body
#[derive(Debug, Deserialize)]
pub struct OrderResultRequest {
    /// Order being reported
    pub order_id: Uuid,
    /// Its nonce, echoed back
    pub nonce: Uuid,
    /// Reporting appliance
    pub appliance_id: String,
    /// `completed` or `failed`
    pub status: String,
    /// Result payload
    #[serde(default)]
    pub result: Option<Value>,
    /// Error message on failure
    #[serde(default)]
    pub error: Option<String>,
}

/// `POST /v1/orders/result`: agent reports a terminal order outcome
pub async fn order_result(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedAppliance>,
    Json(req): Json<OrderResultRequest>,
) -> ApiResult<Json<Value>> {
    if req.appliance_id != auth.0 {
        return Err(ApiError::unauthorized("appliance id mismatch"));
    }
    let success = match req.status.as_str() {
        "completed" => true,
        "failed" => false,
        other => return Err(ApiError::validation(format!("bad status {other}"))),
    };

    let outcome = state
        .orders
        .report_result(
            req.order_id,
            req.nonce,
            &req.appliance_id,
            success,
            req.result.clone(),
            req.error.clone(),
        )
        .await
        .map_err(map_order_error)?;

    // Replays of terminal orders and nonce mismatches drop silently; the
    // order stays terminal and downstream hooks never re-fire.
    if outcome == AckOutcome::Applied {
        if let Ok(order) = state.orders.get(req.order_id).await {
            state
                .rule_sync
                .handle_order_result(&order.command_type, &order.parameters, &req.appliance_id, success)
                .await
                .map_err(map_learning_error)?;
            state
                .rollout
                .handle_order_result(&order.command_type, &order.parameters, &req.appliance_id, success)
                .await
                .map_err(map_rollout_error)?;
        }
    }

    Ok(Json(json!({
        "applied": outcome == AckOutcome::Applied,
        "terminal": outcome == AckOutcome::AlreadyTerminal,
    })))
}

/// Update progress body
#[derive(Debug, Deserialize)]
pub struct UpdateProgressRequest {
    /// Rollout the appliance is assigned to
    pub rollout_id: Uuid,
    /// Reporting appliance
    pub appliance_id: String,
    /// New per-appliance status
    pub status: UpdateStatus,
    /// Failure detail
    #[serde(default)]
    pub error: Option<String>,
}

/// `POST /v1/updates/progress`: agent update state transitions
pub async fn update_progress(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedAppliance>,
    Json(req): Json<UpdateProgressRequest>,
) -> ApiResult<Json<Value>> {
    if req.appliance_id != auth.0 {
        return Err(ApiError::unauthorized("appliance id mismatch"));
    }
    state
        .rollout
        .report_progress(req.rollout_id, &req.appliance_id, req.status, req.error.as_deref())
        .await
        .map_err(map_rollout_error)?;
    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// Admin surface
// ============================================================================

/// Site creation body
#[derive(Debug, Deserialize)]
pub struct CreateSiteRequest {
    /// Site id
    pub site_id: String,
    /// Display name
    pub name: String,
    /// Owning organization
    #[serde(default)]
    pub org_id: Option<String>,
    /// Healing tier
    #[serde(default)]
    pub healing_tier: Option<HealingTier>,
}

/// `POST /v1/admin/sites`
pub async fn create_site(
    State(state): State<AppState>,
    Json(req): Json<CreateSiteRequest>,
) -> ApiResult<Json<crate::fleet::Site>> {
    let site = state
        .fleet
        .create_site(
            &req.site_id,
            &req.name,
            req.org_id.as_deref(),
            req.healing_tier.unwrap_or(HealingTier::Standard),
        )
        .await
        .map_err(map_fleet_error)?;
    Ok(Json(site))
}

/// `POST /v1/admin/sites/:site_id/claim-codes`
pub async fn create_claim_code(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let code = state
        .fleet
        .create_claim_code(&site_id)
        .await
        .map_err(map_fleet_error)?;
    Ok(Json(json!({ "code": code })))
}

/// Credential bump body
#[derive(Debug, Deserialize)]
pub struct BumpCredentialsRequest {
    /// New credential bundle, base64
    pub plaintext_b64: String,
}

/// `POST /v1/admin/sites/:site_id/credentials`
pub async fn bump_credentials(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(req): Json<BumpCredentialsRequest>,
) -> ApiResult<Json<Value>> {
    use base64::Engine;
    let plaintext = base64::engine::general_purpose::STANDARD
        .decode(&req.plaintext_b64)
        .map_err(|_| ApiError::validation("plaintext_b64 is not valid base64"))?;

    let version = state
        .fleet
        .bump_site_credentials(&site_id, &state.master, &plaintext)
        .await
        .map_err(map_fleet_error)?;
    Ok(Json(json!({ "version": version })))
}

/// Admin order creation body
#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    /// Order kind
    pub kind: OrderKind,
    /// Target appliance for non-fleet orders
    #[serde(default)]
    pub appliance_id: Option<String>,
    /// Command type
    #[serde(rename = "type")]
    pub command_type: String,
    /// Command parameters
    #[serde(default)]
    pub parameters: Value,
    /// Runbook for healing orders
    #[serde(default)]
    pub runbook_id: Option<String>,
    /// Version skip for fleet orders
    #[serde(default)]
    pub skip_version: Option<String>,
    /// TTL in seconds (default one hour)
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// `POST /v1/admin/orders`
pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<Json<crate::orders::Order>> {
    if req.kind != OrderKind::Fleet && req.appliance_id.is_none() {
        return Err(ApiError::validation("appliance_id required for non-fleet orders"));
    }

    let order = state
        .orders
        .create(NewOrder {
            kind: req.kind,
            appliance_id: req.appliance_id,
            site_id: None,
            command_type: req.command_type,
            parameters: req.parameters,
            runbook_id: req.runbook_id,
            skip_version: req.skip_version,
            dedup_key: None,
            ttl: Duration::seconds(req.ttl_seconds.unwrap_or(3600)),
            created_by: "admin".to_string(),
        })
        .await
        .map_err(map_order_error)?;
    Ok(Json(order))
}

/// `DELETE /v1/admin/orders/:order_id`: cancel while still pending
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state
        .orders
        .cancel(order_id, "admin")
        .await
        .map_err(map_order_error)?;
    Ok(Json(json!({ "cancelled": true })))
}

/// `GET /v1/admin/evidence/:site_id/verify`
pub async fn verify_chain(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let verification = state
        .evidence
        .verify_chain(&site_id)
        .await
        .map_err(map_evidence_error_admin)?;
    Ok(Json(json!({
        "length": verification.length,
        "valid": verification.is_valid(),
        "breaks": verification
            .breaks
            .iter()
            .map(|b| json!({ "position": b.position, "reason": b.reason }))
            .collect::<Vec<_>>(),
    })))
}

/// `POST /v1/admin/evidence/:site_id/repair`
pub async fn repair_chain(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let repaired = state
        .evidence
        .repair_chain(&site_id)
        .await
        .map_err(map_evidence_error_admin)?;
    Ok(Json(json!({ "repaired_rows": repaired })))
}

/// `GET /v1/admin/compliance/:appliance_id/:framework`
pub async fn get_compliance_score(
    State(state): State<AppState>,
    Path((appliance_id, framework)): Path<(String, String)>,
) -> ApiResult<Json<crate::evidence::mapping::ComplianceScore>> {
    if !framework.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ApiError::validation("invalid framework name"));
    }
    let score = state
        .mapper
        .refresh_compliance_score(&appliance_id, &framework)
        .await
        .map_err(map_evidence_error_admin)?;
    Ok(Json(score))
}

/// Candidate listing query
#[derive(Debug, Deserialize)]
pub struct CandidateQuery {
    /// Site whose candidates to list
    pub site_id: String,
}

/// `GET /v1/admin/candidates`
pub async fn list_candidates(
    State(state): State<AppState>,
    Query(query): Query<CandidateQuery>,
) -> ApiResult<Json<Vec<crate::learning::PromotionCandidate>>> {
    let candidates = state
        .promotion
        .pending_for_site(&query.site_id)
        .await
        .map_err(map_learning_error)?;
    Ok(Json(candidates))
}

/// `POST /v1/admin/candidates/emit/:site_id`
pub async fn emit_candidates(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Vec<crate::learning::PromotionCandidate>>> {
    let candidates = state
        .promotion
        .emit_candidates(&site_id)
        .await
        .map_err(map_learning_error)?;
    Ok(Json(candidates))
}

/// Review body naming the acting partner
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    /// Reviewing partner identity
    pub reviewed_by: String,
}

/// `POST /v1/admin/candidates/:id/approve`
pub async fn approve_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<Json<Value>> {
    let rule_id = state
        .promotion
        .approve(candidate_id, &req.reviewed_by)
        .await
        .map_err(map_learning_error)?;
    // New rules reach agents two ways: per-appliance sync orders and the
    // next published bundle
    state
        .rule_sync
        .deliver_pending()
        .await
        .map_err(map_learning_error)?;
    Ok(Json(json!({ "rule_id": rule_id })))
}

/// `POST /v1/admin/candidates/:id/reject`
pub async fn reject_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<Json<Value>> {
    state
        .promotion
        .reject(candidate_id, &req.reviewed_by)
        .await
        .map_err(map_learning_error)?;
    Ok(Json(json!({ "rejected": true })))
}

/// `POST /v1/admin/candidates/:id/forward`
pub async fn forward_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state
        .promotion
        .client_forward(candidate_id)
        .await
        .map_err(map_learning_error)?;
    Ok(Json(json!({ "forwarded": true })))
}

/// `POST /v1/admin/rules/:rule_id/revoke`
pub async fn revoke_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<Json<Value>> {
    state
        .promotion
        .revoke(&rule_id, &req.reviewed_by)
        .await
        .map_err(map_learning_error)?;
    let removals = state
        .rule_sync
        .deliver_revocations()
        .await
        .map_err(map_learning_error)?;
    Ok(Json(json!({ "revoked": true, "removal_orders": removals })))
}

/// `POST /v1/admin/rule-bundles/publish`
pub async fn publish_rule_bundles(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let (standard, full_coverage) = state
        .bundles
        .publish_all()
        .await
        .map_err(map_learning_error)?;
    Ok(Json(json!({
        "standard_version": standard,
        "full_coverage_version": full_coverage,
    })))
}

/// Release registration body
#[derive(Debug, Deserialize)]
pub struct CreateReleaseRequest {
    /// Semver version
    pub version: String,
    /// Object key in the releases bucket
    pub object_key: String,
    /// Image SHA-256
    pub sha256: String,
    /// Image size
    pub size_bytes: i64,
    /// Release notes
    #[serde(default)]
    pub notes: Option<String>,
}

/// `POST /v1/admin/releases`
pub async fn create_release(
    State(state): State<AppState>,
    Json(req): Json<CreateReleaseRequest>,
) -> ApiResult<Json<crate::rollout::UpdateRelease>> {
    let release = state
        .rollout
        .register_release(
            &req.version,
            &req.object_key,
            &req.sha256,
            req.size_bytes,
            req.notes.as_deref(),
        )
        .await
        .map_err(map_rollout_error)?;
    Ok(Json(release))
}

/// `POST /v1/admin/releases/:version/mark-latest`
pub async fn mark_latest_release(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .rollout
        .mark_latest(&version)
        .await
        .map_err(map_rollout_error)?;
    Ok(Json(json!({ "latest": version })))
}

/// Rollout creation body
#[derive(Debug, Deserialize)]
pub struct CreateRolloutRequest {
    /// Release version to deploy
    pub release_version: String,
    /// Campaign name
    pub name: String,
    /// Stage plan
    pub stages: Vec<RolloutStage>,
    /// Failure threshold percentage
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold_percent: f64,
    /// Whether threshold breaches roll back
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    /// Optional reboot window
    #[serde(default)]
    pub maintenance_window: Option<Value>,
    /// Optional target filter
    #[serde(default)]
    pub target_filter: Option<Value>,
}

fn default_failure_threshold() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

/// `POST /v1/admin/rollouts`
pub async fn create_rollout(
    State(state): State<AppState>,
    Json(req): Json<CreateRolloutRequest>,
) -> ApiResult<Json<crate::rollout::UpdateRollout>> {
    let rollout = state
        .rollout
        .start(
            &req.release_version,
            &req.name,
            &req.stages,
            req.failure_threshold_percent,
            req.auto_rollback,
            req.maintenance_window,
            req.target_filter,
        )
        .await
        .map_err(map_rollout_error)?;
    Ok(Json(rollout))
}

/// `POST /v1/admin/rollouts/:id/pause`
pub async fn pause_rollout(
    State(state): State<AppState>,
    Path(rollout_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.rollout.pause(rollout_id).await.map_err(map_rollout_error)?;
    Ok(Json(json!({ "paused": true })))
}

/// `POST /v1/admin/rollouts/:id/resume`
pub async fn resume_rollout(
    State(state): State<AppState>,
    Path(rollout_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.rollout.resume(rollout_id).await.map_err(map_rollout_error)?;
    Ok(Json(json!({ "resumed": true })))
}

/// `POST /v1/admin/rollouts/:id/cancel`
pub async fn cancel_rollout(
    State(state): State<AppState>,
    Path(rollout_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.rollout.cancel(rollout_id).await.map_err(map_rollout_error)?;
    Ok(Json(json!({ "cancelled": true })))
}

/// `GET /v1/admin/rollouts/:id/progress`: the operations counters view
pub async fn rollout_progress(
    State(state): State<AppState>,
    Path(rollout_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = sqlx::query(
        "SELECT status, current_stage, total_assigned, succeeded, failed,
                rolled_back, in_flight
         FROM rollout_progress WHERE rollout_id = $1",
    )
    .bind(rollout_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|_| ApiError::upstream("database unavailable"))?
    .ok_or_else(|| ApiError::not_found("unknown rollout"))?;

    Ok(Json(json!({
        "rollout_id": rollout_id,
        "status": row.get::<String, _>("status"),
        "current_stage": row.get::<i32, _>("current_stage"),
        "total_assigned": row.get::<i64, _>("total_assigned"),
        "succeeded": row.get::<i64, _>("succeeded"),
        "failed": row.get::<i64, _>("failed"),
        "rolled_back": row.get::<i64, _>("rolled_back"),
        "in_flight": row.get::<i64, _>("in_flight"),
    })))
}

/// Check mapping registration body
#[derive(Debug, Deserialize)]
pub struct CheckMappingRequest {
    /// Check type
    pub check_type: String,
    /// Framework name
    pub framework: String,
    /// Control id within the framework
    pub control_id: String,
}

/// `POST /v1/admin/check-mappings`
pub async fn add_check_mapping(
    State(state): State<AppState>,
    Json(req): Json<CheckMappingRequest>,
) -> ApiResult<Json<Value>> {
    state
        .mapper
        .add_mapping(&req.check_type, &req.framework, &req.control_id)
        .await
        .map_err(map_evidence_error_admin)?;
    Ok(Json(json!({ "ok": true })))
}

/// `GET /healthz`
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|_| ApiError::upstream("database unavailable"))?;
    Ok(Json(json!({ "status": "ok", "version": crate::VERSION })))
}

// ============================================================================
// Error mapping
// ============================================================================

fn map_fleet_error(err: FleetError) -> ApiError {
    match err {
        FleetError::UnknownSite(s) => ApiError::not_found(format!("unknown site {s}")),
        FleetError::UnknownAppliance(a) => ApiError::not_found(format!("unknown appliance {a}")),
        FleetError::InvalidClaimCode => ApiError::unauthorized("invalid claim code"),
        FleetError::Suspended(a) => ApiError::conflict(format!("appliance {a} suspended")),
        FleetError::AlreadyExists(id) => ApiError::conflict(format!("{id} already exists")),
        FleetError::Database(_) => ApiError::upstream("database unavailable"),
        FleetError::Crypto(_) => ApiError::internal(),
    }
}

fn map_checkin_error(err: CheckinError) -> ApiError {
    match err {
        CheckinError::UnknownAppliance(a) => ApiError::not_found(format!("unknown appliance {a}")),
        CheckinError::Suspended(a) => ApiError::conflict(format!("appliance {a} suspended")),
        CheckinError::Fleet(inner) => map_fleet_error(inner),
        CheckinError::Orders(inner) => map_order_error(inner),
        CheckinError::Crypto(_) => ApiError::internal(),
        CheckinError::Storage(_) => ApiError::upstream("object store unavailable"),
        CheckinError::Database(_) => ApiError::upstream("database unavailable"),
    }
}

fn map_order_error(err: OrderError) -> ApiError {
    match err {
        OrderError::UnknownOrder(id) => ApiError::not_found(format!("unknown order {id}")),
        OrderError::NotPending(id) => ApiError::conflict(format!("order {id} is not pending")),
        OrderError::Database(_) => ApiError::upstream("database unavailable"),
        OrderError::Crypto(_) => ApiError::internal(),
    }
}

fn map_telemetry_error(err: TelemetryError) -> ApiError {
    match err {
        TelemetryError::UnknownSite(_) | TelemetryError::UnknownAppliance(_) => {
            ApiError::invariant_for_agent()
        }
        TelemetryError::Database(_) => ApiError::upstream("database unavailable"),
    }
}

fn map_evidence_error_admin(err: EvidenceError) -> ApiError {
    match err {
        EvidenceError::UnknownSite(s) => ApiError::not_found(format!("unknown site {s}")),
        EvidenceError::UnknownAppliance(a) => {
            ApiError::not_found(format!("unknown appliance {a}"))
        }
        EvidenceError::IntegrityViolation { site_id, detail } => {
            ApiError::invariant(format!("site {site_id}: {detail}"))
        }
        EvidenceError::Database(_) => ApiError::upstream("database unavailable"),
        EvidenceError::Calendar(msg) => ApiError::upstream(msg),
    }
}

fn map_learning_error(err: LearningError) -> ApiError {
    match err {
        LearningError::UnknownCandidate(id) => {
            ApiError::not_found(format!("unknown candidate {id}"))
        }
        LearningError::UnknownRule(id) => ApiError::not_found(format!("unknown rule {id}")),
        LearningError::InvalidState { .. } => ApiError::conflict(err.to_string()),
        LearningError::NoRecommendedAction(_) => ApiError::conflict(err.to_string()),
        LearningError::Database(_) => ApiError::upstream("database unavailable"),
        LearningError::Serialization(_) => ApiError::internal(),
        LearningError::Orders(inner) => map_order_error(inner),
        LearningError::Storage(_) => ApiError::upstream("object store unavailable"),
        LearningError::Crypto(_) => ApiError::internal(),
    }
}

fn map_rollout_error(err: RolloutError) -> ApiError {
    match err {
        RolloutError::UnknownRelease(v) => ApiError::not_found(format!("unknown release {v}")),
        RolloutError::UnknownRollout(id) => ApiError::not_found(format!("unknown rollout {id}")),
        RolloutError::InvalidState { .. } => ApiError::conflict(err.to_string()),
        RolloutError::InvalidStages(msg) => ApiError::validation(msg),
        RolloutError::InvalidVersion(v) => ApiError::validation(format!("bad version {v}")),
        RolloutError::Database(_) => ApiError::upstream("database unavailable"),
        RolloutError::Orders(inner) => map_order_error(inner),
        RolloutError::Storage(_) => ApiError::upstream("object store unavailable"),
    }
}
