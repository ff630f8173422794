//! # HTTP API
//!
//! The control plane's HTTP surface: the agent endpoints (checkin,
//! evidence, telemetry, order results, update progress), the claim
//! bootstrap, and the operator/partner admin endpoints.

pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod routes;

pub use handlers::AppState;
pub use responses::{ApiError, ApiResult};
pub use routes::create_router;
