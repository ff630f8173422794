//! # API Middleware
//!
//! Appliance authentication: every agent-surface request carries
//! `X-Appliance-Id` plus `X-Signature`, an HMAC-SHA256 of the raw body
//! keyed with the appliance's checkin secret issued at claim time. The
//! middleware buffers the body, verifies in constant time, and passes the
//! request through untouched.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use crate::fleet::FleetManager;

use super::responses::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// Largest agent request body accepted (matches the telemetry batch cap)
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// The appliance id the middleware authenticated, attached as a request
/// extension. Handlers compare it against the id claimed in the body so a
/// leaked secret for one appliance cannot speak for another.
#[derive(Debug, Clone)]
pub struct AuthenticatedAppliance(pub String);

/// Compute the hex HMAC-SHA256 signature for a request body
pub fn body_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature comparison
pub fn verify_body_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    match hex::decode(signature_hex) {
        Ok(sig) => mac.verify_slice(&sig).is_ok(),
        Err(_) => false,
    }
}

/// Authenticate an agent-surface request against its appliance secret
pub async fn appliance_auth_middleware(
    State(fleet): State<Arc<FleetManager>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();

    let appliance_id = parts
        .headers
        .get("x-appliance-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-Appliance-Id"))?
        .to_string();
    let signature = parts
        .headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-Signature"))?
        .to_string();

    let appliance = fleet
        .get_appliance(&appliance_id)
        .await
        .map_err(|_| ApiError::unauthorized("unknown appliance"))?;

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::validation("request body too large"))?;

    if !verify_body_signature(&appliance.checkin_secret, &bytes, &signature) {
        return Err(ApiError::unauthorized("bad request signature"));
    }

    parts.extensions.insert(AuthenticatedAppliance(appliance_id));
    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip() {
        let sig = body_signature("secret", b"{\"appliance_id\":\"ap-1\"}");
        assert!(verify_body_signature("secret", b"{\"appliance_id\":\"ap-1\"}", &sig));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let sig = body_signature("secret", b"body");
        assert!(!verify_body_signature("other", b"body", &sig));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let sig = body_signature("secret", b"body");
        assert!(!verify_body_signature("secret", b"body2", &sig));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        assert!(!verify_body_signature("secret", b"body", "zz-not-hex"));
    }
}
