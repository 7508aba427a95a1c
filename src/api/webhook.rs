// =============================================================================
// Webhook ingress — HMAC-signed intent signals
// =============================================================================
//
// `POST /webhook` is the only unauthenticated-by-bearer-token route; it is
// instead authenticated by an HMAC-SHA256 signature over the raw request
// body, the same signing primitive `broker::binance` uses against the
// exchange, applied in the opposite direction — callers sign a payload for
// us to verify rather than us signing one for them to trust.
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::pipeline::IncomingSignal;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-signal-signature";

fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

#[derive(Serialize)]
struct WebhookResponse {
    intent_id: String,
    status: String,
    reason: Option<String>,
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let secret = state.config.credentials().hmac_secret;
    if secret.is_empty() {
        warn!("webhook rejected: no signing secret configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "webhook signing not configured" })),
        )
            .into_response();
    }

    let signature = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(sig) => sig,
        None => {
            warn!("webhook rejected: missing signature header");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "missing signature" })),
            )
                .into_response();
        }
    };

    if !verify_signature(&secret, &body, signature) {
        warn!("webhook rejected: signature mismatch");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid signature" })),
        )
            .into_response();
    }

    let signal: IncomingSignal = match serde_json::from_slice(&body) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "webhook rejected: malformed payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("malformed payload: {e}") })),
            )
                .into_response();
        }
    };

    info!(symbol = %signal.symbol, signal_id = %signal.signal_id, "webhook signal accepted");
    let outcome = state.pipeline.process(signal).await;
    state.increment_version();

    Json(WebhookResponse {
        intent_id: outcome.intent_id,
        status: outcome.status.to_string(),
        reason: outcome.reason,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_signature_accepts_correctly_signed_body() {
        let secret = "test-secret";
        let body = b"{\"signal_id\":\"abc\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(secret, body, &sig));
    }

    #[test]
    fn verify_signature_rejects_tampered_body() {
        let secret = "test-secret";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"original");
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(!verify_signature(secret, b"tampered", &sig));
    }

    #[test]
    fn verify_signature_rejects_malformed_hex() {
        assert!(!verify_signature("secret", b"body", "not-hex"));
    }
}
