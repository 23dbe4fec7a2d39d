//! Payment gateway webhook endpoint

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use time::OffsetDateTime;

use crate::state::AppState;

/// POST /api/webhooks/payments
///
/// Signature failures get a 400 so a misconfigured gateway surfaces fast;
/// every verified event is acknowledged with a 2xx, including unknown event
/// types and unmatched subscriptions, so the gateway never redelivers
/// forever.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(sig_header) = headers.get("webhook-signature") else {
        tracing::warn!("Missing webhook-signature header");
        return Err(StatusCode::BAD_REQUEST);
    };
    let Ok(signature) = sig_header.to_str() else {
        tracing::warn!("Invalid webhook-signature header encoding");
        return Err(StatusCode::BAD_REQUEST);
    };
    let Ok(payload) = std::str::from_utf8(&body) else {
        tracing::warn!("Webhook payload is not valid UTF-8");
        return Err(StatusCode::BAD_REQUEST);
    };

    let now = OffsetDateTime::now_utc();
    let event = state
        .engine
        .webhooks
        .verify_event(payload, signature, now)
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    match state.engine.webhooks.handle_event(event, now).await {
        Ok(disposition) => Ok(Json(serde_json::json!({
            "received": true,
            "disposition": disposition,
        }))),
        Err(e) => {
            // Storage-level trouble; a retry from the gateway is safe
            // because reconciliation is idempotent.
            tracing::error!(error = %e, "Webhook reconciliation failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
