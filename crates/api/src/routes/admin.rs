//! Administrative routes: extensions, force-cancel, sweep trigger

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;
use vendera_billing::{BillingError, SweepSummary};

use crate::error::{ApiError, ApiResult};
use crate::routes::subscriptions::SubscriptionResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExtendBody {
    pub days: u32,
}

/// POST /api/admin/subscriptions/{id}/extend
pub async fn extend(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExtendBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let sub = state.engine.subscriptions.admin_extend(id, body.days).await?;
    Ok(Json(sub.into()))
}

#[derive(Debug, Deserialize)]
pub struct ForceCancelBody {
    pub reason: String,
}

/// POST /api/admin/subscriptions/{id}/force-cancel
pub async fn force_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ForceCancelBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let sub = state
        .engine
        .subscriptions
        .admin_force_cancel(id, &body.reason, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(sub.into()))
}

/// POST /api/billing/run-sweep
///
/// Triggers a recurring billing sweep plus pending-cancellation expiry.
/// Guarded by the `x-sweep-secret` header; the engine re-checks the secret
/// in constant time.
pub async fn run_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SweepSummary>> {
    let secret = headers
        .get("x-sweep-secret")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Billing(BillingError::Unauthorized))?;

    let now = OffsetDateTime::now_utc();
    let summary = state.engine.sweep.run_sweep(secret, now).await?;
    state
        .engine
        .subscriptions
        .expire_pending_cancellations(now)
        .await?;

    Ok(Json(summary))
}
