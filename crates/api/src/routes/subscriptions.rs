//! Subscription lifecycle routes

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vendera_billing::{
    BillingInterval, EnrollmentRequest, PaymentMethodDetails, Subscription,
};

use crate::error::ApiResult;
use crate::state::AppState;

/// Subscription representation returned by every lifecycle route
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub plan_id: String,
    pub billing_interval: &'static str,
    pub status: &'static str,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_billing_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub has_payment_method: bool,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        Self {
            status: sub.status_str(),
            cancel_at_period_end: sub.state.cancel_at_period_end(),
            billing_interval: sub.billing_interval.as_str(),
            has_payment_method: sub.payment_method_id.is_some(),
            id: sub.id,
            vendor_id: sub.vendor_id,
            plan_id: sub.plan_id,
            start_date: sub.start_date,
            end_date: sub.end_date,
            trial_end_date: sub.trial_end_date,
            next_billing_date: sub.next_billing_date,
            cancelled_at: sub.cancelled_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnrollBody {
    pub vendor_id: Uuid,
    pub plan_id: String,
    /// "monthly" or "yearly"
    pub billing_cycle: String,
    #[serde(default)]
    pub start_trial: bool,
    pub vendor_name: String,
    pub vendor_email: String,
    #[serde(default)]
    pub vendor_phone: Option<String>,
    #[serde(default)]
    pub payment_method_id: Option<String>,
}

/// POST /api/subscriptions
pub async fn enroll(
    State(state): State<AppState>,
    Json(body): Json<EnrollBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let interval = BillingInterval::parse(&body.billing_cycle).map_err(crate::error::ApiError::Billing)?;

    let sub = state
        .engine
        .subscriptions
        .enroll(
            EnrollmentRequest {
                vendor_id: body.vendor_id,
                plan_id: body.plan_id,
                billing_interval: interval,
                start_trial: body.start_trial,
                vendor_name: body.vendor_name,
                vendor_email: body.vendor_email,
                vendor_phone: body.vendor_phone,
                payment_method_id: body.payment_method_id,
            },
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok(Json(sub.into()))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanBody {
    pub new_plan_id: String,
    /// Provider reference for a charge the caller claims already happened;
    /// verified against the gateway before it is honored
    #[serde(default)]
    pub already_paid_reference: Option<String>,
}

/// POST /api/subscriptions/{id}/change-plan
pub async fn change_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ChangePlanBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let sub = state
        .engine
        .subscriptions
        .change_plan(
            id,
            &body.new_plan_id,
            body.already_paid_reference.as_deref(),
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(sub.into()))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub immediate: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/subscriptions/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let sub = state
        .engine
        .subscriptions
        .cancel(
            id,
            body.immediate,
            body.reason.as_deref(),
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(sub.into()))
}

/// POST /api/subscriptions/{id}/reactivate
pub async fn reactivate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let sub = state
        .engine
        .subscriptions
        .reactivate(id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(sub.into()))
}

#[derive(Debug, Deserialize)]
pub struct AttachPaymentMethodBody {
    pub intent_id: String,
    pub method_type: String,
    pub token: String,
}

/// POST /api/subscriptions/{id}/payment-method
pub async fn attach_payment_method(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AttachPaymentMethodBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let sub = state
        .engine
        .subscriptions
        .attach_payment_method(
            id,
            &body.intent_id,
            PaymentMethodDetails {
                method_type: body.method_type,
                token: body.token,
            },
        )
        .await?;
    Ok(Json(sub.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enroll_body_defaults_optional_fields() {
        let body: EnrollBody = serde_json::from_str(
            r#"{
                "vendor_id": "00000000-0000-0000-0000-000000000001",
                "plan_id": "featured",
                "billing_cycle": "monthly",
                "vendor_name": "Maria Santos Catering",
                "vendor_email": "maria@example.com"
            }"#,
        )
        .unwrap();
        assert!(!body.start_trial);
        assert!(body.vendor_phone.is_none());
        assert!(body.payment_method_id.is_none());
    }

    #[test]
    fn cancel_body_defaults_to_scheduled() {
        let body: CancelBody = serde_json::from_str("{}").unwrap();
        assert!(!body.immediate);
        assert!(body.reason.is_none());
    }
}
