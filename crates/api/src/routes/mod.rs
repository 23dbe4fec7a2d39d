//! Route registration

pub mod admin;
pub mod health;
pub mod subscriptions;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use subscriptions::SubscriptionResponse;

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/subscriptions", post(subscriptions::enroll))
        .route(
            "/api/subscriptions/{id}/change-plan",
            post(subscriptions::change_plan),
        )
        .route("/api/subscriptions/{id}/cancel", post(subscriptions::cancel))
        .route(
            "/api/subscriptions/{id}/reactivate",
            post(subscriptions::reactivate),
        )
        .route(
            "/api/subscriptions/{id}/payment-method",
            post(subscriptions::attach_payment_method),
        )
        .route(
            "/api/admin/subscriptions/{id}/extend",
            post(admin::extend),
        )
        .route(
            "/api/admin/subscriptions/{id}/force-cancel",
            post(admin::force_cancel),
        )
        .route("/api/billing/run-sweep", post(admin::run_sweep))
        .route("/api/webhooks/payments", post(webhooks::payment_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
