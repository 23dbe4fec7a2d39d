//! Transaction ledger
//!
//! Append-only record of every money movement and administrative event tied
//! to a subscription. Entries are never updated or deleted; the ledger also
//! serves as the durable idempotency record for sweeps and webhook replays.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Cause of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    TrialStart,
    InitialPayment,
    RecurringPayment,
    PlanChange,
    AdminExtension,
    AdminForceCancel,
    Cancellation,
    ScheduledCancellation,
    Reactivation,
    WebhookPaymentSuccess,
    WebhookPaymentFailed,
    EwalletPayment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::TrialStart => "trial_start",
            TransactionType::InitialPayment => "initial_payment",
            TransactionType::RecurringPayment => "recurring_payment",
            TransactionType::PlanChange => "plan_change",
            TransactionType::AdminExtension => "admin_extension",
            TransactionType::AdminForceCancel => "admin_force_cancel",
            TransactionType::Cancellation => "cancellation",
            TransactionType::ScheduledCancellation => "scheduled_cancellation",
            TransactionType::Reactivation => "reactivation",
            TransactionType::WebhookPaymentSuccess => "webhook_payment_success",
            TransactionType::WebhookPaymentFailed => "webhook_payment_failed",
            TransactionType::EwalletPayment => "ewallet_payment",
        }
    }
}

impl TransactionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trial_start" => Some(TransactionType::TrialStart),
            "initial_payment" => Some(TransactionType::InitialPayment),
            "recurring_payment" => Some(TransactionType::RecurringPayment),
            "plan_change" => Some(TransactionType::PlanChange),
            "admin_extension" => Some(TransactionType::AdminExtension),
            "admin_force_cancel" => Some(TransactionType::AdminForceCancel),
            "cancellation" => Some(TransactionType::Cancellation),
            "scheduled_cancellation" => Some(TransactionType::ScheduledCancellation),
            "reactivation" => Some(TransactionType::Reactivation),
            "webhook_payment_success" => Some(TransactionType::WebhookPaymentSuccess),
            "webhook_payment_failed" => Some(TransactionType::WebhookPaymentFailed),
            "ewallet_payment" => Some(TransactionType::EwalletPayment),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome recorded on a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Failed,
    /// Unknown outcome (e.g., gateway timeout); resolved by a later sweep
    /// or webhook
    Pending,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "pending" => Some(TransactionStatus::Pending),
            _ => None,
        }
    }
}

/// One immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub txn_type: TransactionType,
    /// Signed amount in the smallest currency unit
    pub amount_cents: i64,
    pub status: TransactionStatus,
    /// Gateway reference ids, billing period key, failure reasons
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

impl Transaction {
    pub fn new(
        subscription_id: Uuid,
        txn_type: TransactionType,
        amount_cents: i64,
        status: TransactionStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            txn_type,
            amount_cents,
            status,
            metadata: serde_json::json!({}),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn set_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Attach the gateway's charge/payment/event reference id
    pub fn with_gateway_reference(self, reference: &str) -> Self {
        self.set_meta("gateway_reference", serde_json::json!(reference))
    }

    /// Attach the billing period this entry settles (idempotency key part)
    pub fn with_billing_period(self, period_key: &str) -> Self {
        self.set_meta("billing_period", serde_json::json!(period_key))
    }

    /// Attach a human-readable reason (cancellations, admin overrides)
    pub fn with_reason(self, reason: &str) -> Self {
        self.set_meta("reason", serde_json::json!(reason))
    }

    /// Attach the gateway/network error detail for failed entries
    pub fn with_error(self, error: &str) -> Self {
        self.set_meta("error", serde_json::json!(error))
    }

    /// Mark the amount as computed for the record but not charged by the
    /// engine, because a verified provider reference settled it out of band
    pub fn settled_out_of_band(self) -> Self {
        self.set_meta("settled_out_of_band", serde_json::json!(true))
    }

    pub fn gateway_reference(&self) -> Option<&str> {
        self.metadata.get("gateway_reference").and_then(|v| v.as_str())
    }

    pub fn billing_period(&self) -> Option<&str> {
        self.metadata.get("billing_period").and_then(|v| v.as_str())
    }

    pub fn is_settled_out_of_band(&self) -> bool {
        self.metadata
            .get("settled_out_of_band")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Idempotency key for a subscription's billing period, derived from the
/// period start date. A retried sweep or gateway call carrying the same key
/// must not settle the same period twice.
pub fn billing_period_key(period_start: OffsetDateTime) -> String {
    let date = period_start.date();
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn metadata_round_trip() {
        let txn = Transaction::new(
            Uuid::new_v4(),
            TransactionType::RecurringPayment,
            49_900,
            TransactionStatus::Completed,
        )
        .with_gateway_reference("pay_abc123")
        .with_billing_period("2026-08-01");

        assert_eq!(txn.gateway_reference(), Some("pay_abc123"));
        assert_eq!(txn.billing_period(), Some("2026-08-01"));
        assert!(!txn.is_settled_out_of_band());
    }

    #[test]
    fn out_of_band_flag_is_distinct() {
        let txn = Transaction::new(
            Uuid::new_v4(),
            TransactionType::PlanChange,
            67,
            TransactionStatus::Completed,
        )
        .settled_out_of_band();

        assert!(txn.is_settled_out_of_band());
    }

    #[test]
    fn period_key_formats_date() {
        let key = billing_period_key(datetime!(2026-08-06 15:04 UTC));
        assert_eq!(key, "2026-08-06");
    }

    #[test]
    fn type_strings_are_stable() {
        assert_eq!(TransactionType::WebhookPaymentSuccess.as_str(), "webhook_payment_success");
        assert_eq!(TransactionType::EwalletPayment.as_str(), "ewallet_payment");
        assert_eq!(TransactionStatus::Pending.as_str(), "pending");
    }
}
