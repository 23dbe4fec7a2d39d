//! Webhook reconciliation
//!
//! Maps gateway events onto state-machine transitions, idempotently. The
//! gateway may redeliver any event; the ledger's gateway-reference records
//! are the dedupe guard. Unknown events and unmatched subscriptions are
//! acknowledged and logged, never failed - a 5xx back to the gateway would
//! trigger endless redelivery retries.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, ChargeStatus, PaymentGateway};
use crate::ledger::{Transaction, TransactionStatus, TransactionType};
use crate::store::SubscriptionStore;
use crate::subscription::{Subscription, Transition};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (seconds)
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Inbound gateway event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "event_type", alias = "eventType")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookData {
    /// Gateway reference id for the payment/source the event describes
    pub id: String,
    pub attributes: WebhookAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAttributes {
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub status: String,
    /// E-wallet source reference for `source.chargeable` events
    #[serde(default)]
    pub source: Option<WebhookSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSource {
    pub id: String,
}

/// What the reconciler did with an event. Every disposition is an
/// acknowledgement; the gateway is never asked to redeliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Processed,
    /// Redelivery of an event the ledger already records
    Duplicate,
    /// Unknown event type, unmatched subscription, or an event that cannot
    /// apply (e.g. payment for a cancelled subscription)
    Ignored,
}

/// Event-driven consumer of gateway callbacks
pub struct WebhookHandler {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        currency: String,
        webhook_secret: String,
    ) -> Self {
        Self {
            store,
            gateway,
            currency,
            webhook_secret,
        }
    }

    /// Verify the `t=<ts>,v1=<hex sig>` signature header and parse the event
    pub fn verify_event(
        &self,
        payload: &str,
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookEvent> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now.unix_timestamp(),
                "Webhook timestamp outside tolerance window"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Reconcile a verified event against the subscription record
    pub async fn handle_event(
        &self,
        event: WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookDisposition> {
        match event.event_type.as_str() {
            "payment.paid" => self.reconcile_payment_paid(&event, now).await,
            "payment.failed" => self.reconcile_payment_failed(&event, now).await,
            "source.chargeable" => self.reconcile_source_chargeable(&event, now).await,
            other => {
                tracing::info!(
                    event_type = %other,
                    event_ref = %event.data.id,
                    "Received unhandled gateway event type - acknowledging"
                );
                Ok(WebhookDisposition::Ignored)
            }
        }
    }

    async fn reconcile_payment_paid(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookDisposition> {
        let Some(mut sub) = self.resolve_subscription(event).await? else {
            return Ok(WebhookDisposition::Ignored);
        };
        let reference = event.data.id.as_str();

        if self.store.has_gateway_reference(sub.id, reference).await? {
            tracing::info!(
                subscription_id = %sub.id,
                gateway_reference = %reference,
                "Duplicate payment.paid event, already recorded"
            );
            return Ok(WebhookDisposition::Duplicate);
        }

        if sub.state.is_cancelled() {
            // Terminal protection: log the money movement for audit, never
            // resurrect the subscription.
            let txn = Transaction::new(
                sub.id,
                TransactionType::WebhookPaymentSuccess,
                event.data.attributes.amount,
                TransactionStatus::Completed,
            )
            .with_gateway_reference(reference)
            .with_reason("payment received for cancelled subscription");
            self.store.append_transaction(&txn).await?;

            tracing::warn!(
                subscription_id = %sub.id,
                gateway_reference = %reference,
                "Payment received for cancelled subscription, state unchanged"
            );
            return Ok(WebhookDisposition::Ignored);
        }

        if sub.payment_covers_due_period(now) {
            let period_key = sub.upcoming_period_key();
            sub.apply_transition(Transition::PaymentSucceeded { at: now })?;
            let txn = Transaction::new(
                sub.id,
                TransactionType::WebhookPaymentSuccess,
                event.data.attributes.amount,
                TransactionStatus::Completed,
            )
            .with_gateway_reference(reference)
            .with_billing_period(&period_key);

            match self.store.update_with_transaction(&sub, &txn).await {
                Ok(updated) => {
                    tracing::info!(
                        subscription_id = %updated.id,
                        gateway_reference = %reference,
                        status = %updated.status_str(),
                        "Payment confirmed via webhook, period advanced"
                    );
                    Ok(WebhookDisposition::Processed)
                }
                Err(BillingError::ConcurrentModification(_)) => {
                    tracing::info!(
                        subscription_id = %sub.id,
                        gateway_reference = %reference,
                        "Another writer reconciled this payment first"
                    );
                    Ok(WebhookDisposition::Duplicate)
                }
                Err(e) => Err(e),
            }
        } else {
            // The engine already advanced this period (synchronous charge
            // path); record the confirmation only.
            let txn = Transaction::new(
                sub.id,
                TransactionType::WebhookPaymentSuccess,
                event.data.attributes.amount,
                TransactionStatus::Completed,
            )
            .with_gateway_reference(reference);
            self.store.append_transaction(&txn).await?;

            tracing::info!(
                subscription_id = %sub.id,
                gateway_reference = %reference,
                "Payment confirmation for already-settled period"
            );
            Ok(WebhookDisposition::Processed)
        }
    }

    async fn reconcile_payment_failed(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookDisposition> {
        let Some(mut sub) = self.resolve_subscription(event).await? else {
            return Ok(WebhookDisposition::Ignored);
        };
        let reference = event.data.id.as_str();

        if self.store.has_gateway_reference(sub.id, reference).await? {
            return Ok(WebhookDisposition::Duplicate);
        }

        let reason = event
            .data
            .attributes
            .metadata
            .get("failed_reason")
            .map(String::as_str)
            .unwrap_or(event.data.attributes.status.as_str());

        if sub.state.is_cancelled() {
            tracing::info!(
                subscription_id = %sub.id,
                gateway_reference = %reference,
                "Payment failure for cancelled subscription, state unchanged"
            );
            return Ok(WebhookDisposition::Ignored);
        }

        sub.apply_transition(Transition::PaymentFailed { at: now })?;
        let txn = Transaction::new(
            sub.id,
            TransactionType::WebhookPaymentFailed,
            event.data.attributes.amount,
            TransactionStatus::Failed,
        )
        .with_gateway_reference(reference)
        .with_error(reason);

        match self.store.update_with_transaction(&sub, &txn).await {
            Ok(updated) => {
                tracing::warn!(
                    subscription_id = %updated.id,
                    gateway_reference = %reference,
                    reason = %reason,
                    "Payment failure reconciled, subscription past due"
                );
                Ok(WebhookDisposition::Processed)
            }
            Err(BillingError::ConcurrentModification(_)) => Ok(WebhookDisposition::Duplicate),
            Err(e) => Err(e),
        }
    }

    /// Redirect-based e-wallet flow: the payer authorized the source out of
    /// band, and the engine must convert it into a charge.
    async fn reconcile_source_chargeable(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookDisposition> {
        let Some(mut sub) = self.resolve_subscription(event).await? else {
            return Ok(WebhookDisposition::Ignored);
        };

        let source_id = event
            .data
            .attributes
            .source
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_else(|| event.data.id.clone());

        // Dedupe on the source id: a redelivered source.chargeable must not
        // charge the source twice.
        if self.store.has_gateway_reference(sub.id, &source_id).await? {
            tracing::info!(
                subscription_id = %sub.id,
                source_id = %source_id,
                "Duplicate source.chargeable event, already charged"
            );
            return Ok(WebhookDisposition::Duplicate);
        }

        if sub.state.is_cancelled() {
            tracing::warn!(
                subscription_id = %sub.id,
                source_id = %source_id,
                "Chargeable source for cancelled subscription, not charging"
            );
            return Ok(WebhookDisposition::Ignored);
        }

        let amount = event.data.attributes.amount;
        let period_key = sub.upcoming_period_key();
        let mut metadata = HashMap::new();
        metadata.insert("subscription_id".to_string(), sub.id.to_string());
        metadata.insert("billing_period".to_string(), period_key.clone());
        metadata.insert("source_id".to_string(), source_id.clone());

        let charge_result = self
            .gateway
            .charge(ChargeRequest {
                amount_cents: amount,
                currency: self.currency.clone(),
                customer_or_source: source_id.clone(),
                metadata,
            })
            .await;

        match charge_result {
            Ok(outcome) if outcome.status == ChargeStatus::Succeeded => {
                let covers_due = sub.payment_covers_due_period(now);
                let mut txn = Transaction::new(
                    sub.id,
                    TransactionType::EwalletPayment,
                    amount,
                    TransactionStatus::Completed,
                )
                .with_gateway_reference(&source_id);
                if let Some(map) = txn.metadata.as_object_mut() {
                    map.insert("payment_id".to_string(), serde_json::json!(outcome.id));
                }

                if covers_due {
                    txn = txn.with_billing_period(&period_key);
                    sub.apply_transition(Transition::PaymentSucceeded { at: now })?;
                    match self.store.update_with_transaction(&sub, &txn).await {
                        Ok(updated) => {
                            tracing::info!(
                                subscription_id = %updated.id,
                                source_id = %source_id,
                                payment_id = %outcome.id,
                                "E-wallet source charged, period advanced"
                            );
                            Ok(WebhookDisposition::Processed)
                        }
                        Err(BillingError::ConcurrentModification(_)) => {
                            // The charge went through; keep the audit record.
                            self.store.append_transaction(&txn).await?;
                            Ok(WebhookDisposition::Processed)
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    self.store.append_transaction(&txn).await?;
                    Ok(WebhookDisposition::Processed)
                }
            }
            Ok(outcome) => {
                let txn = Transaction::new(
                    sub.id,
                    TransactionType::EwalletPayment,
                    amount,
                    TransactionStatus::Pending,
                )
                .with_gateway_reference(&source_id)
                .with_error(&format!("charge {} still {:?}", outcome.id, outcome.status));
                self.store.append_transaction(&txn).await?;
                Ok(WebhookDisposition::Processed)
            }
            Err(e) if e.is_unknown_outcome() => {
                // Unknown outcome: acknowledge and let redelivery or the
                // sweep settle it. Nothing is recorded against the source so
                // a retry can still charge it.
                tracing::warn!(
                    subscription_id = %sub.id,
                    source_id = %source_id,
                    error = %e,
                    "E-wallet charge outcome unknown"
                );
                Ok(WebhookDisposition::Ignored)
            }
            Err(e) => {
                let detail = e.to_string();
                sub.apply_transition(Transition::PaymentFailed { at: now })?;
                let txn = Transaction::new(
                    sub.id,
                    TransactionType::EwalletPayment,
                    amount,
                    TransactionStatus::Failed,
                )
                .with_gateway_reference(&source_id)
                .with_error(&detail);

                match self.store.update_with_transaction(&sub, &txn).await {
                    Ok(_) => {
                        tracing::warn!(
                            subscription_id = %sub.id,
                            source_id = %source_id,
                            error = %detail,
                            "E-wallet charge declined, subscription past due"
                        );
                        Ok(WebhookDisposition::Processed)
                    }
                    Err(BillingError::ConcurrentModification(_)) => {
                        self.store.append_transaction(&txn).await?;
                        Ok(WebhookDisposition::Processed)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Resolve the subscription the event refers to; unmatched events are
    /// logged and acknowledged.
    async fn resolve_subscription(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<Option<Subscription>> {
        let Some(raw_id) = event.data.attributes.metadata.get("subscription_id") else {
            tracing::info!(
                event_type = %event.event_type,
                event_ref = %event.data.id,
                "Gateway event carries no subscription reference - acknowledging"
            );
            return Ok(None);
        };

        let Ok(subscription_id) = Uuid::parse_str(raw_id) else {
            tracing::warn!(
                event_type = %event.event_type,
                event_ref = %event.data.id,
                raw_subscription_id = %raw_id,
                "Gateway event carries malformed subscription id - acknowledging"
            );
            return Ok(None);
        };

        match self.store.get(subscription_id).await {
            Ok(sub) => Ok(Some(sub)),
            Err(BillingError::NotFound(_)) => {
                tracing::warn!(
                    event_type = %event.event_type,
                    subscription_id = %subscription_id,
                    "Gateway event references unknown subscription - acknowledging"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod signature_tests {
    use super::*;
    use crate::gateway::testing::MockGateway;
    use crate::store::InMemoryStore;
    use time::macros::datetime;

    fn handler() -> WebhookHandler {
        WebhookHandler::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockGateway::new()),
            "PHP".to_string(),
            "whsec_testsecret".to_string(),
        )
    }

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    const PAYLOAD: &str = r#"{
        "event_type": "payment.paid",
        "data": {
            "id": "pay_evt_1",
            "attributes": {
                "amount": 49900,
                "currency": "PHP",
                "metadata": {"subscription_id": "00000000-0000-0000-0000-000000000001"},
                "status": "paid"
            }
        }
    }"#;

    const NOW: OffsetDateTime = datetime!(2026-08-06 12:00 UTC);

    #[test]
    fn accepts_valid_signature() {
        let handler = handler();
        let sig = sign(PAYLOAD, "testsecret", NOW.unix_timestamp());
        let event = handler.verify_event(PAYLOAD, &sig, NOW).unwrap();
        assert_eq!(event.event_type, "payment.paid");
        assert_eq!(event.data.id, "pay_evt_1");
        assert_eq!(event.data.attributes.amount, 49_900);
    }

    #[test]
    fn rejects_wrong_secret() {
        let handler = handler();
        let sig = sign(PAYLOAD, "wrongsecret", NOW.unix_timestamp());
        assert!(matches!(
            handler.verify_event(PAYLOAD, &sig, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let handler = handler();
        let stale = NOW.unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 1;
        let sig = sign(PAYLOAD, "testsecret", stale);
        assert!(matches!(
            handler.verify_event(PAYLOAD, &sig, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn rejects_tampered_payload() {
        let handler = handler();
        let sig = sign(PAYLOAD, "testsecret", NOW.unix_timestamp());
        let tampered = PAYLOAD.replace("49900", "1");
        assert!(matches!(
            handler.verify_event(&tampered, &sig, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn rejects_malformed_header() {
        let handler = handler();
        assert!(handler.verify_event(PAYLOAD, "v1=deadbeef", NOW).is_err());
        assert!(handler.verify_event(PAYLOAD, "t=123", NOW).is_err());
        assert!(handler.verify_event(PAYLOAD, "", NOW).is_err());
    }

    #[test]
    fn event_parses_camel_case_alias() {
        let raw = r#"{"eventType":"payment.failed","data":{"id":"pay_1","attributes":{"status":"failed"}}}"#;
        let event: WebhookEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, "payment.failed");
        assert_eq!(event.data.attributes.amount, 0);
        assert!(event.data.attributes.metadata.is_empty());
    }
}
