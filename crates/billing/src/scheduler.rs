//! Recurring billing sweep
//!
//! Periodic batch that finds subscriptions due for renewal and drives them
//! through the gateway and the state machine. One subscription's failure
//! never aborts the sweep; failures are not retried within the same sweep.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, ChargeStatus, PaymentGateway};
use crate::ledger::{Transaction, TransactionStatus, TransactionType};
use crate::store::SubscriptionStore;
use crate::subscription::{Subscription, Transition};

/// One entry in the sweep's failure list
#[derive(Debug, Clone, Serialize)]
pub struct SweepError {
    pub subscription_id: Uuid,
    pub error: String,
}

/// Operational summary of a sweep run.
///
/// `failed` counts subscriptions moved to past-due; unknown outcomes
/// (gateway timeouts) appear in `errors` without a state change, so
/// `successful + failed` may be less than `processed`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<SweepError>,
}

enum BillOutcome {
    Charged,
    /// A completed ledger entry already settles this period, or another
    /// writer raced us to it
    AlreadySettled,
    /// Hard failure; the subscription is now past due
    Failed(String),
    /// Unknown outcome; no state change, reconciled later
    Unknown(String),
}

/// Drives scheduled renewals. Protected by a shared secret so it cannot be
/// invoked by untrusted callers.
pub struct RecurringBillingService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    currency: String,
    sweep_secret: String,
}

impl RecurringBillingService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        currency: String,
        sweep_secret: String,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            currency,
            sweep_secret,
        }
    }

    fn authorized(&self, secret: &str) -> bool {
        let expected = self.sweep_secret.as_bytes();
        let given = secret.as_bytes();
        expected.len() == given.len() && bool::from(expected.ct_eq(given))
    }

    /// Run one billing sweep over every due subscription
    pub async fn run_sweep(
        &self,
        auth_secret: &str,
        now: OffsetDateTime,
    ) -> BillingResult<SweepSummary> {
        if !self.authorized(auth_secret) {
            return Err(BillingError::Unauthorized);
        }

        let due = self.store.find_due(now).await?;
        let mut summary = SweepSummary {
            processed: due.len(),
            ..Default::default()
        };

        for sub in due {
            let subscription_id = sub.id;
            match self.bill_subscription(sub, now).await {
                Ok(BillOutcome::Charged) | Ok(BillOutcome::AlreadySettled) => {
                    summary.successful += 1;
                }
                Ok(BillOutcome::Failed(error)) => {
                    summary.failed += 1;
                    summary.errors.push(SweepError {
                        subscription_id,
                        error,
                    });
                }
                Ok(BillOutcome::Unknown(error)) => {
                    summary.errors.push(SweepError {
                        subscription_id,
                        error,
                    });
                }
                Err(e) => {
                    // Storage or catalog trouble for this row; keep sweeping.
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Sweep could not process subscription"
                    );
                    summary.errors.push(SweepError {
                        subscription_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            successful = summary.successful,
            failed = summary.failed,
            errors = summary.errors.len(),
            "Recurring billing sweep complete"
        );
        Ok(summary)
    }

    async fn bill_subscription(
        &self,
        mut sub: Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<BillOutcome> {
        let period_key = sub.upcoming_period_key();

        // Idempotency against duplicate or concurrent sweeps: a completed
        // entry for this period means the money already moved.
        if self
            .store
            .has_completed_billing_period(sub.id, &period_key)
            .await?
        {
            tracing::info!(
                subscription_id = %sub.id,
                billing_period = %period_key,
                "Billing period already settled, skipping"
            );
            return Ok(BillOutcome::AlreadySettled);
        }

        let amount = self.catalog.price_for(&sub.plan_id, sub.billing_interval)?;
        let customer_id = match sub.gateway_customer_id.clone() {
            Some(id) => id,
            None => {
                // Payment method present but customer linkage missing; a data
                // problem, not a payment failure.
                return Ok(BillOutcome::Unknown(
                    "subscription has no gateway customer id".to_string(),
                ));
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert("subscription_id".to_string(), sub.id.to_string());
        metadata.insert("billing_period".to_string(), period_key.clone());
        metadata.insert("vendor_id".to_string(), sub.vendor_id.to_string());

        let charge_result = self
            .gateway
            .charge(ChargeRequest {
                amount_cents: amount,
                currency: self.currency.clone(),
                customer_or_source: customer_id,
                metadata,
            })
            .await;

        match charge_result {
            Ok(outcome) if outcome.status == ChargeStatus::Succeeded => {
                sub.apply_transition(Transition::PaymentSucceeded { at: now })?;
                let txn = Transaction::new(
                    sub.id,
                    TransactionType::RecurringPayment,
                    amount,
                    TransactionStatus::Completed,
                )
                .with_gateway_reference(&outcome.id)
                .with_billing_period(&period_key);

                match self.store.update_with_transaction(&sub, &txn).await {
                    Ok(updated) => {
                        tracing::info!(
                            subscription_id = %updated.id,
                            amount_cents = amount,
                            gateway_reference = %outcome.id,
                            next_billing_date = ?updated.next_billing_date,
                            "Recurring charge succeeded"
                        );
                        Ok(BillOutcome::Charged)
                    }
                    Err(BillingError::ConcurrentModification(_)) => {
                        // A webhook or admin write got there first; the
                        // charge itself is recorded gateway-side and the
                        // reference dedupe keeps reconciliation honest.
                        tracing::warn!(
                            subscription_id = %sub.id,
                            gateway_reference = %outcome.id,
                            "Lost update race after successful charge"
                        );
                        Ok(BillOutcome::AlreadySettled)
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(outcome) => {
                // Pending (e-wallet/redirect) charges resolve via webhook.
                let txn = Transaction::new(
                    sub.id,
                    TransactionType::RecurringPayment,
                    amount,
                    TransactionStatus::Pending,
                )
                .with_gateway_reference(&outcome.id)
                .with_billing_period(&period_key);
                self.store.append_transaction(&txn).await?;

                tracing::info!(
                    subscription_id = %sub.id,
                    gateway_reference = %outcome.id,
                    "Recurring charge pending gateway confirmation"
                );
                Ok(BillOutcome::Unknown("charge pending confirmation".to_string()))
            }
            Err(e) if e.is_unknown_outcome() => {
                // Timeout or gateway-side 5xx: the charge may have gone
                // through. Do not mark past due; the next sweep or the
                // webhook reconciles the truth.
                let txn = Transaction::new(
                    sub.id,
                    TransactionType::RecurringPayment,
                    amount,
                    TransactionStatus::Pending,
                )
                .with_billing_period(&period_key)
                .with_error(&e.to_string());
                self.store.append_transaction(&txn).await?;

                tracing::warn!(
                    subscription_id = %sub.id,
                    error = %e,
                    "Recurring charge outcome unknown, leaving state unchanged"
                );
                Ok(BillOutcome::Unknown(e.to_string()))
            }
            Err(e) => {
                let detail = e.to_string();
                sub.apply_transition(Transition::PaymentFailed { at: now })?;
                let txn = Transaction::new(
                    sub.id,
                    TransactionType::RecurringPayment,
                    amount,
                    TransactionStatus::Failed,
                )
                .with_billing_period(&period_key)
                .with_error(&detail);

                match self.store.update_with_transaction(&sub, &txn).await {
                    Ok(updated) => {
                        tracing::warn!(
                            subscription_id = %updated.id,
                            error = %detail,
                            "Recurring charge failed, subscription past due"
                        );
                        Ok(BillOutcome::Failed(detail))
                    }
                    Err(BillingError::ConcurrentModification(_)) => {
                        self.store.append_transaction(&txn).await?;
                        Ok(BillOutcome::Failed(detail))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}
