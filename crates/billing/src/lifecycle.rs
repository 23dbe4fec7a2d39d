//! Subscription lifecycle operations
//!
//! Enrollment, plan changes, cancellation, reactivation and administrative
//! overrides. All mutations go through the subscription state machine and
//! persist atomically with their ledger entry; synchronous gateway failures
//! propagate to the caller and never leave a half-applied change behind.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{BillingInterval, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeRequest, ChargeStatus, CreateCustomerRequest, PaymentGateway, PaymentMethodDetails,
};
use crate::ledger::{Transaction, TransactionStatus, TransactionType};
use crate::proration::proration_charge;
use crate::store::SubscriptionStore;
use crate::subscription::{CancelReason, Subscription, Transition};

/// Enrollment parameters
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub vendor_id: Uuid,
    pub plan_id: String,
    pub billing_interval: BillingInterval,
    pub start_trial: bool,
    /// Vendor contact details for gateway customer creation
    pub vendor_name: String,
    pub vendor_email: String,
    pub vendor_phone: Option<String>,
    pub payment_method_id: Option<String>,
}

/// Lifecycle operations on subscriptions
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    currency: String,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        currency: String,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            currency,
        }
    }

    /// Enroll a vendor on a plan, either starting a trial or charging
    /// immediately.
    pub async fn enroll(
        &self,
        req: EnrollmentRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let plan = self.catalog.resolve(&req.plan_id)?;

        if let Some(existing) = self.store.find_current_for_vendor(req.vendor_id).await? {
            return Err(BillingError::Validation(format!(
                "vendor already has subscription {} in status '{}'",
                existing.id,
                existing.status_str()
            )));
        }

        if req.start_trial {
            if plan.trial_days == 0 {
                return Err(BillingError::Validation(format!(
                    "plan '{}' does not offer a trial",
                    plan.id
                )));
            }
            let mut sub = Subscription::new_trial(
                req.vendor_id,
                &plan.id,
                req.billing_interval,
                plan.trial_days,
                now,
            );
            sub.payment_method_id = req.payment_method_id.clone();
            if sub.payment_method_id.is_some() {
                sub.gateway_customer_id = Some(self.create_customer(&req).await?);
            }

            let txn = Transaction::new(
                sub.id,
                TransactionType::TrialStart,
                0,
                TransactionStatus::Completed,
            );
            self.store.insert_with_transaction(&sub, &txn).await?;

            tracing::info!(
                subscription_id = %sub.id,
                vendor_id = %req.vendor_id,
                plan_id = %plan.id,
                trial_days = plan.trial_days,
                "Enrolled vendor with trial"
            );
            return Ok(sub);
        }

        // Immediate-pay enrollment: the charge must succeed synchronously.
        let payment_method_id = req.payment_method_id.clone().ok_or_else(|| {
            BillingError::Validation(
                "a payment method is required for immediate enrollment".to_string(),
            )
        })?;

        let customer_id = self.create_customer(&req).await?;
        let amount = plan.price_for(req.billing_interval);

        let mut sub =
            Subscription::new_active(req.vendor_id, &plan.id, req.billing_interval, now);
        sub.payment_method_id = Some(payment_method_id);
        sub.gateway_customer_id = Some(customer_id.clone());

        let mut metadata = HashMap::new();
        metadata.insert("subscription_id".to_string(), sub.id.to_string());
        metadata.insert(
            "billing_period".to_string(),
            crate::ledger::billing_period_key(now),
        );
        metadata.insert("vendor_id".to_string(), req.vendor_id.to_string());

        let outcome = self
            .gateway
            .charge(ChargeRequest {
                amount_cents: amount,
                currency: self.currency.clone(),
                customer_or_source: customer_id,
                metadata,
            })
            .await
            .map_err(BillingError::from_charge)?;

        if outcome.status != ChargeStatus::Succeeded {
            return Err(BillingError::ChargeFailed(format!(
                "initial charge {} is {:?}, not succeeded",
                outcome.id, outcome.status
            )));
        }

        let txn = Transaction::new(
            sub.id,
            TransactionType::InitialPayment,
            amount,
            TransactionStatus::Completed,
        )
        .with_gateway_reference(&outcome.id)
        .with_billing_period(&crate::ledger::billing_period_key(now));

        self.store.insert_with_transaction(&sub, &txn).await?;

        tracing::info!(
            subscription_id = %sub.id,
            vendor_id = %req.vendor_id,
            plan_id = %plan.id,
            amount_cents = amount,
            gateway_reference = %outcome.id,
            "Enrolled vendor with immediate payment"
        );
        Ok(sub)
    }

    /// Change the subscription's plan mid-period, charging the prorated
    /// difference. Downgrades charge nothing; future billing simply uses the
    /// new price.
    ///
    /// A caller-supplied `already_paid_reference` skips the charge step, but
    /// only after the reference is verified against the gateway as a
    /// succeeded charge; the ledger entry is flagged so audits can tell
    /// computed-but-not-charged from charged.
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        new_plan_id: &str,
        already_paid_reference: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut sub = self.store.get(subscription_id).await?;

        if sub.plan_id == new_plan_id {
            return Err(BillingError::Validation(format!(
                "subscription is already on plan '{}'",
                new_plan_id
            )));
        }

        let current_price = self.catalog.price_for(&sub.plan_id, sub.billing_interval)?;
        let new_plan = self.catalog.resolve(new_plan_id)?;
        let new_price = new_plan.price_for(sub.billing_interval);

        let days_remaining = sub.days_remaining(now);
        let total_days = sub.billing_interval.nominal_days();
        let amount = proration_charge(current_price, new_price, days_remaining, total_days);

        let old_plan_id = sub.plan_id.clone();
        // Guard the transition before any money moves.
        sub.apply_transition(Transition::PlanChanged)?;
        sub.plan_id = new_plan_id.to_string();

        let change_meta = serde_json::json!({
            "from_plan": old_plan_id,
            "to_plan": new_plan_id,
            "days_remaining": days_remaining,
            "total_days": total_days,
        });
        let base_txn = |status| {
            let mut txn = Transaction::new(sub.id, TransactionType::PlanChange, amount, status);
            if let Some(map) = txn.metadata.as_object_mut() {
                map.insert("change".to_string(), change_meta.clone());
            }
            txn
        };

        let txn = if let Some(reference) = already_paid_reference {
            // Trust boundary: verify the reference instead of accepting it
            // at face value.
            let known = self.gateway.retrieve_charge(reference).await.map_err(|e| {
                BillingError::Validation(format!(
                    "payment reference '{}' could not be verified: {}",
                    reference, e
                ))
            })?;
            if known.status != ChargeStatus::Succeeded {
                return Err(BillingError::Validation(format!(
                    "payment reference '{}' is {:?}, not succeeded",
                    reference, known.status
                )));
            }
            base_txn(TransactionStatus::Completed)
                .with_gateway_reference(reference)
                .settled_out_of_band()
        } else if amount > 0 {
            let customer_id = sub.gateway_customer_id.clone().ok_or_else(|| {
                BillingError::Validation(
                    "subscription has no gateway customer to charge".to_string(),
                )
            })?;

            let mut metadata = HashMap::new();
            metadata.insert("subscription_id".to_string(), sub.id.to_string());
            metadata.insert("plan_change".to_string(), format!("{}>{}", old_plan_id, new_plan_id));

            match self
                .gateway
                .charge(ChargeRequest {
                    amount_cents: amount,
                    currency: self.currency.clone(),
                    customer_or_source: customer_id,
                    metadata,
                })
                .await
            {
                Ok(outcome) if outcome.status == ChargeStatus::Succeeded => {
                    base_txn(TransactionStatus::Completed).with_gateway_reference(&outcome.id)
                }
                Ok(outcome) => {
                    // Pending/failed proration charge: the plan does not change.
                    let failed = base_txn(TransactionStatus::Failed)
                        .with_gateway_reference(&outcome.id)
                        .with_error("proration charge did not succeed synchronously");
                    self.store.append_transaction(&failed).await?;
                    return Err(BillingError::ChargeFailed(format!(
                        "proration charge {} is {:?}, not succeeded",
                        outcome.id, outcome.status
                    )));
                }
                Err(e) => {
                    let failed = base_txn(TransactionStatus::Failed).with_error(&e.to_string());
                    self.store.append_transaction(&failed).await?;
                    return Err(BillingError::from_charge(e));
                }
            }
        } else {
            // Downgrade or zero-difference change: computed for the record,
            // nothing charged.
            base_txn(TransactionStatus::Completed)
        };

        let updated = self.store.update_with_transaction(&sub, &txn).await?;

        tracing::info!(
            subscription_id = %updated.id,
            from_plan = %old_plan_id,
            to_plan = %new_plan_id,
            prorated_cents = amount,
            out_of_band = already_paid_reference.is_some(),
            "Plan changed"
        );
        Ok(updated)
    }

    /// Cancel a subscription, immediately or at the end of the paid period
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        immediate: bool,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut sub = self.store.get(subscription_id).await?;

        let (transition, txn_type) = if immediate {
            (
                Transition::CancelNow {
                    at: now,
                    reason: CancelReason::Requested,
                },
                TransactionType::Cancellation,
            )
        } else {
            (
                Transition::ScheduleCancellation,
                TransactionType::ScheduledCancellation,
            )
        };

        sub.apply_transition(transition)?;

        let mut txn = Transaction::new(sub.id, txn_type, 0, TransactionStatus::Completed);
        if let Some(reason) = reason {
            txn = txn.with_reason(reason);
        }

        let updated = self.store.update_with_transaction(&sub, &txn).await?;
        tracing::info!(
            subscription_id = %updated.id,
            immediate = immediate,
            status = %updated.status_str(),
            "Cancellation applied"
        );
        Ok(updated)
    }

    /// Undo a pending or period-end cancellation
    pub async fn reactivate(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut sub = self.store.get(subscription_id).await?;
        sub.apply_transition(Transition::Reactivate { now })?;

        let txn = Transaction::new(
            sub.id,
            TransactionType::Reactivation,
            0,
            TransactionStatus::Completed,
        );
        let updated = self.store.update_with_transaction(&sub, &txn).await?;

        tracing::info!(subscription_id = %updated.id, "Subscription reactivated");
        Ok(updated)
    }

    /// Administrative extension of the paid period by whole days
    pub async fn admin_extend(
        &self,
        subscription_id: Uuid,
        days: u32,
    ) -> BillingResult<Subscription> {
        if days == 0 {
            return Err(BillingError::Validation(
                "extension must be at least one day".to_string(),
            ));
        }
        let mut sub = self.store.get(subscription_id).await?;
        sub.extend(days)?;

        let mut txn = Transaction::new(
            sub.id,
            TransactionType::AdminExtension,
            0,
            TransactionStatus::Completed,
        );
        if let Some(map) = txn.metadata.as_object_mut() {
            map.insert("days".to_string(), serde_json::json!(days));
        }

        let updated = self.store.update_with_transaction(&sub, &txn).await?;
        tracing::info!(
            subscription_id = %updated.id,
            days = days,
            end_date = %updated.end_date,
            "Subscription extended by admin"
        );
        Ok(updated)
    }

    /// Administrative terminal cancellation, bypassing period-end logic
    pub async fn admin_force_cancel(
        &self,
        subscription_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut sub = self.store.get(subscription_id).await?;
        sub.apply_transition(Transition::CancelNow {
            at: now,
            reason: CancelReason::AdminForced,
        })?;

        let txn = Transaction::new(
            sub.id,
            TransactionType::AdminForceCancel,
            0,
            TransactionStatus::Completed,
        )
        .with_reason(reason);

        let updated = self.store.update_with_transaction(&sub, &txn).await?;
        tracing::warn!(
            subscription_id = %updated.id,
            reason = %reason,
            "Subscription force-cancelled by admin"
        );
        Ok(updated)
    }

    /// Attach a tokenized payment method via the gateway and store its id.
    /// Required before the sweep will charge a trial subscription.
    pub async fn attach_payment_method(
        &self,
        subscription_id: Uuid,
        intent_id: &str,
        method: PaymentMethodDetails,
    ) -> BillingResult<Subscription> {
        let mut sub = self.store.get(subscription_id).await?;
        if sub.state.is_cancelled() {
            return Err(BillingError::NotEligible(
                "cancelled subscriptions cannot attach payment methods".to_string(),
            ));
        }

        let token = method.token.clone();
        let outcome = self.gateway.attach_payment_method(intent_id, method).await?;
        if outcome.status != "succeeded" {
            return Err(BillingError::ChargeFailed(format!(
                "payment method attachment is '{}', not succeeded",
                outcome.status
            )));
        }

        if sub.gateway_customer_id.is_none() {
            return Err(BillingError::Validation(
                "subscription has no gateway customer; enroll contact details first".to_string(),
            ));
        }
        sub.payment_method_id = Some(token);

        let updated = self.store.update(&sub).await?;
        tracing::info!(subscription_id = %updated.id, "Payment method attached");
        Ok(updated)
    }

    /// Move pending cancellations whose period has elapsed into `cancelled`.
    /// Returns the number of subscriptions expired; per-row failures are
    /// logged and never abort the batch.
    pub async fn expire_pending_cancellations(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let expiring = self.store.find_pending_cancellation_expired(now).await?;
        let total = expiring.len();
        let mut expired = 0;

        for mut sub in expiring {
            if let Err(e) = sub.apply_transition(Transition::ExpirePendingCancellation { at: now })
            {
                tracing::error!(subscription_id = %sub.id, error = %e, "Failed to expire pending cancellation");
                continue;
            }
            let txn = Transaction::new(
                sub.id,
                TransactionType::Cancellation,
                0,
                TransactionStatus::Completed,
            )
            .with_reason("period_end");

            match self.store.update_with_transaction(&sub, &txn).await {
                Ok(_) => expired += 1,
                Err(e) => {
                    tracing::error!(subscription_id = %sub.id, error = %e, "Failed to persist cancellation expiry");
                }
            }
        }

        if total > 0 {
            tracing::info!(total = total, expired = expired, "Pending cancellation expiry complete");
        }
        Ok(expired)
    }

    async fn create_customer(&self, req: &EnrollmentRequest) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("vendor_id".to_string(), req.vendor_id.to_string());

        let customer_id = self
            .gateway
            .create_customer(CreateCustomerRequest {
                name: req.vendor_name.clone(),
                email: req.vendor_email.clone(),
                phone: req.vendor_phone.clone(),
                metadata,
            })
            .await?;
        Ok(customer_id)
    }
}
