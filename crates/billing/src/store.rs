//! Subscription storage
//!
//! The [`SubscriptionStore`] trait is the persistence seam: a Postgres
//! implementation backs production (see `postgres.rs`), and the in-memory
//! implementation backs tests and local development. Per-subscription
//! updates and their ledger entries persist atomically as a unit so the
//! ledger's idempotency checks stay trustworthy.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{Transaction, TransactionStatus};
use crate::subscription::{Subscription, SubscriptionState};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Persist a new subscription together with its enrollment ledger entry
    async fn insert_with_transaction(
        &self,
        subscription: &Subscription,
        txn: &Transaction,
    ) -> BillingResult<()>;

    async fn get(&self, id: Uuid) -> BillingResult<Subscription>;

    /// The vendor's current non-cancelled subscription, if any
    async fn find_current_for_vendor(&self, vendor_id: Uuid)
        -> BillingResult<Option<Subscription>>;

    /// Persist a subscription update and append a ledger entry atomically.
    ///
    /// The update is conditional on the stored `version` matching
    /// `subscription.version`; a mismatch means another writer got there
    /// first and yields `ConcurrentModification`. On success the returned
    /// subscription carries the bumped version.
    async fn update_with_transaction(
        &self,
        subscription: &Subscription,
        txn: &Transaction,
    ) -> BillingResult<Subscription>;

    /// Persist a billing-linkage change (payment method, gateway customer)
    /// that is not a state transition and carries no ledger entry. Still
    /// version-checked.
    async fn update(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    /// Append a ledger entry with no subscription update (failed charges,
    /// diagnostics)
    async fn append_transaction(&self, txn: &Transaction) -> BillingResult<()>;

    /// Subscriptions the sweep should attempt to charge
    async fn find_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    /// Pending cancellations whose period has elapsed
    async fn find_pending_cancellation_expired(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    async fn transactions_for(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>>;

    /// Whether any ledger entry for this subscription already carries the
    /// gateway reference (webhook replay / duplicate delivery guard)
    async fn has_gateway_reference(
        &self,
        subscription_id: Uuid,
        reference: &str,
    ) -> BillingResult<bool>;

    /// Whether a completed entry already settles the billing period
    /// (duplicate/concurrent sweep guard)
    async fn has_completed_billing_period(
        &self,
        subscription_id: Uuid,
        period_key: &str,
    ) -> BillingResult<bool>;
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<Uuid, Subscription>,
    ledger: Vec<Transaction>,
}

/// In-memory store for tests, local development and single-instance use
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of ledger entries, across all subscriptions
    pub async fn ledger_len(&self) -> usize {
        self.inner.lock().await.ledger.len()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn insert_with_transaction(
        &self,
        subscription: &Subscription,
        txn: &Transaction,
    ) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::Database(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        inner
            .subscriptions
            .insert(subscription.id, subscription.clone());
        inner.ledger.push(txn.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.inner
            .lock()
            .await
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {} not found", id)))
    }

    async fn find_current_for_vendor(
        &self,
        vendor_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.vendor_id == vendor_id && !s.state.is_cancelled())
            .cloned())
    }

    async fn update_with_transaction(
        &self,
        subscription: &Subscription,
        txn: &Transaction,
    ) -> BillingResult<Subscription> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .subscriptions
            .get(&subscription.id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription.id))
            })?;

        if stored.version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                subscription.id
            )));
        }

        let mut updated = subscription.clone();
        updated.version += 1;
        updated.updated_at = OffsetDateTime::now_utc();
        inner.subscriptions.insert(updated.id, updated.clone());
        inner.ledger.push(txn.clone());
        Ok(updated)
    }

    async fn update(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .subscriptions
            .get(&subscription.id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription.id))
            })?;

        if stored.version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                subscription.id
            )));
        }

        let mut updated = subscription.clone();
        updated.version += 1;
        updated.updated_at = OffsetDateTime::now_utc();
        inner.subscriptions.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn append_transaction(&self, txn: &Transaction) -> BillingResult<()> {
        self.inner.lock().await.ledger.push(txn.clone());
        Ok(())
    }

    async fn find_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn find_pending_cancellation_expired(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| matches!(s.state, SubscriptionState::ActivePendingCancellation { at } if at <= now))
            .cloned()
            .collect())
    }

    async fn transactions_for(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>> {
        Ok(self
            .inner
            .lock()
            .await
            .ledger
            .iter()
            .filter(|t| t.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn has_gateway_reference(
        &self,
        subscription_id: Uuid,
        reference: &str,
    ) -> BillingResult<bool> {
        Ok(self.inner.lock().await.ledger.iter().any(|t| {
            t.subscription_id == subscription_id && t.gateway_reference() == Some(reference)
        }))
    }

    async fn has_completed_billing_period(
        &self,
        subscription_id: Uuid,
        period_key: &str,
    ) -> BillingResult<bool> {
        Ok(self.inner.lock().await.ledger.iter().any(|t| {
            t.subscription_id == subscription_id
                && t.status == TransactionStatus::Completed
                && t.billing_period() == Some(period_key)
        }))
    }
}
