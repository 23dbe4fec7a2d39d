//! Subscription entity and state machine
//!
//! All status mutation flows through [`Subscription::apply_transition`] so
//! that callers (lifecycle operations, the billing sweep, the webhook
//! reconciler) cannot leave a subscription inconsistent with its dates.
//! The `(status, cancel-at-period-end)` pair is modeled as a single tagged
//! state so illegal combinations are unrepresentable.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::BillingInterval;
use crate::error::{BillingError, BillingResult};

/// Why a subscription ended up cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Vendor asked for an immediate cancellation
    Requested,
    /// A scheduled cancellation reached the end of its paid period
    PeriodEnd,
    /// Administrative force-cancel, bypassing period-end logic
    AdminForced,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Requested => "requested",
            CancelReason::PeriodEnd => "period_end",
            CancelReason::AdminForced => "admin_forced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(CancelReason::Requested),
            "period_end" => Some(CancelReason::PeriodEnd),
            "admin_forced" => Some(CancelReason::AdminForced),
            _ => None,
        }
    }
}

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubscriptionState {
    Trial {
        ends: OffsetDateTime,
    },
    Active,
    /// Still active, but marked for termination when the paid period ends
    ActivePendingCancellation {
        at: OffsetDateTime,
    },
    PastDue {
        since: OffsetDateTime,
    },
    /// Terminal for payment-driven transitions; `PeriodEnd` cancellations
    /// whose period has not elapsed may still be reactivated
    Cancelled {
        at: OffsetDateTime,
        reason: CancelReason,
    },
}

impl SubscriptionState {
    /// Status string persisted to storage and surfaced in API responses
    pub fn status_str(&self) -> &'static str {
        match self {
            SubscriptionState::Trial { .. } => "trial",
            SubscriptionState::Active | SubscriptionState::ActivePendingCancellation { .. } => {
                "active"
            }
            SubscriptionState::PastDue { .. } => "past_due",
            SubscriptionState::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubscriptionState::Cancelled { .. })
    }

    pub fn cancel_at_period_end(&self) -> bool {
        matches!(self, SubscriptionState::ActivePendingCancellation { .. })
    }
}

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A charge settled; advances the paid period when one is due
    PaymentSucceeded { at: OffsetDateTime },
    /// A charge was declined or hard-failed; dates do not advance
    PaymentFailed { at: OffsetDateTime },
    /// The plan id was replaced in place; trials convert to active,
    /// billing dates do not move
    PlanChanged,
    /// Mark for termination at the end of the current paid period
    ScheduleCancellation,
    /// Immediate cancellation
    CancelNow {
        at: OffsetDateTime,
        reason: CancelReason,
    },
    /// Undo a pending or period-end cancellation
    Reactivate { now: OffsetDateTime },
    /// A pending cancellation whose period has elapsed becomes terminal
    ExpirePendingCancellation { at: OffsetDateTime },
}

impl Transition {
    pub fn describe(&self) -> &'static str {
        match self {
            Transition::PaymentSucceeded { .. } => "payment_succeeded",
            Transition::PaymentFailed { .. } => "payment_failed",
            Transition::PlanChanged => "plan_changed",
            Transition::ScheduleCancellation => "schedule_cancellation",
            Transition::CancelNow { .. } => "cancel_now",
            Transition::Reactivate { .. } => "reactivate",
            Transition::ExpirePendingCancellation { .. } => "expire_pending_cancellation",
        }
    }
}

/// One active-or-historical record per vendor-plan enrollment.
/// Never physically deleted; cancellation is a status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub plan_id: String,
    pub billing_interval: BillingInterval,
    pub state: SubscriptionState,
    pub start_date: OffsetDateTime,
    /// Current paid-through date
    pub end_date: OffsetDateTime,
    pub trial_end_date: Option<OffsetDateTime>,
    /// `None` once cancelled; a cancelled subscription is never billed
    pub next_billing_date: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    /// Absence blocks recurring charges
    pub payment_method_id: Option<String>,
    pub gateway_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Optimistic concurrency counter; the subscription row is the unit of
    /// mutual exclusion between the sweep, the reconciler and admin calls
    pub version: i64,
}

impl Subscription {
    /// Enroll with a trial period. No charge is made; the first real charge
    /// happens when the sweep finds the subscription due at trial end.
    pub fn new_trial(
        vendor_id: Uuid,
        plan_id: &str,
        interval: BillingInterval,
        trial_days: u32,
        now: OffsetDateTime,
    ) -> Self {
        let trial_end = now + time::Duration::days(i64::from(trial_days));
        Self {
            id: Uuid::new_v4(),
            vendor_id,
            plan_id: plan_id.to_string(),
            billing_interval: interval,
            state: SubscriptionState::Trial { ends: trial_end },
            start_date: now,
            end_date: trial_end,
            trial_end_date: Some(trial_end),
            next_billing_date: Some(trial_end),
            cancelled_at: None,
            payment_method_id: None,
            gateway_customer_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Enroll with an immediate successful payment
    pub fn new_active(
        vendor_id: Uuid,
        plan_id: &str,
        interval: BillingInterval,
        now: OffsetDateTime,
    ) -> Self {
        let end_date = interval.advance(now);
        Self {
            id: Uuid::new_v4(),
            vendor_id,
            plan_id: plan_id.to_string(),
            billing_interval: interval,
            state: SubscriptionState::Active,
            start_date: now,
            end_date,
            trial_end_date: None,
            next_billing_date: Some(end_date),
            cancelled_at: None,
            payment_method_id: None,
            gateway_customer_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn status_str(&self) -> &'static str {
        self.state.status_str()
    }

    /// Whether the sweep should attempt a charge for this subscription
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        if self.payment_method_id.is_none() {
            return false;
        }
        let billable = matches!(
            self.state,
            SubscriptionState::Trial { .. }
                | SubscriptionState::Active
                | SubscriptionState::PastDue { .. }
        );
        match (billable, self.next_billing_date) {
            (true, Some(due)) => due <= now,
            _ => false,
        }
    }

    /// Whether a successful payment at `now` settles a due period (as
    /// opposed to confirming a period the engine already advanced)
    pub fn payment_covers_due_period(&self, now: OffsetDateTime) -> bool {
        match self.state {
            SubscriptionState::Trial { .. } | SubscriptionState::PastDue { .. } => true,
            SubscriptionState::Active => self
                .next_billing_date
                .map(|due| due <= now)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Days remaining in the current paid period, floored at zero
    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        (self.end_date - now).whole_days().max(0)
    }

    /// Start of the billing period settled by the next charge
    fn upcoming_period_start(&self) -> OffsetDateTime {
        self.next_billing_date.unwrap_or(self.end_date)
    }

    /// Idempotency key for the billing period the next charge would settle
    pub fn upcoming_period_key(&self) -> String {
        crate::ledger::billing_period_key(self.upcoming_period_start())
    }

    /// Apply a state transition, maintaining the date invariants.
    ///
    /// Rejected transitions leave the subscription untouched and return
    /// either `InvalidTransition` (illegal edge, e.g. resurrecting a
    /// cancelled subscription) or `NotEligible` (legal edge, failed guard).
    pub fn apply_transition(&mut self, transition: Transition) -> BillingResult<()> {
        let next = self.next_state(transition)?;

        match transition {
            Transition::PaymentSucceeded { .. } => {
                // Advance the paid period by one interval, anchored at the
                // period boundary rather than the processing time so a late
                // sweep does not stretch the period.
                let period_start = self.upcoming_period_start();
                self.end_date = self.billing_interval.advance(period_start);
                self.next_billing_date = Some(self.end_date);
            }
            Transition::PaymentFailed { .. } => {
                // No date advancement on failure.
            }
            Transition::PlanChanged => {
                // Plan swap only; the new price applies from the next charge.
            }
            Transition::ScheduleCancellation => {
                // Flag only; billing dates untouched until the period ends.
            }
            Transition::CancelNow { at, .. } | Transition::ExpirePendingCancellation { at } => {
                self.cancelled_at = Some(at);
                self.next_billing_date = None;
            }
            Transition::Reactivate { .. } => {
                self.cancelled_at = None;
                self.next_billing_date = Some(self.end_date);
            }
        }

        self.state = next;
        Ok(())
    }

    fn next_state(&self, transition: Transition) -> BillingResult<SubscriptionState> {
        use SubscriptionState::*;

        match (self.state, transition) {
            // A settled payment activates trials, keeps actives active and
            // recovers past-due subscriptions.
            (Trial { .. } | Active | PastDue { .. }, Transition::PaymentSucceeded { .. }) => {
                Ok(Active)
            }
            // A payment landing on a pending cancellation does not clear the
            // scheduled termination.
            (
                ActivePendingCancellation { at },
                Transition::PaymentSucceeded { .. },
            ) => Ok(ActivePendingCancellation { at }),
            (Cancelled { .. }, Transition::PaymentSucceeded { .. }) => {
                Err(BillingError::InvalidTransition(
                    "cancelled subscriptions cannot be re-activated by a payment".to_string(),
                ))
            }

            (Trial { .. } | Active | ActivePendingCancellation { .. }, Transition::PaymentFailed { at }) => {
                Ok(PastDue { since: at })
            }
            // Already past due: keep the original delinquency timestamp.
            (PastDue { since }, Transition::PaymentFailed { .. }) => Ok(PastDue { since }),
            (Cancelled { .. }, Transition::PaymentFailed { .. }) => {
                Err(BillingError::InvalidTransition(
                    "cancelled subscriptions do not track payment failures".to_string(),
                ))
            }

            (Trial { .. } | Active, Transition::PlanChanged) => Ok(Active),
            (ActivePendingCancellation { .. }, Transition::PlanChanged) => {
                Err(BillingError::NotEligible(
                    "subscription is pending cancellation; reactivate before changing plans"
                        .to_string(),
                ))
            }
            (PastDue { .. }, Transition::PlanChanged) => Err(BillingError::NotEligible(
                "past-due subscriptions must settle the outstanding charge before changing plans"
                    .to_string(),
            )),
            (Cancelled { .. }, Transition::PlanChanged) => Err(BillingError::NotEligible(
                "cancelled subscriptions cannot change plans".to_string(),
            )),

            (Trial { .. } | Active, Transition::ScheduleCancellation) => {
                Ok(ActivePendingCancellation { at: self.end_date })
            }
            // Re-scheduling is an idempotent no-op.
            (ActivePendingCancellation { at }, Transition::ScheduleCancellation) => {
                Ok(ActivePendingCancellation { at })
            }
            (PastDue { .. }, Transition::ScheduleCancellation) => Err(BillingError::NotEligible(
                "past-due subscriptions must be cancelled immediately or recovered first"
                    .to_string(),
            )),
            (Cancelled { .. }, Transition::ScheduleCancellation) => Err(
                BillingError::NotEligible("subscription is already cancelled".to_string()),
            ),

            (Cancelled { .. }, Transition::CancelNow { .. }) => Err(BillingError::NotEligible(
                "subscription is already cancelled".to_string(),
            )),
            (_, Transition::CancelNow { at, reason }) => Ok(Cancelled { at, reason }),

            (ActivePendingCancellation { .. }, Transition::Reactivate { .. }) => Ok(Active),
            (
                Cancelled {
                    reason: CancelReason::PeriodEnd,
                    ..
                },
                Transition::Reactivate { now },
            ) => {
                if self.end_date > now {
                    Ok(Active)
                } else {
                    Err(BillingError::NotEligible(
                        "billing period has already elapsed".to_string(),
                    ))
                }
            }
            (Cancelled { .. }, Transition::Reactivate { .. }) => Err(BillingError::NotEligible(
                "only period-end cancellations can be reactivated".to_string(),
            )),
            (_, Transition::Reactivate { .. }) => Err(BillingError::NotEligible(
                "subscription is not pending cancellation".to_string(),
            )),

            (
                ActivePendingCancellation { at: scheduled },
                Transition::ExpirePendingCancellation { at },
            ) => {
                if scheduled <= at {
                    Ok(Cancelled {
                        at,
                        reason: CancelReason::PeriodEnd,
                    })
                } else {
                    Err(BillingError::NotEligible(
                        "cancellation period has not elapsed yet".to_string(),
                    ))
                }
            }
            (_, Transition::ExpirePendingCancellation { .. }) => {
                Err(BillingError::InvalidTransition(
                    "subscription has no pending cancellation to expire".to_string(),
                ))
            }
        }
    }

    /// Administrative date extension. Not a state transition: it pushes the
    /// paid-through and next-billing dates forward by whole days.
    pub fn extend(&mut self, days: u32) -> BillingResult<()> {
        if self.state.is_cancelled() {
            return Err(BillingError::NotEligible(
                "cancelled subscriptions cannot be extended".to_string(),
            ));
        }
        let extension = time::Duration::days(i64::from(days));
        self.end_date += extension;
        if let SubscriptionState::Trial { ends } = self.state {
            let new_trial_end = ends + extension;
            self.state = SubscriptionState::Trial { ends: new_trial_end };
            self.trial_end_date = Some(new_trial_end);
            self.next_billing_date = Some(new_trial_end);
        } else {
            if let SubscriptionState::ActivePendingCancellation { .. } = self.state {
                self.state = SubscriptionState::ActivePendingCancellation { at: self.end_date };
            }
            self.next_billing_date = Some(self.end_date);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-08-06 00:00 UTC);

    fn active_sub() -> Subscription {
        let mut sub = Subscription::new_active(
            Uuid::new_v4(),
            "featured",
            BillingInterval::Monthly,
            NOW,
        );
        sub.payment_method_id = Some("pm_test".to_string());
        sub
    }

    #[test]
    fn trial_enrollment_sets_dates() {
        let sub = Subscription::new_trial(
            Uuid::new_v4(),
            "essentials",
            BillingInterval::Monthly,
            14,
            NOW,
        );
        let trial_end = datetime!(2026-08-20 00:00 UTC);
        assert_eq!(sub.status_str(), "trial");
        assert_eq!(sub.trial_end_date, Some(trial_end));
        assert_eq!(sub.next_billing_date, Some(trial_end));
        assert_eq!(sub.end_date, trial_end);
        assert!(sub.end_date >= sub.start_date);
    }

    #[test]
    fn payment_success_advances_one_interval_from_period_boundary() {
        let mut sub = active_sub();
        let first_end = sub.end_date;

        // Sweep runs three days late; the new period is still anchored at
        // the old period end.
        sub.next_billing_date = Some(first_end);
        sub.apply_transition(Transition::PaymentSucceeded {
            at: first_end + time::Duration::days(3),
        })
        .unwrap();

        assert_eq!(sub.end_date, BillingInterval::Monthly.advance(first_end));
        assert_eq!(sub.next_billing_date, Some(sub.end_date));
        assert_eq!(sub.status_str(), "active");
    }

    #[test]
    fn trial_conversion_advances_from_trial_end() {
        let mut sub = Subscription::new_trial(
            Uuid::new_v4(),
            "essentials",
            BillingInterval::Monthly,
            14,
            NOW,
        );
        sub.payment_method_id = Some("pm_test".to_string());
        let trial_end = sub.trial_end_date.unwrap();

        sub.apply_transition(Transition::PaymentSucceeded {
            at: trial_end + time::Duration::days(1),
        })
        .unwrap();

        assert_eq!(sub.status_str(), "active");
        assert_eq!(sub.end_date, BillingInterval::Monthly.advance(trial_end));
    }

    #[test]
    fn payment_failure_freezes_dates() {
        let mut sub = active_sub();
        let end_before = sub.end_date;

        sub.apply_transition(Transition::PaymentFailed { at: NOW }).unwrap();

        assert_eq!(sub.status_str(), "past_due");
        assert_eq!(sub.end_date, end_before);
        assert_eq!(sub.next_billing_date, Some(end_before));
    }

    #[test]
    fn past_due_keeps_original_delinquency_timestamp() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::PaymentFailed { at: NOW }).unwrap();
        sub.apply_transition(Transition::PaymentFailed {
            at: NOW + time::Duration::days(2),
        })
        .unwrap();

        assert_eq!(sub.state, SubscriptionState::PastDue { since: NOW });
    }

    #[test]
    fn past_due_recovery_advances_dates() {
        let mut sub = active_sub();
        let end_before = sub.end_date;
        sub.apply_transition(Transition::PaymentFailed { at: NOW }).unwrap();
        sub.apply_transition(Transition::PaymentSucceeded { at: NOW }).unwrap();

        assert_eq!(sub.status_str(), "active");
        assert_eq!(sub.end_date, BillingInterval::Monthly.advance(end_before));
    }

    #[test]
    fn plan_change_converts_trial_without_moving_dates() {
        let mut sub = Subscription::new_trial(
            Uuid::new_v4(),
            "essentials",
            BillingInterval::Monthly,
            14,
            NOW,
        );
        let trial_end = sub.trial_end_date.unwrap();

        sub.apply_transition(Transition::PlanChanged).unwrap();

        assert_eq!(sub.state, SubscriptionState::Active);
        assert_eq!(sub.end_date, trial_end);
        assert_eq!(sub.next_billing_date, Some(trial_end));
    }

    #[test]
    fn plan_change_rejected_when_past_due_or_cancelled() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::PaymentFailed { at: NOW }).unwrap();
        assert!(matches!(
            sub.apply_transition(Transition::PlanChanged),
            Err(BillingError::NotEligible(_))
        ));

        let mut sub = active_sub();
        sub.apply_transition(Transition::CancelNow {
            at: NOW,
            reason: CancelReason::Requested,
        })
        .unwrap();
        assert!(matches!(
            sub.apply_transition(Transition::PlanChanged),
            Err(BillingError::NotEligible(_))
        ));
    }

    #[test]
    fn schedule_cancellation_keeps_subscription_active() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::ScheduleCancellation).unwrap();

        assert_eq!(sub.status_str(), "active");
        assert!(sub.state.cancel_at_period_end());
        assert_eq!(
            sub.state,
            SubscriptionState::ActivePendingCancellation { at: sub.end_date }
        );
    }

    #[test]
    fn pending_cancellation_expires_into_cancelled() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::ScheduleCancellation).unwrap();

        let after_period = sub.end_date + time::Duration::days(1);
        sub.apply_transition(Transition::ExpirePendingCancellation { at: after_period })
            .unwrap();

        assert_eq!(sub.status_str(), "cancelled");
        assert_eq!(sub.next_billing_date, None);
        assert!(!sub.is_due(after_period + time::Duration::days(40)));
    }

    #[test]
    fn expiry_before_period_end_is_rejected() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::ScheduleCancellation).unwrap();

        let too_early = sub.end_date - time::Duration::days(5);
        let result = sub.apply_transition(Transition::ExpirePendingCancellation { at: too_early });
        assert!(matches!(result, Err(BillingError::NotEligible(_))));
        assert_eq!(sub.status_str(), "active");
    }

    #[test]
    fn immediate_cancel_clears_billing_date() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::CancelNow {
            at: NOW,
            reason: CancelReason::Requested,
        })
        .unwrap();

        assert_eq!(sub.status_str(), "cancelled");
        assert_eq!(sub.cancelled_at, Some(NOW));
        assert_eq!(sub.next_billing_date, None);
        assert!(!sub.state.cancel_at_period_end());
    }

    #[test]
    fn cancelled_is_terminal_for_payments() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::CancelNow {
            at: NOW,
            reason: CancelReason::AdminForced,
        })
        .unwrap();

        let paid = sub.apply_transition(Transition::PaymentSucceeded { at: NOW });
        assert!(matches!(paid, Err(BillingError::InvalidTransition(_))));
        assert_eq!(sub.status_str(), "cancelled");

        let failed = sub.apply_transition(Transition::PaymentFailed { at: NOW });
        assert!(matches!(failed, Err(BillingError::InvalidTransition(_))));
    }

    #[test]
    fn reactivate_pending_cancellation() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::ScheduleCancellation).unwrap();
        sub.apply_transition(Transition::Reactivate { now: NOW }).unwrap();

        assert_eq!(sub.state, SubscriptionState::Active);
        assert_eq!(sub.next_billing_date, Some(sub.end_date));
    }

    #[test]
    fn reactivate_period_end_cancellation_within_period() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::ScheduleCancellation).unwrap();
        // Expiry job ran, but the vendor changed their mind the same day and
        // the paid period runs a little longer.
        sub.end_date = NOW + time::Duration::days(3);
        sub.state = SubscriptionState::Cancelled {
            at: NOW,
            reason: CancelReason::PeriodEnd,
        };

        sub.apply_transition(Transition::Reactivate { now: NOW }).unwrap();
        assert_eq!(sub.state, SubscriptionState::Active);
    }

    #[test]
    fn reactivate_rejected_after_period_elapsed() {
        let mut sub = active_sub();
        sub.state = SubscriptionState::Cancelled {
            at: NOW,
            reason: CancelReason::PeriodEnd,
        };
        sub.end_date = NOW - time::Duration::days(1);

        let result = sub.apply_transition(Transition::Reactivate { now: NOW });
        assert!(matches!(result, Err(BillingError::NotEligible(_))));
    }

    #[test]
    fn reactivate_rejected_for_force_cancel() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::CancelNow {
            at: NOW,
            reason: CancelReason::AdminForced,
        })
        .unwrap();

        let result = sub.apply_transition(Transition::Reactivate { now: NOW });
        assert!(matches!(result, Err(BillingError::NotEligible(_))));
    }

    #[test]
    fn due_requires_payment_method() {
        let mut sub = active_sub();
        sub.next_billing_date = Some(NOW - time::Duration::days(1));
        assert!(sub.is_due(NOW));

        sub.payment_method_id = None;
        assert!(!sub.is_due(NOW));
    }

    #[test]
    fn pending_cancellation_is_not_due() {
        let mut sub = active_sub();
        sub.next_billing_date = Some(NOW - time::Duration::days(1));
        sub.apply_transition(Transition::ScheduleCancellation).unwrap();
        assert!(!sub.is_due(NOW));
    }

    #[test]
    fn extend_pushes_dates() {
        let mut sub = active_sub();
        let end_before = sub.end_date;
        sub.extend(10).unwrap();
        assert_eq!(sub.end_date, end_before + time::Duration::days(10));
        assert_eq!(sub.next_billing_date, Some(sub.end_date));
    }

    #[test]
    fn extend_trial_moves_trial_end() {
        let mut sub = Subscription::new_trial(
            Uuid::new_v4(),
            "essentials",
            BillingInterval::Monthly,
            14,
            NOW,
        );
        let trial_end = sub.trial_end_date.unwrap();
        sub.extend(7).unwrap();
        assert_eq!(sub.trial_end_date, Some(trial_end + time::Duration::days(7)));
        assert_eq!(sub.next_billing_date, sub.trial_end_date);
    }

    #[test]
    fn extend_rejected_when_cancelled() {
        let mut sub = active_sub();
        sub.apply_transition(Transition::CancelNow {
            at: NOW,
            reason: CancelReason::Requested,
        })
        .unwrap();
        assert!(sub.extend(5).is_err());
    }
}
