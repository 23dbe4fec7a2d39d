//! Plan catalog
//!
//! The catalog is an injected, versioned configuration object: plan prices
//! can change without recompiling the engine, and tests substitute fixtures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::util::days_in_year_month;
use time::{Date, Month, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

/// Billing interval for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "monthly" => Ok(BillingInterval::Monthly),
            "yearly" => Ok(BillingInterval::Yearly),
            other => Err(BillingError::Validation(format!(
                "Invalid billing interval '{}'. Valid intervals are: monthly, yearly",
                other
            ))),
        }
    }

    /// Advance a timestamp by one billing interval.
    ///
    /// Day-of-month is clamped to the target month (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: OffsetDateTime) -> OffsetDateTime {
        let date = from.date();
        let (year, month) = match self {
            BillingInterval::Monthly => {
                let next = date.month().next();
                let year = if next == Month::January {
                    date.year() + 1
                } else {
                    date.year()
                };
                (year, next)
            }
            BillingInterval::Yearly => (date.year() + 1, date.month()),
        };
        let day = date.day().min(days_in_year_month(year, month));
        // Day is clamped to the target month, so construction cannot fail.
        let advanced = Date::from_calendar_date(year, month, day).unwrap_or(date);
        from.replace_date(advanced)
    }

    /// Nominal number of days in one interval, used for proration denominators
    /// when the caller does not supply the actual period length.
    pub fn nominal_days(&self) -> i64 {
        match self {
            BillingInterval::Monthly => 30,
            BillingInterval::Yearly => 365,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Usage limits attached to a plan tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_services: u32,
    pub max_portfolio_items: u32,
    pub max_bookings_per_month: u32,
    pub max_messages_per_month: u32,
    #[serde(default)]
    pub featured_placement: bool,
    #[serde(default)]
    pub analytics_access: bool,
}

/// A single plan tier definition. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    /// Stable plan identifier referenced by subscriptions
    pub id: String,
    pub display_name: String,
    /// Price per month, smallest currency unit
    pub monthly_price_cents: i64,
    /// Price per year, smallest currency unit
    pub yearly_price_cents: i64,
    /// Trial length in days; 0 means the plan offers no trial
    pub trial_days: u32,
    pub limits: PlanLimits,
}

impl PlanDefinition {
    pub fn price_for(&self, interval: BillingInterval) -> i64 {
        match interval {
            BillingInterval::Monthly => self.monthly_price_cents,
            BillingInterval::Yearly => self.yearly_price_cents,
        }
    }
}

/// Versioned plan catalog, injected into the engine at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCatalog {
    /// Catalog document version, bumped whenever prices change
    pub version: u32,
    plans: HashMap<String, PlanDefinition>,
}

impl PlanCatalog {
    pub fn new(version: u32, plans: Vec<PlanDefinition>) -> Self {
        let plans = plans.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self { version, plans }
    }

    /// Parse a catalog from a JSON document of the shape
    /// `{"version": 3, "plans": [...]}`
    pub fn from_json_str(raw: &str) -> BillingResult<Self> {
        #[derive(Deserialize)]
        struct Document {
            version: u32,
            plans: Vec<PlanDefinition>,
        }
        let doc: Document = serde_json::from_str(raw)
            .map_err(|e| BillingError::Config(format!("Invalid plan catalog document: {}", e)))?;
        if doc.plans.is_empty() {
            return Err(BillingError::Config(
                "Plan catalog document contains no plans".to_string(),
            ));
        }
        Ok(Self::new(doc.version, doc.plans))
    }

    pub fn get(&self, plan_id: &str) -> Option<&PlanDefinition> {
        self.plans.get(plan_id)
    }

    /// Resolve a plan or fail with an `UnknownPlan` validation error
    pub fn resolve(&self, plan_id: &str) -> BillingResult<&PlanDefinition> {
        self.get(plan_id)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))
    }

    pub fn price_for(&self, plan_id: &str, interval: BillingInterval) -> BillingResult<i64> {
        Ok(self.resolve(plan_id)?.price_for(interval))
    }

    pub fn plan_ids(&self) -> impl Iterator<Item = &str> {
        self.plans.keys().map(String::as_str)
    }

    /// Built-in tier set used when no catalog document is configured
    pub fn default_tiers() -> Self {
        Self::new(
            1,
            vec![
                PlanDefinition {
                    id: "essentials".to_string(),
                    display_name: "Essentials".to_string(),
                    monthly_price_cents: 49_900,
                    yearly_price_cents: 499_000,
                    trial_days: 14,
                    limits: PlanLimits {
                        max_services: 5,
                        max_portfolio_items: 20,
                        max_bookings_per_month: 25,
                        max_messages_per_month: 200,
                        featured_placement: false,
                        analytics_access: false,
                    },
                },
                PlanDefinition {
                    id: "featured".to_string(),
                    display_name: "Featured".to_string(),
                    monthly_price_cents: 99_900,
                    yearly_price_cents: 999_000,
                    trial_days: 14,
                    limits: PlanLimits {
                        max_services: 20,
                        max_portfolio_items: 100,
                        max_bookings_per_month: 100,
                        max_messages_per_month: 1_000,
                        featured_placement: true,
                        analytics_access: false,
                    },
                },
                PlanDefinition {
                    id: "premium".to_string(),
                    display_name: "Premium".to_string(),
                    monthly_price_cents: 199_900,
                    yearly_price_cents: 1_999_000,
                    trial_days: 30,
                    limits: PlanLimits {
                        max_services: u32::MAX,
                        max_portfolio_items: u32::MAX,
                        max_bookings_per_month: u32::MAX,
                        max_messages_per_month: u32::MAX,
                        featured_placement: true,
                        analytics_access: true,
                    },
                },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn advance_monthly_clamps_day() {
        let jan31 = datetime!(2026-01-31 00:00 UTC);
        assert_eq!(
            BillingInterval::Monthly.advance(jan31),
            datetime!(2026-02-28 00:00 UTC)
        );

        let jan31_leap = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(
            BillingInterval::Monthly.advance(jan31_leap),
            datetime!(2024-02-29 00:00 UTC)
        );
    }

    #[test]
    fn advance_monthly_rolls_year() {
        let dec15 = datetime!(2026-12-15 08:30 UTC);
        assert_eq!(
            BillingInterval::Monthly.advance(dec15),
            datetime!(2027-01-15 08:30 UTC)
        );
    }

    #[test]
    fn advance_yearly_clamps_leap_day() {
        let feb29 = datetime!(2024-02-29 00:00 UTC);
        assert_eq!(
            BillingInterval::Yearly.advance(feb29),
            datetime!(2025-02-28 00:00 UTC)
        );
    }

    #[test]
    fn parse_rejects_unknown_interval() {
        assert!(BillingInterval::parse("weekly").is_err());
        assert_eq!(
            BillingInterval::parse("monthly").ok(),
            Some(BillingInterval::Monthly)
        );
    }

    #[test]
    fn catalog_resolves_plans_and_prices() {
        let catalog = PlanCatalog::default_tiers();
        assert!(catalog.get("featured").is_some());
        assert!(catalog.get("nonexistent").is_none());
        assert_eq!(
            catalog
                .price_for("essentials", BillingInterval::Monthly)
                .ok(),
            Some(49_900)
        );
        assert!(matches!(
            catalog.price_for("nonexistent", BillingInterval::Monthly),
            Err(BillingError::UnknownPlan(_))
        ));
    }

    #[test]
    fn catalog_parses_json_document() {
        let raw = r#"{
            "version": 7,
            "plans": [{
                "id": "basic",
                "display_name": "Basic",
                "monthly_price_cents": 10000,
                "yearly_price_cents": 100000,
                "trial_days": 7,
                "limits": {
                    "max_services": 3,
                    "max_portfolio_items": 10,
                    "max_bookings_per_month": 10,
                    "max_messages_per_month": 50
                }
            }]
        }"#;
        let catalog = PlanCatalog::from_json_str(raw).unwrap();
        assert_eq!(catalog.version, 7);
        assert_eq!(catalog.resolve("basic").unwrap().trial_days, 7);
    }

    #[test]
    fn catalog_rejects_empty_document() {
        assert!(PlanCatalog::from_json_str(r#"{"version":1,"plans":[]}"#).is_err());
    }
}
