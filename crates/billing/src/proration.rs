//! Proration calculator
//!
//! Pure computation of the amount owed when a subscription changes plan
//! mid-period. Downgrades floor at zero: unused value reduces future billing
//! only, never produces a negative transaction.

/// Compute the prorated charge for a mid-period plan change, in the smallest
/// currency unit.
///
/// `charge = max(0, round(days_remaining/total_days * new_price)
///               - round(days_remaining/total_days * current_price))`
///
/// Degenerate inputs are clamped: a non-positive `total_days` yields 0, and
/// `days_remaining` is clamped into `[0, total_days]`.
pub fn proration_charge(
    current_price_cents: i64,
    new_price_cents: i64,
    days_remaining: i64,
    total_days: i64,
) -> i64 {
    if total_days <= 0 {
        return 0;
    }
    let days_remaining = days_remaining.clamp(0, total_days);
    let fraction = days_remaining as f64 / total_days as f64;

    let new_portion = (fraction * new_price_cents as f64).round() as i64;
    let current_portion = (fraction * current_price_cents as f64).round() as i64;

    (new_portion - current_portion).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_mid_cycle() {
        // 30-day cycle, 10 days remaining, 100 -> 300
        assert_eq!(proration_charge(100, 300, 10, 30), 67);
    }

    #[test]
    fn equal_prices_charge_nothing() {
        for days in 0..=30 {
            assert_eq!(proration_charge(99_900, 99_900, days, 30), 0);
        }
    }

    #[test]
    fn downgrade_floors_at_zero() {
        assert_eq!(proration_charge(300, 100, 10, 30), 0);
        assert_eq!(proration_charge(199_900, 49_900, 29, 30), 0);
    }

    #[test]
    fn full_period_remaining_charges_full_difference() {
        assert_eq!(proration_charge(100, 300, 30, 30), 200);
    }

    #[test]
    fn no_days_remaining_charges_nothing() {
        assert_eq!(proration_charge(100, 300, 0, 30), 0);
    }

    #[test]
    fn degenerate_inputs_clamped() {
        assert_eq!(proration_charge(100, 300, 10, 0), 0);
        assert_eq!(proration_charge(100, 300, 10, -5), 0);
        // days_remaining beyond the period clamps to the full period
        assert_eq!(proration_charge(100, 300, 45, 30), 200);
        // negative days_remaining clamps to zero
        assert_eq!(proration_charge(100, 300, -3, 30), 0);
    }

    #[test]
    fn charge_is_never_negative() {
        let prices = [0i64, 1, 33, 100, 49_900, 199_900];
        for &current in &prices {
            for &new in &prices {
                for days in [0i64, 1, 7, 15, 29, 30] {
                    assert!(proration_charge(current, new, days, 30) >= 0);
                }
            }
        }
    }
}
