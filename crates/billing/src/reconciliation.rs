//! Upgrade decision engine
//!
//! Pure functions: no I/O, no clock. Given the newly activated plan, the plan of
//! one existing active membership and the product policy, decide whether the
//! existing membership is superseded. Every candidate is decided on its own;
//! there is no ordering between candidates and no early exit.

use std::fmt;

use crate::models::{PlanTerms, PolicyFlags};

/// Why a candidate is canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// New price is higher
    Upgrade,
    /// Same price and the policy treats that as an upgrade
    SamePrice,
    /// New price is lower and the policy allows canceling on downgrade
    Downgrade,
}

/// Why a candidate is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    /// The existing plan is not recurring
    NotRenewal,
    /// The existing plan is free and the policy ignores free plans
    FreePlanIgnored,
    /// Same price and the policy does not treat that as an upgrade
    SamePrice,
    /// New price is lower; the higher tier runs until its period ends
    Downgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Cancel(CancelReason),
    Keep(KeepReason),
}

impl Decision {
    pub fn is_cancel(&self) -> bool {
        matches!(self, Decision::Cancel(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Decision::Cancel(CancelReason::Upgrade) => "cancel: upgrade",
            Decision::Cancel(CancelReason::SamePrice) => "cancel: same price treated as upgrade",
            Decision::Cancel(CancelReason::Downgrade) => "cancel: downgrade cancel allowed",
            Decision::Keep(KeepReason::NotRenewal) => "keep: existing plan is not a renewal plan",
            Decision::Keep(KeepReason::FreePlanIgnored) => "keep: free plan ignored",
            Decision::Keep(KeepReason::SamePrice) => "keep: same price",
            Decision::Keep(KeepReason::Downgrade) => "keep: downgrade",
        };
        f.write_str(label)
    }
}

/// Whether a newly activated plan can supersede anything at all
///
/// One-time purchases never cancel a recurring membership.
pub fn new_plan_qualifies(new_plan: PlanTerms) -> bool {
    new_plan.plan_type.is_renewal()
}

/// Decide the fate of one existing membership
///
/// Assumes [`new_plan_qualifies`] already held for `new_plan`.
pub fn decide(new_plan: PlanTerms, existing: PlanTerms, flags: PolicyFlags) -> Decision {
    if !existing.plan_type.is_renewal() {
        return Decision::Keep(KeepReason::NotRenewal);
    }

    if flags.ignore_free_plans && existing.price_cents == 0 {
        return Decision::Keep(KeepReason::FreePlanIgnored);
    }

    match new_plan.price_cents.cmp(&existing.price_cents) {
        std::cmp::Ordering::Greater => Decision::Cancel(CancelReason::Upgrade),
        std::cmp::Ordering::Equal if flags.treat_same_price_as_upgrade => {
            Decision::Cancel(CancelReason::SamePrice)
        }
        std::cmp::Ordering::Equal => Decision::Keep(KeepReason::SamePrice),
        std::cmp::Ordering::Less if flags.allow_downgrade_to_cancel => {
            Decision::Cancel(CancelReason::Downgrade)
        }
        std::cmp::Ordering::Less => Decision::Keep(KeepReason::Downgrade),
    }
}

/// Decide every candidate of a batch
///
/// Returns one decision per candidate in input order, or an empty list when the
/// new plan does not qualify.
pub fn decide_batch(
    new_plan: PlanTerms,
    candidates: &[PlanTerms],
    flags: PolicyFlags,
) -> Vec<Decision> {
    if !new_plan_qualifies(new_plan) {
        return Vec::new();
    }

    candidates
        .iter()
        .map(|existing| decide(new_plan, *existing, flags))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use upshift_shared::PlanType;

    fn renewal(price_cents: i64) -> PlanTerms {
        PlanTerms {
            plan_type: PlanType::Renewal,
            price_cents,
        }
    }

    fn one_time(price_cents: i64) -> PlanTerms {
        PlanTerms {
            plan_type: PlanType::OneTime,
            price_cents,
        }
    }

    fn all_flag_combinations() -> Vec<PolicyFlags> {
        let mut out = Vec::new();
        for ignore_free_plans in [false, true] {
            for treat_same_price_as_upgrade in [false, true] {
                for allow_downgrade_to_cancel in [false, true] {
                    out.push(PolicyFlags {
                        ignore_free_plans,
                        treat_same_price_as_upgrade,
                        allow_downgrade_to_cancel,
                    });
                }
            }
        }
        out
    }

    const PRICES: [i64; 7] = [0, 1, 999, 1000, 1999, 2000, 14995];

    #[test]
    fn test_higher_price_always_cancels() {
        for flags in all_flag_combinations() {
            for &old in &PRICES {
                for &new in PRICES.iter().filter(|&&p| p > old) {
                    let decision = decide(renewal(new), renewal(old), flags);
                    if flags.ignore_free_plans && old == 0 {
                        assert_eq!(decision, Decision::Keep(KeepReason::FreePlanIgnored));
                    } else {
                        assert_eq!(decision, Decision::Cancel(CancelReason::Upgrade));
                    }
                }
            }
        }
    }

    #[test]
    fn test_equal_price_cancels_only_when_configured() {
        for flags in all_flag_combinations() {
            for &price in PRICES.iter().filter(|&&p| p > 0) {
                let decision = decide(renewal(price), renewal(price), flags);
                assert_eq!(decision.is_cancel(), flags.treat_same_price_as_upgrade);
            }
        }
    }

    #[test]
    fn test_lower_price_cancels_only_when_downgrade_allowed() {
        for flags in all_flag_combinations() {
            for &old in PRICES.iter().filter(|&&p| p > 0) {
                for &new in PRICES.iter().filter(|&&p| p < old) {
                    let decision = decide(renewal(new), renewal(old), flags);
                    assert_eq!(decision.is_cancel(), flags.allow_downgrade_to_cancel);
                    if !flags.allow_downgrade_to_cancel {
                        assert_eq!(decision, Decision::Keep(KeepReason::Downgrade));
                    }
                }
            }
        }
    }

    #[test]
    fn test_non_renewal_existing_plan_is_kept() {
        for flags in all_flag_combinations() {
            assert_eq!(
                decide(renewal(5000), one_time(100), flags),
                Decision::Keep(KeepReason::NotRenewal)
            );
        }
    }

    #[test]
    fn test_one_time_new_plan_produces_no_decisions() {
        let candidates = [renewal(100), renewal(0), one_time(10)];
        for flags in all_flag_combinations() {
            assert!(decide_batch(one_time(99_999), &candidates, flags).is_empty());
        }
    }

    #[test]
    fn test_free_existing_plan_with_and_without_ignore() {
        let flags = PolicyFlags {
            ignore_free_plans: true,
            ..PolicyFlags::default()
        };
        assert_eq!(
            decide(renewal(1500), renewal(0), flags),
            Decision::Keep(KeepReason::FreePlanIgnored)
        );
        assert_eq!(
            decide(renewal(1500), renewal(0), PolicyFlags::default()),
            Decision::Cancel(CancelReason::Upgrade)
        );
    }

    #[test]
    fn test_batch_decides_candidates_independently() {
        let flags = PolicyFlags::default();
        let decisions = decide_batch(
            renewal(2000),
            &[renewal(1000), renewal(3000), renewal(2000), one_time(500)],
            flags,
        );
        assert_eq!(
            decisions,
            vec![
                Decision::Cancel(CancelReason::Upgrade),
                Decision::Keep(KeepReason::Downgrade),
                Decision::Keep(KeepReason::SamePrice),
                Decision::Keep(KeepReason::NotRenewal),
            ]
        );
    }
}
