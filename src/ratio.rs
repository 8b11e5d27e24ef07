//! Acute:chronic workload ratio and normalized divergence
//!
//! Degenerate inputs resolve to `None` here and are never raised as errors:
//! a zero chronic baseline has no ratio, and two ratios that are both zero
//! (or cancel each other out) carry no divergence signal.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// |external + internal| below this is treated as cancelling
pub const DIVERGENCE_SUM_EPSILON: Decimal = dec!(0.0001);

/// ACWR = acute / chronic; None when either side is missing or chronic is zero
pub fn acwr(acute: Option<Decimal>, chronic: Option<Decimal>) -> Option<Decimal> {
    match (acute, chronic) {
        (Some(acute), Some(chronic)) if !chronic.is_zero() => Some(acute / chronic),
        _ => None,
    }
}

/// How a divergence request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceCase {
    /// One of the ratios was null
    MissingInput,
    /// Both ratios were exactly zero
    NoSignal,
    /// The ratios nearly cancel, the mean denominator would blow up
    NearCancelling,
    /// Regular value
    Computed(Decimal),
}

impl DivergenceCase {
    pub fn value(&self) -> Option<Decimal> {
        match self {
            DivergenceCase::Computed(value) => Some(*value),
            _ => None,
        }
    }
}

/// Resolve (external − internal) / mean(external, internal) with the null policy
///
/// Checks run in priority order: missing input, both zero, near-cancelling sum.
pub fn classify_divergence(external: Option<Decimal>, internal: Option<Decimal>) -> DivergenceCase {
    let (external, internal) = match (external, internal) {
        (Some(external), Some(internal)) => (external, internal),
        _ => return DivergenceCase::MissingInput,
    };

    if external.is_zero() && internal.is_zero() {
        return DivergenceCase::NoSignal;
    }

    let sum = external + internal;
    if sum.abs() < DIVERGENCE_SUM_EPSILON {
        return DivergenceCase::NearCancelling;
    }

    DivergenceCase::Computed((external - internal) / (sum / dec!(2)))
}

/// Normalized divergence, never clamped
pub fn divergence(external: Option<Decimal>, internal: Option<Decimal>) -> Option<Decimal> {
    classify_divergence(external, internal).value()
}

/// ACWR risk bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskZone {
    /// Below 0.8: detraining
    Undertrained,
    /// 0.8 to 1.3
    Optimal,
    /// 1.3 to 1.5
    Caution,
    /// Above 1.5: spike in load
    HighRisk,
}

impl RiskZone {
    pub fn from_acwr(ratio: Decimal) -> Self {
        if ratio < dec!(0.8) {
            RiskZone::Undertrained
        } else if ratio <= dec!(1.3) {
            RiskZone::Optimal
        } else if ratio <= dec!(1.5) {
            RiskZone::Caution
        } else {
            RiskZone::HighRisk
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RiskZone::Undertrained => "Load is well below your baseline (detraining risk)",
            RiskZone::Optimal => "Load is in the productive range",
            RiskZone::Caution => "Load is climbing faster than your baseline supports",
            RiskZone::HighRisk => "Load spike well above your baseline (elevated injury risk)",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            RiskZone::Undertrained => "Build gradually with an extra easy session this week",
            RiskZone::Optimal => "Continue the current progression",
            RiskZone::Caution => "Hold volume steady and keep intensity controlled",
            RiskZone::HighRisk => "Reduce load and prioritise recovery for the next few days",
        }
    }
}

impl fmt::Display for RiskZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskZone::Undertrained => "undertrained",
            RiskZone::Optimal => "optimal",
            RiskZone::Caution => "caution",
            RiskZone::HighRisk => "high risk",
        };
        f.write_str(label)
    }
}

/// User-facing label for a ratio, never a misleading zero
pub fn describe_ratio(value: Option<Decimal>, chronic_days_available: u16, low_confidence: bool) -> String {
    match value {
        None if chronic_days_available == 0 => "not enough data yet".to_string(),
        None => "no signal".to_string(),
        Some(value) if low_confidence => format!("{:.2} (low confidence)", value),
        Some(value) => format!("{:.2}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_acwr_worked_example() {
        assert_eq!(acwr(Some(dec!(40)), Some(dec!(32))), Some(dec!(1.25)));
    }

    #[test]
    fn test_acwr_undefined_for_zero_chronic() {
        assert_eq!(acwr(Some(dec!(10)), Some(Decimal::ZERO)), None);
        assert_eq!(acwr(Some(Decimal::ZERO), Some(Decimal::ZERO)), None);
        assert_eq!(acwr(None, Some(dec!(10))), None);
        assert_eq!(acwr(Some(dec!(10)), None), None);
    }

    #[test]
    fn test_divergence_worked_example() {
        let value = divergence(Some(dec!(1.25)), Some(dec!(0.90))).unwrap();
        // 0.35 / 1.075
        assert_eq!(value.round_dp(3), dec!(0.326));
    }

    #[test]
    fn test_divergence_null_policy_priority() {
        assert_eq!(classify_divergence(None, Some(Decimal::ZERO)), DivergenceCase::MissingInput);
        assert_eq!(
            classify_divergence(Some(Decimal::ZERO), Some(Decimal::ZERO)),
            DivergenceCase::NoSignal
        );
        assert_eq!(
            classify_divergence(Some(dec!(0.5)), Some(dec!(-0.49999))),
            DivergenceCase::NearCancelling
        );
        assert!(matches!(
            classify_divergence(Some(dec!(0.5)), Some(dec!(-0.4))),
            DivergenceCase::Computed(_)
        ));
    }

    #[test]
    fn test_divergence_is_not_clamped() {
        // Internal at zero, external positive: exactly 2
        assert_eq!(divergence(Some(dec!(1.2)), Some(Decimal::ZERO)), Some(dec!(2)));
        // Opposite signs outside the cancel band grow past the usual range
        let wide = divergence(Some(dec!(1)), Some(dec!(-0.9))).unwrap();
        assert!(wide > dec!(2));
    }

    #[test]
    fn test_risk_zone_boundaries() {
        assert_eq!(RiskZone::from_acwr(dec!(0.79)), RiskZone::Undertrained);
        assert_eq!(RiskZone::from_acwr(dec!(0.8)), RiskZone::Optimal);
        assert_eq!(RiskZone::from_acwr(dec!(1.3)), RiskZone::Optimal);
        assert_eq!(RiskZone::from_acwr(dec!(1.45)), RiskZone::Caution);
        assert_eq!(RiskZone::from_acwr(dec!(1.51)), RiskZone::HighRisk);
    }

    #[test]
    fn test_describe_ratio_states() {
        assert_eq!(describe_ratio(None, 0, true), "not enough data yet");
        assert_eq!(describe_ratio(None, 12, true), "no signal");
        assert_eq!(describe_ratio(Some(dec!(1.254)), 10, true), "1.25 (low confidence)");
        assert_eq!(describe_ratio(Some(dec!(0.9)), 28, false), "0.90");
    }

    proptest! {
        #[test]
        fn test_equal_positive_ratios_have_zero_divergence(raw in 1i64..1_000_000i64) {
            let ratio = Decimal::new(raw, 4);
            prop_assert_eq!(divergence(Some(ratio), Some(ratio)), Some(Decimal::ZERO));
        }

        #[test]
        fn test_divergence_is_antisymmetric(a in 1i64..100_000i64, b in 1i64..100_000i64) {
            let external = Decimal::new(a, 4);
            let internal = Decimal::new(b, 4);
            let forward = divergence(Some(external), Some(internal)).unwrap();
            let backward = divergence(Some(internal), Some(external)).unwrap();
            prop_assert_eq!(forward, -backward);
        }
    }
}
