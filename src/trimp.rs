//! Per-activity load annotation
//!
//! Internal load uses Banister's training impulse (TRIMP) with gender-specific
//! weighting. External load converts distance and climbing into an
//! equivalent-flat-kilometre figure.

use crate::models::{ActivityAnnotation, ActivityRecord, AthleteProfile, Gender};
use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;

/// Base multiplier applied to every TRIMP value
pub const TRIMP_BASE_CONSTANT: Decimal = dec!(0.64);

/// Exponential weighting for male athletes
pub const TRIMP_K_MALE: Decimal = dec!(1.92);

/// Exponential weighting for female athletes
pub const TRIMP_K_FEMALE: Decimal = dec!(1.67);

/// Elevation gain (meters) counted as one flat kilometre of external load
pub const METERS_CLIMB_PER_FLAT_KM: Decimal = dec!(100);

/// Why a TRIMP could not be computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimpUnavailable {
    MissingHeartRate,
    MissingProfile,
    InvalidHeartRateRange,
}

/// TRIMP calculation engine
pub struct TrimpCalculator;

impl TrimpCalculator {
    /// Gender-specific exponential constant; unspecified uses the average
    pub fn k_factor(gender: Gender) -> Decimal {
        match gender {
            Gender::Male => TRIMP_K_MALE,
            Gender::Female => TRIMP_K_FEMALE,
            Gender::Unspecified => (TRIMP_K_MALE + TRIMP_K_FEMALE) / dec!(2),
        }
    }

    /// Heart-rate-reserve fraction clamped to [0, 1]
    pub fn heart_rate_reserve_fraction(avg_hr: u16, resting_hr: u16, max_hr: u16) -> Option<Decimal> {
        if max_hr <= resting_hr {
            return None;
        }
        let fraction = (Decimal::from(avg_hr) - Decimal::from(resting_hr))
            / (Decimal::from(max_hr) - Decimal::from(resting_hr));
        Some(fraction.clamp(Decimal::ZERO, Decimal::ONE))
    }

    /// TRIMP = duration_min × HRr × e^(k × HRr) × 0.64
    pub fn calculate(
        record: &ActivityRecord,
        profile: Option<&AthleteProfile>,
    ) -> Result<Decimal, TrimpUnavailable> {
        let avg_hr = record
            .avg_heart_rate
            .filter(|hr| *hr > 0)
            .ok_or(TrimpUnavailable::MissingHeartRate)?;
        let profile = profile.ok_or(TrimpUnavailable::MissingProfile)?;
        let (resting_hr, max_hr) = match (profile.resting_hr, profile.max_hr) {
            (Some(resting), Some(max)) => (resting, max),
            _ => return Err(TrimpUnavailable::MissingProfile),
        };

        let fraction = Self::heart_rate_reserve_fraction(avg_hr, resting_hr, max_hr)
            .ok_or(TrimpUnavailable::InvalidHeartRateRange)?;
        let duration_minutes = Decimal::from(record.duration_seconds) / dec!(60);
        let weighting = (Self::k_factor(profile.gender) * fraction).exp();

        Ok(duration_minutes * fraction * weighting * TRIMP_BASE_CONSTANT)
    }

    /// TRIMP or None, logging the reason at debug level
    pub fn calculate_optional(
        record: &ActivityRecord,
        profile: Option<&AthleteProfile>,
    ) -> Option<Decimal> {
        match Self::calculate(record, profile) {
            Ok(trimp) => Some(trimp),
            Err(reason) => {
                tracing::debug!(activity = %record.id, ?reason, "TRIMP unavailable");
                None
            }
        }
    }
}

/// External load = distance_km + elevation_gain_m / 100
pub fn external_load(record: &ActivityRecord) -> Decimal {
    let distance_km = record.distance_meters.unwrap_or(Decimal::ZERO).max(Decimal::ZERO) / dec!(1000);
    let climb = record.elevation_gain_meters.unwrap_or(Decimal::ZERO).max(Decimal::ZERO)
        / METERS_CLIMB_PER_FLAT_KM;
    distance_km + climb
}

/// Compute both derived loads for one activity
pub fn annotate(record: &ActivityRecord, profile: Option<&AthleteProfile>) -> ActivityAnnotation {
    ActivityAnnotation {
        activity_id: record.id.clone(),
        trimp: TrimpCalculator::calculate_optional(record, profile),
        external_load: external_load(record),
    }
}

/// Return a copy of the record carrying its derived loads
pub fn annotated(record: &ActivityRecord, profile: Option<&AthleteProfile>) -> ActivityRecord {
    let annotation = annotate(record, profile);
    ActivityRecord {
        trimp: annotation.trimp,
        external_load: Some(annotation.external_load),
        ..record.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn create_test_profile(gender: Gender) -> AthleteProfile {
        AthleteProfile {
            resting_hr: Some(50),
            max_hr: Some(190),
            gender,
            ..AthleteProfile::new("athlete")
        }
    }

    fn create_test_activity(avg_hr: Option<u16>, duration_seconds: u32) -> ActivityRecord {
        ActivityRecord {
            id: "a1".to_string(),
            user_id: "athlete".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            duration_seconds,
            distance_meters: Some(dec!(10000)),
            elevation_gain_meters: Some(dec!(250)),
            avg_heart_rate: avg_hr,
            max_heart_rate: avg_hr.map(|hr| hr + 20),
            trimp: None,
            external_load: None,
        }
    }

    #[test]
    fn test_hr_reserve_fraction_is_clamped() {
        assert_eq!(
            TrimpCalculator::heart_rate_reserve_fraction(40, 50, 190),
            Some(Decimal::ZERO)
        );
        assert_eq!(
            TrimpCalculator::heart_rate_reserve_fraction(200, 50, 190),
            Some(Decimal::ONE)
        );
        assert_eq!(
            TrimpCalculator::heart_rate_reserve_fraction(120, 50, 190),
            Some(dec!(0.5))
        );
        assert_eq!(TrimpCalculator::heart_rate_reserve_fraction(120, 190, 190), None);
    }

    #[test]
    fn test_unspecified_gender_uses_average_constant() {
        assert_eq!(TrimpCalculator::k_factor(Gender::Unspecified), dec!(1.795));
    }

    #[test]
    fn test_trimp_matches_banister_formula() {
        let profile = create_test_profile(Gender::Male);
        let activity = create_test_activity(Some(120), 3600);

        let trimp = TrimpCalculator::calculate(&activity, Some(&profile)).unwrap();

        // 60 min × 0.5 × e^(0.96) × 0.64 ≈ 50.14
        let expected = dec!(60) * dec!(0.5) * dec!(0.96).exp() * dec!(0.64);
        assert!((trimp - expected).abs() < dec!(0.0000001));
        assert!(trimp > dec!(50) && trimp < dec!(50.3));
    }

    #[test]
    fn test_female_constant_yields_lower_trimp() {
        let activity = create_test_activity(Some(150), 3600);
        let male = TrimpCalculator::calculate(&activity, Some(&create_test_profile(Gender::Male))).unwrap();
        let female =
            TrimpCalculator::calculate(&activity, Some(&create_test_profile(Gender::Female))).unwrap();
        assert!(female < male);
    }

    #[test]
    fn test_missing_heart_rate_yields_null_trimp() {
        let profile = create_test_profile(Gender::Female);
        let activity = create_test_activity(None, 3600);

        assert_eq!(
            TrimpCalculator::calculate(&activity, Some(&profile)),
            Err(TrimpUnavailable::MissingHeartRate)
        );
        assert_eq!(annotate(&activity, Some(&profile)).trimp, None);
    }

    #[test]
    fn test_missing_profile_yields_null_trimp() {
        let activity = create_test_activity(Some(140), 3600);
        assert_eq!(
            TrimpCalculator::calculate(&activity, None),
            Err(TrimpUnavailable::MissingProfile)
        );
    }

    #[test]
    fn test_external_load_counts_climbing() {
        let activity = create_test_activity(Some(140), 3600);
        // 10 km + 250 m / 100
        assert_eq!(external_load(&activity), dec!(12.5));

        let bare = ActivityRecord {
            distance_meters: None,
            elevation_gain_meters: None,
            ..activity
        };
        assert_eq!(external_load(&bare), Decimal::ZERO);
    }

    #[test]
    fn test_annotated_copy_keeps_raw_fields() {
        let profile = create_test_profile(Gender::Male);
        let activity = create_test_activity(Some(140), 1800);
        let copy = annotated(&activity, Some(&profile));

        assert_eq!(copy.id, activity.id);
        assert_eq!(copy.external_load, Some(dec!(12.5)));
        assert!(copy.trimp.is_some());
    }

    proptest! {
        #[test]
        fn test_trimp_properties(
            avg_hr in 30u16..230u16,
            duration in 60u32..20000u32
        ) {
            let profile = create_test_profile(Gender::Unspecified);
            let activity = create_test_activity(Some(avg_hr), duration);

            let trimp = TrimpCalculator::calculate(&activity, Some(&profile)).unwrap();

            // TRIMP is never negative and bounded by the all-out case
            prop_assert!(trimp >= Decimal::ZERO);
            let minutes = Decimal::from(duration) / dec!(60);
            let ceiling = minutes * dec!(1.795).exp() * TRIMP_BASE_CONSTANT;
            prop_assert!(trimp <= ceiling + dec!(0.000001));
        }
    }
}
