//! Chronic-window configuration: validation, settings resolution, preview and commit

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, LoadRsError, Result};
use crate::models::{AcwrConfiguration, AcwrParameters, AthleteProfile, DailyLoadSnapshot, ReaggregationJob};
use crate::service::MetricsService;

pub const MIN_CHRONIC_WINDOW_DAYS: u16 = 28;
pub const MAX_CHRONIC_WINDOW_DAYS: u16 = 90;
pub const MIN_DECAY_RATE: Decimal = dec!(0);
pub const MAX_DECAY_RATE: Decimal = dec!(0.20);

pub const DEFAULT_CHRONIC_WINDOW_DAYS: u16 = 28;
pub const DEFAULT_DECAY_RATE: Decimal = dec!(0);

impl AcwrParameters {
    /// Validated parameter set; out-of-range values are rejected, never clamped
    pub fn new(chronic_window_days: u16, decay_rate: Decimal) -> std::result::Result<Self, ConfigurationError> {
        let parameters = Self {
            chronic_window_days,
            decay_rate,
        };
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        if !(MIN_CHRONIC_WINDOW_DAYS..=MAX_CHRONIC_WINDOW_DAYS).contains(&self.chronic_window_days) {
            return Err(ConfigurationError::ChronicWindowOutOfRange {
                value: self.chronic_window_days,
                min: MIN_CHRONIC_WINDOW_DAYS,
                max: MAX_CHRONIC_WINDOW_DAYS,
            });
        }
        if self.decay_rate < MIN_DECAY_RATE || self.decay_rate > MAX_DECAY_RATE {
            return Err(ConfigurationError::DecayRateOutOfRange {
                value: self.decay_rate,
                min: MIN_DECAY_RATE,
                max: MAX_DECAY_RATE,
            });
        }
        Ok(())
    }
}

impl Default for AcwrParameters {
    fn default() -> Self {
        Self {
            chronic_window_days: DEFAULT_CHRONIC_WINDOW_DAYS,
            decay_rate: DEFAULT_DECAY_RATE,
        }
    }
}

/// Which settings layer supplied a user's effective parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterSource {
    BoundConfiguration,
    LegacyProfile,
    ApplicationDefault,
}

/// Effective parameters for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParameters {
    pub parameters: AcwrParameters,

    /// Set only when the parameters come from a bound configuration row
    pub configuration_id: Option<i64>,

    pub source: ParameterSource,
}

/// Resolve effective parameters: bound configuration, then legacy profile field, then default
///
/// The legacy layout only stored a window length, so it resolves with zero decay.
/// A legacy window outside the supported range is skipped.
pub fn resolve_acwr_parameters(
    bound: Option<&AcwrConfiguration>,
    profile: Option<&AthleteProfile>,
    default: &AcwrParameters,
) -> ResolvedParameters {
    if let Some(configuration) = bound {
        return ResolvedParameters {
            parameters: configuration.parameters.clone(),
            configuration_id: Some(configuration.id),
            source: ParameterSource::BoundConfiguration,
        };
    }

    if let Some(window) = profile.and_then(|p| p.legacy_chronic_window_days) {
        match AcwrParameters::new(window, Decimal::ZERO) {
            Ok(parameters) => {
                return ResolvedParameters {
                    parameters,
                    configuration_id: None,
                    source: ParameterSource::LegacyProfile,
                }
            }
            Err(e) => tracing::warn!(window, error = %e, "ignoring legacy chronic window"),
        }
    }

    ResolvedParameters {
        parameters: default.clone(),
        configuration_id: None,
        source: ParameterSource::ApplicationDefault,
    }
}

/// Snapshots computed under a hypothetical configuration
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationPreview {
    pub user_id: String,
    pub parameters: AcwrParameters,
    pub snapshots: Vec<DailyLoadSnapshot>,
}

/// A committed configuration and the job it queued
#[derive(Debug, Clone, Serialize)]
pub struct CommitOutcome {
    pub configuration: AcwrConfiguration,
    pub job: ReaggregationJob,
}

/// Preview and commit of per-user chronic-window settings
pub struct ConfigurationService<'a> {
    metrics: &'a MetricsService,
}

impl<'a> ConfigurationService<'a> {
    pub fn new(metrics: &'a MetricsService) -> Self {
        Self { metrics }
    }

    /// Compute snapshots under hypothetical parameters without persisting or rebinding
    pub fn preview(
        &self,
        user_id: &str,
        chronic_window_days: u16,
        decay_rate: Decimal,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ConfigurationPreview> {
        let parameters = AcwrParameters::new(chronic_window_days, decay_rate)?;
        let snapshots = self.metrics.preview(user_id, &parameters, start, end)?;

        tracing::info!(
            user = user_id,
            window = chronic_window_days,
            decay = %decay_rate,
            days = snapshots.len(),
            "configuration previewed"
        );

        Ok(ConfigurationPreview {
            user_id: user_id.to_string(),
            parameters,
            snapshots,
        })
    }

    /// Create a new immutable configuration, bind it and queue re-aggregation
    pub fn commit(
        &self,
        user_id: &str,
        name: &str,
        chronic_window_days: u16,
        decay_rate: Decimal,
    ) -> Result<CommitOutcome> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyName.into());
        }
        let parameters = AcwrParameters::new(chronic_window_days, decay_rate)?;

        let store = self.metrics.store();
        let now = Utc::now();
        let configuration = store.insert_configuration(name, &parameters, now)?;
        let job = store.bind_configuration(user_id, configuration.id, now)?;

        tracing::info!(
            user = user_id,
            configuration = configuration.id,
            job = job.id,
            "configuration committed"
        );

        Ok(CommitOutcome { configuration, job })
    }

    /// Rebind a user to an existing configuration row
    pub fn bind_existing(&self, user_id: &str, configuration_id: i64) -> Result<CommitOutcome> {
        let store = self.metrics.store();
        let configuration = store
            .load_configuration(configuration_id)?
            .ok_or(LoadRsError::ConfigurationInvalid(ConfigurationError::UnknownConfiguration(
                configuration_id,
            )))?;
        let job = store.bind_configuration(user_id, configuration.id, Utc::now())?;

        tracing::info!(user = user_id, configuration = configuration.id, "configuration rebound");
        Ok(CommitOutcome { configuration, job })
    }

    /// Parameters currently in effect for a user
    pub fn active(&self, user_id: &str) -> Result<ResolvedParameters> {
        self.metrics.resolve_parameters(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds() {
        assert!(matches!(
            AcwrParameters::new(27, Decimal::ZERO),
            Err(ConfigurationError::ChronicWindowOutOfRange { value: 27, .. })
        ));
        assert!(matches!(
            AcwrParameters::new(91, Decimal::ZERO),
            Err(ConfigurationError::ChronicWindowOutOfRange { value: 91, .. })
        ));
        assert!(AcwrParameters::new(28, Decimal::ZERO).is_ok());
        assert!(AcwrParameters::new(90, Decimal::ZERO).is_ok());
    }

    #[test]
    fn test_decay_bounds() {
        assert!(AcwrParameters::new(42, dec!(0.20)).is_ok());
        assert!(matches!(
            AcwrParameters::new(42, dec!(0.21)),
            Err(ConfigurationError::DecayRateOutOfRange { .. })
        ));
        assert!(AcwrParameters::new(42, dec!(-0.01)).is_err());
    }

    #[test]
    fn test_resolution_prefers_bound_configuration() {
        let bound = AcwrConfiguration {
            id: 7,
            name: "bound".to_string(),
            parameters: AcwrParameters::new(56, dec!(0.1)).unwrap(),
            created_at: Utc::now(),
        };
        let profile = AthleteProfile {
            legacy_chronic_window_days: Some(42),
            ..AthleteProfile::new("u1")
        };

        let resolved = resolve_acwr_parameters(Some(&bound), Some(&profile), &AcwrParameters::default());
        assert_eq!(resolved.source, ParameterSource::BoundConfiguration);
        assert_eq!(resolved.configuration_id, Some(7));
        assert_eq!(resolved.parameters.chronic_window_days, 56);
    }

    #[test]
    fn test_resolution_falls_back_to_legacy_then_default() {
        let profile = AthleteProfile {
            legacy_chronic_window_days: Some(42),
            ..AthleteProfile::new("u1")
        };
        let legacy = resolve_acwr_parameters(None, Some(&profile), &AcwrParameters::default());
        assert_eq!(legacy.source, ParameterSource::LegacyProfile);
        assert_eq!(legacy.parameters, AcwrParameters::new(42, Decimal::ZERO).unwrap());

        let broken = AthleteProfile {
            legacy_chronic_window_days: Some(14),
            ..AthleteProfile::new("u1")
        };
        let default = resolve_acwr_parameters(None, Some(&broken), &AcwrParameters::default());
        assert_eq!(default.source, ParameterSource::ApplicationDefault);
        assert_eq!(default.parameters.chronic_window_days, DEFAULT_CHRONIC_WINDOW_DAYS);

        let none = resolve_acwr_parameters(None, None, &AcwrParameters::default());
        assert_eq!(none.source, ParameterSource::ApplicationDefault);
    }
}
