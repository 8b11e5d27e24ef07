use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Athlete gender, selects the TRIMP weighting constant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unspecified,
}

/// Declared appetite for load progression
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskTolerance {
    Conservative,
    #[default]
    Moderate,
    Aggressive,
}

/// Preferred voice of generated guidance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tone {
    #[default]
    Supportive,
    Direct,
    Analytical,
}

/// User preferences surfaced to recommendation generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub risk_tolerance: RiskTolerance,
    pub tone: Tone,
}

/// Physiological profile needed for internal-load calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthleteProfile {
    /// User identifier
    pub user_id: String,

    /// Resting heart rate in beats per minute
    pub resting_hr: Option<u16>,

    /// Maximum heart rate in beats per minute
    pub max_hr: Option<u16>,

    /// Gender for TRIMP weighting
    pub gender: Gender,

    /// Chronic window stored by the previous settings layout
    pub legacy_chronic_window_days: Option<u16>,

    /// Guidance preferences
    pub preferences: UserPreferences,
}

impl AthleteProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            resting_hr: None,
            max_hr: None,
            gender: Gender::Unspecified,
            legacy_chronic_window_days: None,
            preferences: UserPreferences::default(),
        }
    }
}

/// One synced endurance session
///
/// Immutable once synced; a re-sync replaces the whole record. The derived
/// `trimp` and `external_load` fields are annotations written back by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Identifier assigned by the tracking service
    pub id: String,

    /// Owner of the activity
    pub user_id: String,

    /// Local calendar date of the activity
    pub date: NaiveDate,

    /// Moving duration in seconds
    pub duration_seconds: u32,

    /// Distance in meters
    pub distance_meters: Option<Decimal>,

    /// Total elevation gain in meters
    pub elevation_gain_meters: Option<Decimal>,

    /// Average heart rate in beats per minute
    pub avg_heart_rate: Option<u16>,

    /// Maximum heart rate reached in beats per minute
    pub max_heart_rate: Option<u16>,

    /// Derived training impulse, null without heart-rate data
    pub trimp: Option<Decimal>,

    /// Derived external load
    pub external_load: Option<Decimal>,
}

/// Derived loads written back to the activity store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityAnnotation {
    pub activity_id: String,
    pub trimp: Option<Decimal>,
    pub external_load: Decimal,
}

/// Per-day load totals for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLoad {
    /// Date of the training day
    pub date: NaiveDate,

    /// Sum of external load across the day's activities
    pub external_load: Decimal,

    /// Sum of TRIMP across activities that have one; None when none do
    pub internal_load: Option<Decimal>,

    /// Number of activities on this day
    pub activity_count: u16,
}

/// Derived acute/chronic metrics for one (user, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLoadSnapshot {
    pub user_id: String,
    pub date: NaiveDate,

    /// Configuration the snapshot was computed under; None for previews
    pub configuration_id: Option<i64>,

    pub acute_external: Option<Decimal>,
    pub chronic_external: Option<Decimal>,
    pub acute_internal: Option<Decimal>,
    pub chronic_internal: Option<Decimal>,

    pub external_acwr: Option<Decimal>,
    pub internal_acwr: Option<Decimal>,

    /// Normalized divergence between the two ratios
    pub divergence: Option<Decimal>,

    /// Days of the chronic window that fall within the user's history
    pub chronic_days_available: u16,

    /// Set when the chronic window is not yet fully covered by history
    pub low_confidence: bool,
}

/// Validated chronic-window parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcwrParameters {
    /// Chronic window length in days
    pub chronic_window_days: u16,

    /// Exponential decay rate per day; zero means a plain mean
    pub decay_rate: Decimal,
}

/// Persisted, immutable parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcwrConfiguration {
    pub id: i64,
    pub name: String,
    pub parameters: AcwrParameters,
    pub created_at: DateTime<Utc>,
}

/// Binding of a user to one active configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAcwrConfiguration {
    pub user_id: String,
    pub configuration_id: i64,
    pub bound_at: DateTime<Utc>,
}

/// Lifecycle of a queued re-aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Re-aggregation queued by a configuration commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaggregationJob {
    pub id: i64,
    pub user_id: String,
    pub configuration_id: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Free-text journal for one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub user_id: String,
    pub date: NaiveDate,
    pub notes: String,

    /// Perceived effort on a 1-10 scale
    pub perceived_effort: Option<u8>,

    /// Explicit injury or medical flag set by the user
    pub injury_flag: bool,
}

/// Reply layout the text-generation collaborator used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyFormat {
    /// `DAILY RECOMMENDATION:` style headings
    Plain,
    /// `**Daily Recommendation**` style headings
    Decorated,
    /// `## Daily Recommendation` style headings
    Markdown,
    /// No heading layout matched
    Unrecognized,
}

/// Where the recommendation text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendationSource {
    /// Parsed from a collaborator reply
    Generated,
    /// Built from metrics after the collaborator failed
    Templated,
}

/// Provenance recorded with every recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationProvenance {
    pub autopsy_informed: bool,
    pub autopsy_id: Option<i64>,
    pub source: RecommendationSource,
    pub reply_format: Option<ReplyFormat>,
}

/// Guidance for one (user, target date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Option<i64>,
    pub user_id: String,
    pub target_date: NaiveDate,
    pub daily: String,
    pub weekly_context: String,
    pub pattern_insight: String,
    pub provenance: RecommendationProvenance,

    /// Metrics the guidance was based on
    pub metrics: Option<DailyLoadSnapshot>,

    pub generated_at: DateTime<Utc>,
}

/// Coarse session intensity used to compare plan and behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Intensity {
    Rest,
    Easy,
    Moderate,
    Hard,
}

impl Intensity {
    pub fn level(&self) -> i8 {
        match self {
            Intensity::Rest => 0,
            Intensity::Easy => 1,
            Intensity::Moderate => 2,
            Intensity::Hard => 3,
        }
    }
}

/// Alignment between a recommendation and what happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentScore {
    /// No recommendation targeted the date
    NotApplicable,
    /// Score on a 1-10 scale
    Scored(u8),
}

impl AlignmentScore {
    pub fn value(&self) -> Option<u8> {
        match self {
            AlignmentScore::NotApplicable => None,
            AlignmentScore::Scored(score) => Some(*score),
        }
    }
}

/// Behavior pattern detected by an autopsy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectedPattern {
    Aligned,
    Overreach,
    UnderExecution,
    InjurySignal,
    /// Activity happened without a recommendation to compare against
    Unplanned,
}

/// Structured learning consumed by the next recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutopsyLearning {
    pub intended: Option<Intensity>,
    pub actual: Intensity,

    /// actual level minus intended level
    pub level_gap: Option<i8>,

    /// Injury-bearing sentences from the journal
    pub injury_signal: Option<String>,

    pub guidance: String,
}

/// Retrospective comparison for one (user, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Autopsy {
    pub id: Option<i64>,
    pub user_id: String,
    pub date: NaiveDate,
    pub recommendation_id: Option<i64>,
    pub activity_ids: Vec<String>,
    pub journal_linked: bool,
    pub alignment: AlignmentScore,
    pub analysis: String,
    pub pattern: DetectedPattern,
    pub learning: AutopsyLearning,
    pub created_at: DateTime<Utc>,
}

/// Outcome recorded for one migration batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    Completed,
    Failed,
}

/// Progress marker for one batch of a migration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub run_id: String,
    pub batch_index: usize,

    /// SHA-256 of the batch inputs; a resumed run only skips batches whose inputs match
    pub fingerprint: String,

    pub status: CheckpointStatus,
    pub users_processed: usize,
    pub users_failed: usize,
    pub updated_at: DateTime<Utc>,
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($name::$variant => $text,)+
                };
                f.write_str(text)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $(t if t == $text.to_lowercase() => Ok($name::$variant),)+
                    _ => Err(format!("Unknown {}: {}", stringify!($name), s)),
                }
            }
        }
    };
}

string_enum!(Gender {
    Male => "Male",
    Female => "Female",
    Unspecified => "Unspecified",
});

string_enum!(RiskTolerance {
    Conservative => "Conservative",
    Moderate => "Moderate",
    Aggressive => "Aggressive",
});

string_enum!(Tone {
    Supportive => "Supportive",
    Direct => "Direct",
    Analytical => "Analytical",
});

string_enum!(JobStatus {
    Pending => "Pending",
    Running => "Running",
    Completed => "Completed",
    Failed => "Failed",
});

string_enum!(ReplyFormat {
    Plain => "Plain",
    Decorated => "Decorated",
    Markdown => "Markdown",
    Unrecognized => "Unrecognized",
});

string_enum!(RecommendationSource {
    Generated => "Generated",
    Templated => "Templated",
});

string_enum!(CheckpointStatus {
    Completed => "Completed",
    Failed => "Failed",
});

string_enum!(Intensity {
    Rest => "Rest",
    Easy => "Easy",
    Moderate => "Moderate",
    Hard => "Hard",
});

string_enum!(DetectedPattern {
    Aligned => "Aligned",
    Overreach => "Overreach",
    UnderExecution => "UnderExecution",
    InjurySignal => "InjurySignal",
    Unplanned => "Unplanned",
});

impl fmt::Display for AlignmentScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentScore::NotApplicable => f.write_str("not applicable"),
            AlignmentScore::Scored(score) => write!(f, "{}/10", score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_enum_round_trip_is_case_insensitive() {
        assert_eq!("female".parse::<Gender>().unwrap(), Gender::Female);
        assert_eq!("UNRECOGNIZED".parse::<ReplyFormat>().unwrap(), ReplyFormat::Unrecognized);
        assert_eq!(JobStatus::Completed.to_string(), "Completed");
        assert!("sideways".parse::<Intensity>().is_err());
    }

    #[test]
    fn test_alignment_display() {
        assert_eq!(AlignmentScore::NotApplicable.to_string(), "not applicable");
        assert_eq!(AlignmentScore::Scored(7).to_string(), "7/10");
        assert_eq!(AlignmentScore::NotApplicable.value(), None);
    }

    #[test]
    fn test_intensity_levels_are_ordered() {
        assert!(Intensity::Rest < Intensity::Hard);
        assert_eq!(Intensity::Hard.level() - Intensity::Easy.level(), 2);
    }
}
