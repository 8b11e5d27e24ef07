//! Journal-driven feedback loop: journal → autopsy → next-day recommendation

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::autopsy::AutopsyAnalyzer;
use crate::database::{ActivityStore, AutopsyWrite};
use crate::error::{LoadRsError, Result};
use crate::generator::TextGenerator;
use crate::models::{Autopsy, JournalEntry};
use crate::recommendation::{RecommendationGenerator, RecommendationOutcome, RecommendationSettings};
use crate::service::MetricsService;

/// Where a (user, date) stands in the feedback loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutopsyState {
    NoAutopsy,
    AutopsyGenerated,
    RecommendationUpdated,
}

impl fmt::Display for AutopsyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AutopsyState::NoAutopsy => "no autopsy",
            AutopsyState::AutopsyGenerated => "autopsy generated",
            AutopsyState::RecommendationUpdated => "recommendation updated",
        };
        f.write_str(label)
    }
}

/// Result of saving a journal entry
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub state: AutopsyState,
    pub autopsy: Option<Autopsy>,
    pub recommendation: Option<RecommendationOutcome>,
}

pub struct FeedbackLoop<'a> {
    metrics: &'a MetricsService,
    generator: &'a dyn TextGenerator,
    settings: &'a RecommendationSettings,
}

impl<'a> FeedbackLoop<'a> {
    pub fn new(
        metrics: &'a MetricsService,
        generator: &'a dyn TextGenerator,
        settings: &'a RecommendationSettings,
    ) -> Self {
        Self {
            metrics,
            generator,
            settings,
        }
    }

    /// Persist a journal entry and advance the loop for its date
    ///
    /// An autopsy is only produced when the date has at least one activity. The
    /// autopsy object is handed straight to the next-day recommendation.
    pub fn save_journal_entry(&self, entry: &JournalEntry, today: NaiveDate) -> Result<FeedbackOutcome> {
        if let Some(effort) = entry.perceived_effort {
            if !(1..=10).contains(&effort) {
                return Err(LoadRsError::Validation(format!(
                    "perceived effort must be between 1 and 10, got {effort}"
                )));
            }
        }

        let store = self.metrics.store();
        store.save_journal_entry(entry)?;

        let activities = store.activities_between(&entry.user_id, entry.date, entry.date)?;
        if activities.is_empty() {
            tracing::debug!(user = %entry.user_id, date = %entry.date, "journal saved; no activity to review");
            return Ok(FeedbackOutcome {
                state: AutopsyState::NoAutopsy,
                autopsy: None,
                recommendation: None,
            });
        }

        let next_day = entry
            .date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| LoadRsError::Validation(format!("no day after {}", entry.date)))?;

        let autopsy = match AutopsyAnalyzer::new(self.metrics).analyze(&entry.user_id, entry.date)? {
            AutopsyWrite::Created(autopsy) => autopsy,
            AutopsyWrite::Existing(autopsy) => {
                // The hand-off may already have happened on an earlier save
                let handed_off = store
                    .load_recommendation(&entry.user_id, next_day)?
                    .map(|r| r.provenance.autopsy_id.is_some() && r.provenance.autopsy_id == autopsy.id)
                    .unwrap_or(false);
                if handed_off {
                    return Ok(FeedbackOutcome {
                        state: AutopsyState::RecommendationUpdated,
                        autopsy: Some(autopsy),
                        recommendation: None,
                    });
                }
                autopsy
            }
        };

        let generator = RecommendationGenerator::new(self.metrics, self.generator, self.settings);
        let recommendation = generator.generate(&entry.user_id, next_day, today, Some(&autopsy))?;

        let state = match &recommendation {
            RecommendationOutcome::Frozen(_) => AutopsyState::AutopsyGenerated,
            _ => AutopsyState::RecommendationUpdated,
        };
        tracing::info!(user = %entry.user_id, date = %entry.date, %state, "feedback loop advanced");

        Ok(FeedbackOutcome {
            state,
            autopsy: Some(autopsy),
            recommendation: Some(recommendation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::generator::UnavailableGenerator;
    use crate::models::{AcwrParameters, ActivityRecord, RecommendationSource};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, d).unwrap()
    }

    fn entry(date: NaiveDate, notes: &str) -> JournalEntry {
        JournalEntry {
            user_id: "u1".to_string(),
            date,
            notes: notes.to_string(),
            perceived_effort: Some(6),
            injury_flag: false,
        }
    }

    fn service_with_run(date: NaiveDate) -> MetricsService {
        let service = MetricsService::new(Arc::new(Database::open_in_memory().unwrap()), AcwrParameters::default());
        service
            .store()
            .upsert_activities(&[ActivityRecord {
                id: "run".to_string(),
                user_id: "u1".to_string(),
                date,
                duration_seconds: 2400,
                distance_meters: Some(Decimal::from(6000)),
                elevation_gain_meters: None,
                avg_heart_rate: None,
                max_heart_rate: None,
                trimp: None,
                external_load: None,
            }])
            .unwrap();
        service
    }

    #[test]
    fn test_journal_without_activity_stays_in_no_autopsy() {
        let service = service_with_run(day(1));
        let settings = RecommendationSettings::default();
        let feedback = FeedbackLoop::new(&service, &UnavailableGenerator, &settings);

        let outcome = feedback.save_journal_entry(&entry(day(5), "rest"), day(5)).unwrap();
        assert_eq!(outcome.state, AutopsyState::NoAutopsy);
        assert!(service.store().load_journal_entry("u1", day(5)).unwrap().is_some());
    }

    #[test]
    fn test_journal_with_activity_hands_off_autopsy() {
        let service = service_with_run(day(1));
        let settings = RecommendationSettings::default();
        let feedback = FeedbackLoop::new(&service, &UnavailableGenerator, &settings);

        let outcome = feedback.save_journal_entry(&entry(day(1), "felt good"), day(1)).unwrap();
        assert_eq!(outcome.state, AutopsyState::RecommendationUpdated);

        let autopsy = outcome.autopsy.unwrap();
        let recommendation = outcome.recommendation.unwrap().into_recommendation();
        assert_eq!(recommendation.target_date, day(2));
        assert_eq!(recommendation.provenance.autopsy_id, autopsy.id);
        assert!(recommendation.provenance.autopsy_informed);
        assert_eq!(recommendation.provenance.source, RecommendationSource::Templated);
    }

    #[test]
    fn test_second_save_does_not_regenerate() {
        let service = service_with_run(day(1));
        let settings = RecommendationSettings::default();
        let feedback = FeedbackLoop::new(&service, &UnavailableGenerator, &settings);

        let first = feedback.save_journal_entry(&entry(day(1), "felt good"), day(1)).unwrap();
        let second = feedback.save_journal_entry(&entry(day(1), "edited notes"), day(1)).unwrap();

        assert_eq!(second.state, AutopsyState::RecommendationUpdated);
        assert!(second.recommendation.is_none());
        assert_eq!(first.autopsy.unwrap().id, second.autopsy.unwrap().id);
    }

    #[test]
    fn test_perceived_effort_is_validated() {
        let service = service_with_run(day(1));
        let settings = RecommendationSettings::default();
        let feedback = FeedbackLoop::new(&service, &UnavailableGenerator, &settings);

        let mut bad = entry(day(1), "x");
        bad.perceived_effort = Some(11);
        assert!(matches!(
            feedback.save_journal_entry(&bad, day(1)),
            Err(LoadRsError::Validation(_))
        ));
    }
}
