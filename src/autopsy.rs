//! Retrospective comparison of a day's recommendation against what happened

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::database::{ActivityStore, AutopsyWrite};
use crate::error::Result;
use crate::models::{
    ActivityRecord, AlignmentScore, Autopsy, AutopsyLearning, DetectedPattern, Intensity, JournalEntry,
    Recommendation,
};
use crate::service::MetricsService;
use crate::trimp;

/// Words that mark a sentence as injury or medical relevant
pub const INJURY_TERMS: &[&str] = &[
    "pain",
    "painful",
    "injury",
    "injured",
    "hurt",
    "hurts",
    "hurting",
    "strain",
    "strained",
    "sprain",
    "sprained",
    "swelling",
    "swollen",
    "tendon",
    "tendonitis",
    "tendinitis",
    "fracture",
    "limp",
    "limping",
    "numb",
    "numbness",
    "dizzy",
    "faint",
    "physio",
    "doctor",
    "medical",
];

const REST_KEYWORDS: &[&str] = &["rest", "off"];
const HARD_KEYWORDS: &[&str] = &[
    "interval", "intervals", "threshold", "tempo", "hard", "race", "vo2max", "sprint", "sprints", "hills",
];
const EASY_KEYWORDS: &[&str] = &["easy", "recovery", "light", "gentle", "shakeout"];
const MODERATE_KEYWORDS: &[&str] = &["moderate", "steady", "endurance", "aerobic"];

const EASY_RATIO_CEILING: Decimal = dec!(0.8);
const MODERATE_RATIO_CEILING: Decimal = dec!(1.3);
const EASY_MINUTES_CEILING: u32 = 45;
const MODERATE_MINUTES_CEILING: u32 = 90;
const HARD_PERCEIVED_EFFORT: u8 = 8;

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Byte spans of sentences, split on terminal punctuation and line breaks
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (idx, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = idx + c.len_utf8();
            if !text[start..end].trim().is_empty() {
                spans.push((start, end));
            }
            start = end;
        }
    }
    if !text[start..].trim().is_empty() {
        spans.push((start, text.len()));
    }
    spans
}

pub fn mentions_injury(text: &str) -> bool {
    words(text).any(|w| INJURY_TERMS.contains(&w.as_str()))
}

/// Sentences containing injury terms, in order
pub fn injury_sentences(text: &str) -> Vec<String> {
    sentence_spans(text)
        .into_iter()
        .map(|(start, end)| text[start..end].trim())
        .filter(|sentence| mentions_injury(sentence))
        .map(str::to_string)
        .collect()
}

/// Byte offset just past the last injury-bearing sentence
pub fn last_injury_sentence_end(text: &str) -> Option<usize> {
    sentence_spans(text)
        .into_iter()
        .filter(|(start, end)| mentions_injury(&text[*start..*end]))
        .map(|(_, end)| end)
        .last()
}

/// Injury signal from a journal entry: explicit flag or injury wording
pub fn journal_injury_signal(entry: &JournalEntry) -> Option<String> {
    let sentences = injury_sentences(&entry.notes);
    if !sentences.is_empty() {
        return Some(sentences.join(" "));
    }
    if entry.injury_flag {
        let notes = entry.notes.trim();
        return Some(if notes.is_empty() {
            "Injury flag set in journal".to_string()
        } else {
            notes.to_string()
        });
    }
    None
}

/// Intensity the recommendation asked for, read from its daily section
///
/// The first keyword found wins, so "rest or an easy walk" reads as rest.
pub fn intended_intensity(daily: &str) -> Intensity {
    for word in words(daily) {
        let word = word.as_str();
        if REST_KEYWORDS.contains(&word) {
            return Intensity::Rest;
        }
        if HARD_KEYWORDS.contains(&word) {
            return Intensity::Hard;
        }
        if EASY_KEYWORDS.contains(&word) {
            return Intensity::Easy;
        }
        if MODERATE_KEYWORDS.contains(&word) {
            return Intensity::Moderate;
        }
    }
    Intensity::Moderate
}

/// Intensity actually performed on the day
///
/// Relative to the chronic external baseline when there is one, otherwise by
/// total duration. A perceived effort of 8 or more always counts as hard.
pub fn actual_intensity(
    activities: &[ActivityRecord],
    chronic_external: Option<Decimal>,
    journal: Option<&JournalEntry>,
) -> Intensity {
    if activities.is_empty() {
        return Intensity::Rest;
    }

    let day_load: Decimal = activities
        .iter()
        .map(|a| a.external_load.unwrap_or_else(|| trimp::external_load(a)))
        .sum();

    let measured = match chronic_external.filter(|c| !c.is_zero()) {
        Some(chronic) => {
            let ratio = day_load / chronic;
            if ratio < EASY_RATIO_CEILING {
                Intensity::Easy
            } else if ratio < MODERATE_RATIO_CEILING {
                Intensity::Moderate
            } else {
                Intensity::Hard
            }
        }
        None => {
            let minutes: u32 = activities.iter().map(|a| a.duration_seconds / 60).sum();
            if minutes < EASY_MINUTES_CEILING {
                Intensity::Easy
            } else if minutes < MODERATE_MINUTES_CEILING {
                Intensity::Moderate
            } else {
                Intensity::Hard
            }
        }
    };

    match journal.and_then(|j| j.perceived_effort) {
        Some(effort) if effort >= HARD_PERCEIVED_EFFORT => Intensity::Hard,
        _ => measured,
    }
}

/// 10 for a match, 3 points off per intensity level missed, never below 1
pub fn alignment_score(intended: Intensity, actual: Intensity) -> u8 {
    let gap = (actual.level() - intended.level()).unsigned_abs();
    10u8.saturating_sub(3 * gap).max(1)
}

fn detect_pattern(has_recommendation: bool, level_gap: Option<i8>, injury: bool) -> DetectedPattern {
    if injury {
        return DetectedPattern::InjurySignal;
    }
    match (has_recommendation, level_gap) {
        (false, _) | (_, None) => DetectedPattern::Unplanned,
        (true, Some(gap)) if gap > 0 => DetectedPattern::Overreach,
        (true, Some(gap)) if gap < 0 => DetectedPattern::UnderExecution,
        _ => DetectedPattern::Aligned,
    }
}

fn guidance_for(pattern: DetectedPattern, actual: Intensity) -> String {
    match pattern {
        DetectedPattern::InjurySignal => {
            "Injury or medical signal reported: prioritise rest and recovery, and only resume load once symptoms clear"
                .to_string()
        }
        DetectedPattern::Overreach => format!(
            "Went harder than planned ({}): keep the next session deliberately easy to absorb the extra load",
            actual.to_string().to_lowercase()
        ),
        DetectedPattern::UnderExecution => {
            "Did less than planned: check fatigue and motivation before adding load back".to_string()
        }
        DetectedPattern::Aligned => "Plan and execution matched: continue the current progression".to_string(),
        DetectedPattern::Unplanned => format!(
            "Unplanned {} session logged: factor it into the next recommendation",
            actual.to_string().to_lowercase()
        ),
    }
}

/// Inputs observed for one (user, date)
pub struct AutopsyInputs<'a> {
    pub user_id: &'a str,
    pub date: NaiveDate,
    pub recommendation: Option<&'a Recommendation>,
    pub activities: &'a [ActivityRecord],
    pub journal: Option<&'a JournalEntry>,
    pub chronic_external: Option<Decimal>,
}

/// Build an autopsy from observed inputs; pure
pub fn assess(inputs: &AutopsyInputs<'_>) -> Autopsy {
    let actual = actual_intensity(inputs.activities, inputs.chronic_external, inputs.journal);
    let intended = inputs.recommendation.map(|r| intended_intensity(&r.daily));
    let level_gap = intended.map(|i| actual.level() - i.level());
    let injury_signal = inputs.journal.and_then(journal_injury_signal);

    let alignment = match intended {
        Some(intended) => AlignmentScore::Scored(alignment_score(intended, actual)),
        None => AlignmentScore::NotApplicable,
    };
    let pattern = detect_pattern(inputs.recommendation.is_some(), level_gap, injury_signal.is_some());

    let mut analysis = match intended {
        Some(intended) => format!(
            "Recommended {} and performed {}; alignment {}.",
            intended.to_string().to_lowercase(),
            actual.to_string().to_lowercase(),
            alignment
        ),
        None => format!(
            "No recommendation targeted this day; performed {}.",
            actual.to_string().to_lowercase()
        ),
    };
    if !inputs.activities.is_empty() {
        analysis.push_str(&format!(" {} activity(ies) logged.", inputs.activities.len()));
    }
    if let Some(effort) = inputs.journal.and_then(|j| j.perceived_effort) {
        analysis.push_str(&format!(" Perceived effort {}/10.", effort));
    }
    if let Some(signal) = &injury_signal {
        analysis.push_str(&format!(" Journal reports: {}", signal));
    }

    Autopsy {
        id: None,
        user_id: inputs.user_id.to_string(),
        date: inputs.date,
        recommendation_id: inputs.recommendation.and_then(|r| r.id),
        activity_ids: inputs.activities.iter().map(|a| a.id.clone()).collect(),
        journal_linked: inputs.journal.is_some(),
        alignment,
        analysis,
        pattern,
        learning: AutopsyLearning {
            intended,
            actual,
            level_gap,
            injury_signal,
            guidance: guidance_for(pattern, actual),
        },
        created_at: Utc::now(),
    }
}

/// Gathers a day's evidence from the store and persists the autopsy once
pub struct AutopsyAnalyzer<'a> {
    metrics: &'a MetricsService,
}

impl<'a> AutopsyAnalyzer<'a> {
    pub fn new(metrics: &'a MetricsService) -> Self {
        Self { metrics }
    }

    /// Analyze a date; a second call for the same date returns the stored autopsy
    pub fn analyze(&self, user_id: &str, date: NaiveDate) -> Result<AutopsyWrite> {
        let store = self.metrics.store();
        if let Some(existing) = store.load_autopsy(user_id, date)? {
            tracing::debug!(user = user_id, %date, "autopsy already exists");
            return Ok(AutopsyWrite::Existing(existing));
        }

        let recommendation = store.load_recommendation(user_id, date)?;
        let activities = store.activities_between(user_id, date, date)?;
        let journal = store.load_journal_entry(user_id, date)?;
        let snapshot = self.metrics.snapshot_for(user_id, date)?;

        let autopsy = assess(&AutopsyInputs {
            user_id,
            date,
            recommendation: recommendation.as_ref(),
            activities: &activities,
            journal: journal.as_ref(),
            chronic_external: snapshot.chronic_external,
        });

        let written = store.insert_autopsy(&autopsy)?;
        if let AutopsyWrite::Created(created) = &written {
            tracing::info!(
                user = user_id,
                %date,
                autopsy = ?created.id,
                alignment = %created.alignment,
                pattern = %created.pattern,
                "autopsy generated"
            );
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecommendationProvenance, RecommendationSource};

    fn activity(km: i64, minutes: u32) -> ActivityRecord {
        ActivityRecord {
            id: format!("a{km}"),
            user_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            duration_seconds: minutes * 60,
            distance_meters: Some(Decimal::from(km * 1000)),
            elevation_gain_meters: None,
            avg_heart_rate: None,
            max_heart_rate: None,
            trimp: None,
            external_load: None,
        }
    }

    fn journal(notes: &str, effort: Option<u8>, injury_flag: bool) -> JournalEntry {
        JournalEntry {
            user_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            notes: notes.to_string(),
            perceived_effort: effort,
            injury_flag,
        }
    }

    fn recommendation(daily: &str) -> Recommendation {
        Recommendation {
            id: Some(11),
            user_id: "u1".to_string(),
            target_date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            daily: daily.to_string(),
            weekly_context: String::new(),
            pattern_insight: String::new(),
            provenance: RecommendationProvenance {
                autopsy_informed: false,
                autopsy_id: None,
                source: RecommendationSource::Generated,
                reply_format: None,
            },
            metrics: None,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_intended_intensity_keywords() {
        assert_eq!(intended_intensity("Rest day, maybe an easy walk"), Intensity::Rest);
        assert_eq!(intended_intensity("6 x 800m intervals at threshold"), Intensity::Hard);
        assert_eq!(intended_intensity("Easy 40 minute recovery jog"), Intensity::Easy);
        assert_eq!(intended_intensity("Steady endurance ride"), Intensity::Moderate);
        assert_eq!(intended_intensity("Go outside"), Intensity::Moderate);
        // Whole words only
        assert_eq!(intended_intensity("Restorative yoga then easy spin"), Intensity::Easy);
    }

    #[test]
    fn test_actual_intensity_relative_to_baseline() {
        let baseline = Some(dec!(10));
        assert_eq!(actual_intensity(&[], baseline, None), Intensity::Rest);
        assert_eq!(actual_intensity(&[activity(5, 30)], baseline, None), Intensity::Easy);
        assert_eq!(actual_intensity(&[activity(10, 60)], baseline, None), Intensity::Moderate);
        assert_eq!(actual_intensity(&[activity(13, 70)], baseline, None), Intensity::Hard);
    }

    #[test]
    fn test_actual_intensity_without_baseline_uses_duration() {
        assert_eq!(actual_intensity(&[activity(5, 30)], None, None), Intensity::Easy);
        assert_eq!(actual_intensity(&[activity(5, 60)], None, None), Intensity::Moderate);
        assert_eq!(actual_intensity(&[activity(5, 120)], Some(Decimal::ZERO), None), Intensity::Hard);
    }

    #[test]
    fn test_high_perceived_effort_counts_as_hard() {
        let entry = journal("legs heavy", Some(9), false);
        assert_eq!(actual_intensity(&[activity(5, 30)], Some(dec!(10)), Some(&entry)), Intensity::Hard);
    }

    #[test]
    fn test_alignment_score_scale() {
        assert_eq!(alignment_score(Intensity::Easy, Intensity::Easy), 10);
        assert_eq!(alignment_score(Intensity::Easy, Intensity::Moderate), 7);
        assert_eq!(alignment_score(Intensity::Rest, Intensity::Moderate), 4);
        assert_eq!(alignment_score(Intensity::Rest, Intensity::Hard), 1);
    }

    #[test]
    fn test_injury_sentences() {
        let text = "Great run overall. Left knee pain after 5k! Will ice tonight.";
        assert_eq!(injury_sentences(text), vec!["Left knee pain after 5k!".to_string()]);
        assert!(mentions_injury("I am INJURED"));
        assert!(!mentions_injury("painting the fence"));
        assert_eq!(last_injury_sentence_end(text), Some(text.find('!').unwrap() + 1));
    }

    #[test]
    fn test_assess_without_recommendation_is_not_applicable() {
        let activities = [activity(10, 50)];
        let autopsy = assess(&AutopsyInputs {
            user_id: "u1",
            date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            recommendation: None,
            activities: &activities,
            journal: None,
            chronic_external: Some(dec!(10)),
        });

        assert_eq!(autopsy.alignment, AlignmentScore::NotApplicable);
        assert_eq!(autopsy.pattern, DetectedPattern::Unplanned);
        assert_eq!(autopsy.learning.level_gap, None);
        assert!(!autopsy.journal_linked);
    }

    #[test]
    fn test_assess_detects_overreach() {
        let activities = [activity(20, 100)];
        let rec = recommendation("Easy recovery run, 30 minutes");
        let autopsy = assess(&AutopsyInputs {
            user_id: "u1",
            date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            recommendation: Some(&rec),
            activities: &activities,
            journal: None,
            chronic_external: Some(dec!(10)),
        });

        assert_eq!(autopsy.recommendation_id, Some(11));
        assert_eq!(autopsy.alignment, AlignmentScore::Scored(4));
        assert_eq!(autopsy.pattern, DetectedPattern::Overreach);
        assert_eq!(autopsy.learning.level_gap, Some(2));
    }

    #[test]
    fn test_injury_overrides_other_patterns() {
        let activities = [activity(5, 30)];
        let rec = recommendation("Easy 30 minutes");
        let entry = journal("Felt fine until the end. Sharp pain in my achilles.", Some(4), false);
        let autopsy = assess(&AutopsyInputs {
            user_id: "u1",
            date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            recommendation: Some(&rec),
            activities: &activities,
            journal: Some(&entry),
            chronic_external: Some(dec!(10)),
        });

        assert_eq!(autopsy.pattern, DetectedPattern::InjurySignal);
        assert_eq!(
            autopsy.learning.injury_signal.as_deref(),
            Some("Sharp pain in my achilles.")
        );
        assert!(autopsy.analysis.contains("achilles"));
    }

    #[test]
    fn test_injury_flag_without_wording() {
        let entry = journal("", None, true);
        assert_eq!(journal_injury_signal(&entry).as_deref(), Some("Injury flag set in journal"));
        assert_eq!(journal_injury_signal(&journal("all good", None, false)), None);
    }
}
