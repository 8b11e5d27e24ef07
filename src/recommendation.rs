//! Recommendation generation: context building, reply parsing and persistence

use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::autopsy::{journal_injury_signal, last_injury_sentence_end};
use crate::database::RecommendationWrite;
use crate::error::{CollaboratorError, Result};
use crate::generator::{GenerationParams, GenerationRequest, TextGenerator};
use crate::models::{
    AlignmentScore, Autopsy, DailyLoadSnapshot, JournalEntry, Recommendation, RecommendationProvenance,
    RecommendationSource, ReplyFormat, UserPreferences,
};
use crate::ratio::{describe_ratio, RiskZone};
use crate::service::MetricsService;

/// Collaborator calls per recommendation: the first try plus one retry
///
/// An error, an empty reply or an unparseable reply each use up one call.
const MAX_ATTEMPTS: usize = 2;

/// Recent-insight length limits keyed on how badly the day went
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightTruncationPolicy {
    /// Scores at or below this are severe misses
    pub severe_score_max: u8,
    pub severe_limit: usize,
    /// Scores at or below this (and above severe) are moderate misses
    pub moderate_score_max: u8,
    pub moderate_limit: usize,
    /// Good alignment or no score
    pub mild_limit: usize,
}

impl Default for InsightTruncationPolicy {
    fn default() -> Self {
        Self {
            severe_score_max: 3,
            severe_limit: 1000,
            moderate_score_max: 6,
            moderate_limit: 600,
            mild_limit: 300,
        }
    }
}

impl InsightTruncationPolicy {
    pub fn limit_for(&self, alignment: AlignmentScore) -> usize {
        match alignment.value() {
            Some(score) if score <= self.severe_score_max => self.severe_limit,
            Some(score) if score <= self.moderate_score_max => self.moderate_limit,
            _ => self.mild_limit,
        }
    }

    /// Shorten an insight, never cutting into an injury-bearing sentence
    pub fn truncate(&self, text: &str, alignment: AlignmentScore) -> String {
        let text = text.trim();
        let protected_end = last_injury_sentence_end(text).unwrap_or(0);
        let limit = self
            .limit_for(alignment)
            .max(text[..protected_end].chars().count());

        if text.chars().count() <= limit {
            return text.to_string();
        }

        let cut = text
            .char_indices()
            .nth(limit)
            .map(|(idx, _)| idx)
            .unwrap_or(text.len());
        let head = &text[..cut];
        let head = match head.rfind(char::is_whitespace) {
            Some(space) if space > 0 && space >= protected_end => &head[..space],
            _ => head,
        };
        format!("{}...", head.trim_end())
    }
}

/// `[recommendation]` section of the application config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationSettings {
    /// Recent autopsies included in the context
    pub history_limit: usize,
    /// Days of journal entries scanned for injury signals
    pub journal_window_days: u16,
    pub truncation: InsightTruncationPolicy,
    /// Filled from the `[generator]` section
    #[serde(skip)]
    pub params: GenerationParams,
}

impl Default for RecommendationSettings {
    fn default() -> Self {
        Self {
            history_limit: 3,
            journal_window_days: 7,
            truncation: InsightTruncationPolicy::default(),
            params: GenerationParams::default(),
        }
    }
}

/// Everything the collaborator is told about a user
#[derive(Debug, Clone)]
pub struct RecommendationContext {
    pub user_id: String,
    pub target_date: NaiveDate,
    pub metrics: DailyLoadSnapshot,
    pub preferences: UserPreferences,
    /// Autopsy produced moments ago, passed in rather than re-read
    pub fresh_autopsy: Option<Autopsy>,
    pub recent_autopsies: Vec<Autopsy>,
    pub recent_journal: Vec<JournalEntry>,
}

impl RecommendationContext {
    /// Injury or medical signals, highest priority first
    pub fn injury_signals(&self) -> Vec<String> {
        let mut signals = Vec::new();
        if let Some(signal) = self
            .fresh_autopsy
            .as_ref()
            .and_then(|a| a.learning.injury_signal.clone())
        {
            signals.push(signal);
        }
        for entry in &self.recent_journal {
            if let Some(signal) = journal_injury_signal(entry) {
                let line = format!("{}: {}", entry.date, signal);
                if !signals.iter().any(|s| s.contains(&signal)) {
                    signals.push(line);
                }
            }
        }
        signals
    }

    /// Source autopsy for provenance: the fresh one, else the most recent on file
    pub fn informing_autopsy(&self) -> Option<&Autopsy> {
        self.fresh_autopsy.as_ref().or_else(|| self.recent_autopsies.first())
    }

    /// Render the prompt; sections appear in decision-priority order
    pub fn to_prompt(&self, policy: &InsightTruncationPolicy) -> String {
        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "You are an endurance coach writing guidance for {} (training on {}).",
            self.user_id, self.target_date
        );
        let _ = writeln!(
            prompt,
            "Reply with exactly three sections headed DAILY RECOMMENDATION:, WEEKLY CONTEXT: and PATTERN INSIGHT:."
        );
        let _ = writeln!(prompt, "Follow the priorities below in order; a higher priority always wins.");

        let _ = writeln!(prompt, "\n1. SAFETY SIGNALS (override every other consideration)");
        let signals = self.injury_signals();
        if signals.is_empty() {
            let _ = writeln!(prompt, "- none reported");
        } else {
            for signal in &signals {
                let _ = writeln!(prompt, "- {}", signal);
            }
            let _ = writeln!(
                prompt,
                "- Recommend rest or very light activity and suggest professional advice if symptoms persist."
            );
        }

        let _ = writeln!(prompt, "\n2. LESSON FROM THE LAST SESSION");
        match &self.fresh_autopsy {
            Some(autopsy) => {
                let _ = writeln!(prompt, "- {} (alignment {})", autopsy.learning.guidance, autopsy.alignment);
                let _ = writeln!(prompt, "- {}", policy.truncate(&autopsy.analysis, autopsy.alignment));
            }
            None => {
                let _ = writeln!(prompt, "- no fresh session review");
            }
        }

        let m = &self.metrics;
        let _ = writeln!(prompt, "\n3. CURRENT LOAD METRICS ({})", m.date);
        let _ = writeln!(
            prompt,
            "- external ACWR: {}",
            describe_ratio(m.external_acwr, m.chronic_days_available, m.low_confidence)
        );
        let _ = writeln!(
            prompt,
            "- internal ACWR: {}",
            describe_ratio(m.internal_acwr, m.chronic_days_available, m.low_confidence)
        );
        let _ = writeln!(
            prompt,
            "- divergence: {}",
            describe_ratio(m.divergence, m.chronic_days_available, m.low_confidence)
        );
        if let Some(ratio) = m.external_acwr {
            let zone = RiskZone::from_acwr(ratio);
            let _ = writeln!(prompt, "- risk zone: {} ({})", zone, zone.description());
        }

        let _ = writeln!(prompt, "\n4. PREFERENCES");
        let _ = writeln!(prompt, "- risk tolerance: {}", self.preferences.risk_tolerance);
        let _ = writeln!(prompt, "- tone: {}", self.preferences.tone);

        if !self.recent_autopsies.is_empty() {
            let _ = writeln!(prompt, "\nRECENT INSIGHTS");
            for autopsy in &self.recent_autopsies {
                let _ = writeln!(
                    prompt,
                    "- {} [{}, {}]: {}",
                    autopsy.date,
                    autopsy.pattern,
                    autopsy.alignment,
                    policy.truncate(&autopsy.analysis, autopsy.alignment)
                );
            }
        }

        prompt
    }
}

/// The three sections of a reply and the layout they were found in
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub daily: String,
    pub weekly_context: String,
    pub pattern_insight: String,
    pub format: ReplyFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Daily,
    Weekly,
    Pattern,
}

fn section_for(label: &str) -> Option<Section> {
    let label = label.trim().trim_end_matches(':').trim().to_lowercase();
    match label.as_str() {
        "daily recommendation" | "daily" => Some(Section::Daily),
        "weekly context" | "weekly planning" | "weekly" => Some(Section::Weekly),
        "pattern insight" | "pattern insights" | "pattern" => Some(Section::Pattern),
        _ => None,
    }
}

/// `DAILY RECOMMENDATION: text`
fn plain_heading(line: &str) -> Option<(Section, String)> {
    let line = line.trim();
    if line.starts_with('#') || line.starts_with('*') {
        return None;
    }
    let (label, rest) = line.split_once(':')?;
    section_for(label).map(|section| (section, rest.trim().to_string()))
}

/// `**Daily Recommendation** text` or `**Daily Recommendation:** text`
fn decorated_heading(line: &str) -> Option<(Section, String)> {
    let inner = line.trim().strip_prefix("**")?;
    let close = inner.find("**")?;
    let section = section_for(&inner[..close])?;
    let rest = inner[close + 2..].trim().trim_start_matches(':').trim();
    Some((section, rest.to_string()))
}

/// `## Daily Recommendation`
fn markdown_heading(line: &str) -> Option<(Section, String)> {
    let line = line.trim();
    if !line.starts_with('#') {
        return None;
    }
    let heading = line.trim_start_matches('#').replace('*', "");
    let (label, rest) = heading.split_once(':').unwrap_or((heading.as_str(), ""));
    section_for(label).map(|section| (section, rest.trim().to_string()))
}

fn parse_with(reply: &str, heading: fn(&str) -> Option<(Section, String)>) -> Option<(String, String, String)> {
    let mut daily: Option<Vec<String>> = None;
    let mut weekly: Option<Vec<String>> = None;
    let mut pattern: Option<Vec<String>> = None;
    let mut current: Option<Section> = None;

    for line in reply.lines() {
        if let Some((section, inline)) = heading(line) {
            current = Some(section);
            let slot = match section {
                Section::Daily => &mut daily,
                Section::Weekly => &mut weekly,
                Section::Pattern => &mut pattern,
            };
            let lines = slot.get_or_insert_with(Vec::new);
            if !inline.is_empty() {
                lines.push(inline);
            }
            continue;
        }

        let slot = match current {
            Some(Section::Daily) => &mut daily,
            Some(Section::Weekly) => &mut weekly,
            Some(Section::Pattern) => &mut pattern,
            None => continue,
        };
        if let Some(lines) = slot.as_mut() {
            lines.push(line.to_string());
        }
    }

    let join = |lines: Vec<String>| lines.join("\n").trim().to_string();
    let (daily, weekly, pattern) = (join(daily?), join(weekly?), join(pattern?));
    if daily.is_empty() || weekly.is_empty() || pattern.is_empty() {
        return None;
    }
    Some((daily, weekly, pattern))
}

/// Split a reply into sections, trying plain, decorated then markdown headings
///
/// When no layout yields all three sections the whole reply becomes the daily section.
pub fn parse_reply(reply: &str) -> ParsedReply {
    let matchers: [(ReplyFormat, fn(&str) -> Option<(Section, String)>); 3] = [
        (ReplyFormat::Plain, plain_heading),
        (ReplyFormat::Decorated, decorated_heading),
        (ReplyFormat::Markdown, markdown_heading),
    ];

    for (format, matcher) in matchers {
        if let Some((daily, weekly_context, pattern_insight)) = parse_with(reply, matcher) {
            tracing::debug!(%format, "reply parsed");
            return ParsedReply {
                daily,
                weekly_context,
                pattern_insight,
                format,
            };
        }
    }

    tracing::warn!(bytes = reply.len(), "reply layout unrecognized; using whole reply as daily guidance");
    ParsedReply {
        daily: reply.trim().to_string(),
        weekly_context: String::new(),
        pattern_insight: String::new(),
        format: ReplyFormat::Unrecognized,
    }
}

/// Metrics-only recommendation used when the collaborator fails
pub fn templated_sections(context: &RecommendationContext) -> (String, String, String) {
    let m = &context.metrics;
    let signals = context.injury_signals();

    let daily = if !signals.is_empty() {
        format!(
            "Take a rest day. You reported: {} Only resume training once symptoms have cleared, and seek professional advice if they persist.",
            signals.join(" ")
        )
    } else {
        match m.external_acwr {
            None => "Not enough data yet for load guidance: keep today's session easy and conversational.".to_string(),
            Some(ratio) => RiskZone::from_acwr(ratio).recommendation().to_string(),
        }
    };

    let weekly = format!(
        "External ACWR {}, internal ACWR {}, divergence {}.",
        describe_ratio(m.external_acwr, m.chronic_days_available, m.low_confidence),
        describe_ratio(m.internal_acwr, m.chronic_days_available, m.low_confidence),
        describe_ratio(m.divergence, m.chronic_days_available, m.low_confidence),
    );

    let pattern = match context.informing_autopsy() {
        Some(autopsy) => autopsy.learning.guidance.clone(),
        None => "No session reviews yet.".to_string(),
    };

    (daily, weekly, pattern)
}

/// What happened to the recommendation row
#[derive(Debug, Clone, PartialEq)]
pub enum RecommendationOutcome {
    Inserted(Recommendation),
    Updated(Recommendation),
    /// Target date already elapsed; stored row returned untouched
    Frozen(Recommendation),
}

impl RecommendationOutcome {
    pub fn recommendation(&self) -> &Recommendation {
        match self {
            RecommendationOutcome::Inserted(r)
            | RecommendationOutcome::Updated(r)
            | RecommendationOutcome::Frozen(r) => r,
        }
    }

    pub fn into_recommendation(self) -> Recommendation {
        match self {
            RecommendationOutcome::Inserted(r)
            | RecommendationOutcome::Updated(r)
            | RecommendationOutcome::Frozen(r) => r,
        }
    }
}

pub struct RecommendationGenerator<'a> {
    metrics: &'a MetricsService,
    generator: &'a dyn TextGenerator,
    settings: &'a RecommendationSettings,
}

impl<'a> RecommendationGenerator<'a> {
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

    /// Assemble the context for a target date from the store plus an optional fresh autopsy
    pub fn build_context(
        &self,
        user_id: &str,
        target_date: NaiveDate,
        fresh_autopsy: Option<&Autopsy>,
    ) -> Result<RecommendationContext> {
        let store = self.metrics.store();
        let as_of = target_date.checked_sub_days(Days::new(1)).unwrap_or(target_date);

        let metrics = self.metrics.snapshot_for(user_id, as_of)?;
        let preferences = store
            .load_profile(user_id)?
            .map(|p| p.preferences)
            .unwrap_or_default();

        let fresh_id = fresh_autopsy.and_then(|a| a.id);
        let recent_autopsies: Vec<Autopsy> = store
            .recent_autopsies(user_id, target_date, self.settings.history_limit + 1)?
            .into_iter()
            .filter(|a| fresh_id.is_none() || a.id != fresh_id)
            .take(self.settings.history_limit)
            .collect();

        let recent_journal = store.recent_journal_entries(user_id, as_of, self.settings.journal_window_days)?;

        Ok(RecommendationContext {
            user_id: user_id.to_string(),
            target_date,
            metrics,
            preferences,
            fresh_autopsy: fresh_autopsy.cloned(),
            recent_autopsies,
            recent_journal,
        })
    }

    /// Generate and persist guidance for `target_date`
    ///
    /// An elapsed target with a stored row is returned as `Frozen` without
    /// calling the collaborator.
    pub fn generate(
        &self,
        user_id: &str,
        target_date: NaiveDate,
        today: NaiveDate,
        fresh_autopsy: Option<&Autopsy>,
    ) -> Result<RecommendationOutcome> {
        let store = self.metrics.store();
        if target_date < today {
            if let Some(stored) = store.load_recommendation(user_id, target_date)? {
                tracing::info!(user = user_id, %target_date, "recommendation frozen");
                return Ok(RecommendationOutcome::Frozen(stored));
            }
        }

        let context = self.build_context(user_id, target_date, fresh_autopsy)?;
        let prompt = context.to_prompt(&self.settings.truncation);

        let (daily, weekly_context, pattern_insight, source, reply_format) = match self.request_with_retry(&prompt) {
            Ok(parsed) => {
                (
                    parsed.daily,
                    parsed.weekly_context,
                    parsed.pattern_insight,
                    RecommendationSource::Generated,
                    Some(parsed.format),
                )
            }
            Err(e) => {
                tracing::warn!(user = user_id, %target_date, error = %e, "falling back to templated recommendation");
                let (daily, weekly, pattern) = templated_sections(&context);
                (daily, weekly, pattern, RecommendationSource::Templated, None)
            }
        };

        let informing = context.informing_autopsy();
        let mut recommendation = Recommendation {
            id: None,
            user_id: user_id.to_string(),
            target_date,
            daily,
            weekly_context,
            pattern_insight,
            provenance: RecommendationProvenance {
                autopsy_informed: informing.is_some(),
                autopsy_id: informing.and_then(|a| a.id),
                source,
                reply_format,
            },
            metrics: Some(context.metrics.clone()),
            generated_at: Utc::now(),
        };

        let outcome = match store.save_recommendation(&recommendation, today)? {
            RecommendationWrite::Inserted(id) => {
                recommendation.id = Some(id);
                RecommendationOutcome::Inserted(recommendation)
            }
            RecommendationWrite::Updated(id) => {
                recommendation.id = Some(id);
                RecommendationOutcome::Updated(recommendation)
            }
            RecommendationWrite::Frozen(stored) => RecommendationOutcome::Frozen(stored),
        };

        let saved = outcome.recommendation();
        tracing::info!(
            user = user_id,
            %target_date,
            id = ?saved.id,
            source = %saved.provenance.source,
            autopsy = ?saved.provenance.autopsy_id,
            "recommendation saved"
        );
        Ok(outcome)
    }

    /// Call the collaborator, retrying once on failure
    ///
    /// An unrecognized layout is retried too; if the last attempt is still
    /// unrecognized its daily-only parse is accepted.
    fn request_with_retry(&self, prompt: &str) -> std::result::Result<ParsedReply, CollaboratorError> {
        let request = GenerationRequest {
            prompt: prompt.to_string(),
            params: self.settings.params.clone(),
        };

        let mut last_error = CollaboratorError::EmptyReply;
        let mut unrecognized = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.generator.generate(&request) {
                Ok(reply) if !reply.trim().is_empty() => {
                    let parsed = parse_reply(&reply);
                    if parsed.format != ReplyFormat::Unrecognized {
                        return Ok(parsed);
                    }
                    tracing::debug!(generator = self.generator.name(), attempt, "retrying unrecognized reply");
                    unrecognized = Some(parsed);
                    continue;
                }
                Ok(_) => last_error = CollaboratorError::EmptyReply,
                Err(e) => last_error = e,
            }
            tracing::warn!(
                generator = self.generator.name(),
                attempt,
                error = %last_error,
                "generation attempt failed"
            );
        }
        unrecognized.ok_or(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AutopsyLearning, DetectedPattern, Intensity};

    fn snapshot() -> DailyLoadSnapshot {
        DailyLoadSnapshot {
            user_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 9).unwrap(),
            configuration_id: None,
            acute_external: None,
            chronic_external: None,
            acute_internal: None,
            chronic_internal: None,
            external_acwr: None,
            internal_acwr: None,
            divergence: None,
            chronic_days_available: 0,
            low_confidence: true,
        }
    }

    fn autopsy(id: i64, analysis: &str, injury: Option<&str>) -> Autopsy {
        Autopsy {
            id: Some(id),
            user_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 9).unwrap(),
            recommendation_id: None,
            activity_ids: vec![],
            journal_linked: true,
            alignment: AlignmentScore::Scored(4),
            analysis: analysis.to_string(),
            pattern: DetectedPattern::Overreach,
            learning: AutopsyLearning {
                intended: Some(Intensity::Easy),
                actual: Intensity::Hard,
                level_gap: Some(2),
                injury_signal: injury.map(str::to_string),
                guidance: "keep tomorrow easy".to_string(),
            },
            created_at: Utc::now(),
        }
    }

    fn context(fresh: Option<Autopsy>, journal: Vec<JournalEntry>) -> RecommendationContext {
        RecommendationContext {
            user_id: "u1".to_string(),
            target_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            metrics: snapshot(),
            preferences: UserPreferences::default(),
            fresh_autopsy: fresh,
            recent_autopsies: vec![],
            recent_journal: journal,
        }
    }

    #[test]
    fn test_parse_plain_headings() {
        let reply = "Here you go.\nDAILY RECOMMENDATION: Easy 30 minutes.\nKeep it relaxed.\nWEEKLY CONTEXT: Load is rising.\nPATTERN INSIGHT:\nYou tend to overreach on Tuesdays.";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.format, ReplyFormat::Plain);
        assert_eq!(parsed.daily, "Easy 30 minutes.\nKeep it relaxed.");
        assert_eq!(parsed.weekly_context, "Load is rising.");
        assert_eq!(parsed.pattern_insight, "You tend to overreach on Tuesdays.");
    }

    #[test]
    fn test_parse_decorated_headings() {
        let reply = "**Daily Recommendation:** Rest day\n**Weekly Planning**\nTwo quality sessions\n**Pattern Insights**\nConsistent mornings";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.format, ReplyFormat::Decorated);
        assert_eq!(parsed.daily, "Rest day");
        assert_eq!(parsed.weekly_context, "Two quality sessions");
        assert_eq!(parsed.pattern_insight, "Consistent mornings");
    }

    #[test]
    fn test_parse_markdown_headings() {
        let reply = "## Daily Recommendation\nTempo 20 min\n\n## **Weekly Context**\nBuild week\n\n### Pattern Insight:\nSleep matters";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.format, ReplyFormat::Markdown);
        assert_eq!(parsed.daily, "Tempo 20 min");
        assert_eq!(parsed.weekly_context, "Build week");
        assert_eq!(parsed.pattern_insight, "Sleep matters");
    }

    #[test]
    fn test_parse_falls_back_to_daily_only() {
        let reply = "  Just go for an easy jog today.  ";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.format, ReplyFormat::Unrecognized);
        assert_eq!(parsed.daily, "Just go for an easy jog today.");
        assert!(parsed.weekly_context.is_empty());
        assert!(parsed.pattern_insight.is_empty());
    }

    #[test]
    fn test_partial_layout_is_unrecognized() {
        let parsed = parse_reply("DAILY RECOMMENDATION: Easy\nWEEKLY CONTEXT: Fine");
        assert_eq!(parsed.format, ReplyFormat::Unrecognized);
    }

    #[test]
    fn test_truncation_limits_follow_severity() {
        let policy = InsightTruncationPolicy::default();
        assert_eq!(policy.limit_for(AlignmentScore::Scored(2)), 1000);
        assert_eq!(policy.limit_for(AlignmentScore::Scored(5)), 600);
        assert_eq!(policy.limit_for(AlignmentScore::Scored(9)), 300);
        assert_eq!(policy.limit_for(AlignmentScore::NotApplicable), 300);
    }

    #[test]
    fn test_truncation_shortens_plain_text() {
        let policy = InsightTruncationPolicy {
            mild_limit: 20,
            ..InsightTruncationPolicy::default()
        };
        let out = policy.truncate("one two three four five six seven", AlignmentScore::Scored(10));
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= 23);
    }

    #[test]
    fn test_truncation_keeps_injury_sentences() {
        let policy = InsightTruncationPolicy {
            mild_limit: 10,
            ..InsightTruncationPolicy::default()
        };
        let text = "Long steady run went fine for most of it. Then sharp knee pain on the descent. Otherwise ok and the weather was lovely today.";
        let out = policy.truncate(text, AlignmentScore::Scored(10));
        assert!(out.contains("sharp knee pain on the descent."));
        assert!(out.len() < text.len());
    }

    #[test]
    fn test_prompt_puts_safety_first() {
        let journal = vec![JournalEntry {
            user_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 8).unwrap(),
            notes: "Calf feels tight. Some pain climbing stairs.".to_string(),
            perceived_effort: None,
            injury_flag: false,
        }];
        let ctx = context(Some(autopsy(4, "Recommended easy and performed hard.", None)), journal);
        let prompt = ctx.to_prompt(&InsightTruncationPolicy::default());

        let safety = prompt.find("SAFETY SIGNALS").unwrap();
        let lesson = prompt.find("LESSON FROM THE LAST SESSION").unwrap();
        let metrics = prompt.find("CURRENT LOAD METRICS").unwrap();
        let prefs = prompt.find("PREFERENCES").unwrap();
        assert!(safety < lesson && lesson < metrics && metrics < prefs);
        assert!(prompt.contains("Some pain climbing stairs."));
        assert!(prompt.contains("not enough data yet"));
    }

    #[test]
    fn test_templated_sections_prioritise_injury() {
        let ctx = context(Some(autopsy(4, "x", Some("Sharp pain in my achilles."))), vec![]);
        let (daily, weekly, pattern) = templated_sections(&ctx);
        assert!(daily.starts_with("Take a rest day"));
        assert!(daily.contains("achilles"));
        assert!(weekly.contains("not enough data yet"));
        assert_eq!(pattern, "keep tomorrow easy");
    }

    #[test]
    fn test_informing_autopsy_prefers_fresh() {
        let mut ctx = context(Some(autopsy(9, "fresh", None)), vec![]);
        ctx.recent_autopsies = vec![autopsy(3, "older", None)];
        assert_eq!(ctx.informing_autopsy().and_then(|a| a.id), Some(9));

        ctx.fresh_autopsy = None;
        assert_eq!(ctx.informing_autopsy().and_then(|a| a.id), Some(3));
    }
}
