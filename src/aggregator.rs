use crate::database::ActivityStore;
use crate::error::{LoadRsError, Result};
use crate::models::{AcwrParameters, ActivityRecord, DailyLoad, DailyLoadSnapshot};
use crate::ratio;
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use std::collections::BTreeMap;

/// Acute window length in days
pub const ACUTE_WINDOW_DAYS: u16 = 7;

/// One day's contribution to a window, tagged with its distance from the window end
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    pub days_ago: u16,
    pub value: Decimal,
}

/// Core acute/chronic aggregation engine
pub struct LoadAggregator {
    parameters: AcwrParameters,
}

impl LoadAggregator {
    /// Create an aggregator for one parameter set
    pub fn new(parameters: AcwrParameters) -> Self {
        LoadAggregator { parameters }
    }

    pub fn parameters(&self) -> &AcwrParameters {
        &self.parameters
    }

    /// Sum activity loads per day
    ///
    /// A day whose activities all lack TRIMP keeps `internal_load = None` so the
    /// day is excluded from internal averages instead of counting as zero.
    pub fn aggregate_daily_loads(&self, records: &[ActivityRecord]) -> BTreeMap<NaiveDate, DailyLoad> {
        let mut daily: BTreeMap<NaiveDate, DailyLoad> = BTreeMap::new();

        for record in records {
            let external = record
                .external_load
                .unwrap_or_else(|| crate::trimp::external_load(record));

            daily
                .entry(record.date)
                .and_modify(|day| {
                    day.external_load += external;
                    day.activity_count += 1;
                    if let Some(trimp) = record.trimp {
                        day.internal_load = Some(day.internal_load.unwrap_or(Decimal::ZERO) + trimp);
                    }
                })
                .or_insert(DailyLoad {
                    date: record.date,
                    external_load: external,
                    internal_load: record.trimp,
                    activity_count: 1,
                });
        }

        daily
    }

    /// Plain mean (decay 0) or exponentially weighted mean with weights e^(−r·k)
    ///
    /// Weights are renormalized by dividing by their sum, so decay 0 reproduces
    /// the arithmetic mean exactly. Returns None for an empty window.
    pub fn window_mean(samples: &[WindowSample], decay_rate: Decimal) -> Option<Decimal> {
        if samples.is_empty() {
            return None;
        }

        let mut weighted_sum = Decimal::ZERO;
        let mut weight_total = Decimal::ZERO;
        for sample in samples {
            let weight = Self::decay_weight(sample.days_ago, decay_rate);
            weighted_sum += sample.value * weight;
            weight_total += weight;
        }

        Some(weighted_sum / weight_total)
    }

    fn decay_weight(days_ago: u16, decay_rate: Decimal) -> Decimal {
        if decay_rate.is_zero() {
            return Decimal::ONE;
        }
        (-(decay_rate * Decimal::from(days_ago))).exp()
    }

    /// Snapshots for every date in `[start_date, end_date]`
    ///
    /// `history_start` is the user's first-ever activity date; days before it
    /// do not exist and are left out of every window. Records dated after a
    /// snapshot date are never read for that snapshot.
    pub fn calculate_snapshots(
        &self,
        user_id: &str,
        records: &[ActivityRecord],
        history_start: Option<NaiveDate>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        configuration_id: Option<i64>,
    ) -> Result<Vec<DailyLoadSnapshot>> {
        if start_date > end_date {
            return Err(LoadRsError::InvalidDateRange {
                start: start_date,
                end: end_date,
            });
        }

        let daily = self.aggregate_daily_loads(records);
        let history_start = history_start.or_else(|| daily.keys().next().copied());

        let mut snapshots = Vec::new();
        let mut current_date = start_date;
        while current_date <= end_date {
            snapshots.push(self.snapshot_for(user_id, &daily, history_start, current_date, configuration_id));
            current_date = match current_date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        Ok(snapshots)
    }

    /// Read the needed window from the store and compute snapshots
    pub fn snapshots_from_store(
        &self,
        store: &dyn ActivityStore,
        user_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        configuration_id: Option<i64>,
    ) -> Result<Vec<DailyLoadSnapshot>> {
        let read_from = self.window_read_start(start_date);
        let records = store.activities_between(user_id, read_from, end_date)?;
        let history_start = store.first_activity_date(user_id)?;
        self.calculate_snapshots(user_id, &records, history_start, start_date, end_date, configuration_id)
    }

    /// Earliest date any snapshot in a range starting at `start_date` reads
    pub fn window_read_start(&self, start_date: NaiveDate) -> NaiveDate {
        let span = self.parameters.chronic_window_days.max(ACUTE_WINDOW_DAYS) as u64;
        start_date
            .checked_sub_days(Days::new(span.saturating_sub(1)))
            .unwrap_or(start_date)
    }

    fn snapshot_for(
        &self,
        user_id: &str,
        daily: &BTreeMap<NaiveDate, DailyLoad>,
        history_start: Option<NaiveDate>,
        date: NaiveDate,
        configuration_id: Option<i64>,
    ) -> DailyLoadSnapshot {
        let chronic_window = self.parameters.chronic_window_days;

        let acute_external = Self::window_mean(
            &Self::external_samples(daily, history_start, date, ACUTE_WINDOW_DAYS),
            Decimal::ZERO,
        );
        let chronic_external = Self::window_mean(
            &Self::external_samples(daily, history_start, date, chronic_window),
            self.parameters.decay_rate,
        );
        let acute_internal = Self::window_mean(
            &Self::internal_samples(daily, history_start, date, ACUTE_WINDOW_DAYS),
            Decimal::ZERO,
        );
        let chronic_internal = Self::window_mean(
            &Self::internal_samples(daily, history_start, date, chronic_window),
            self.parameters.decay_rate,
        );

        let external_acwr = ratio::acwr(acute_external, chronic_external);
        let internal_acwr = ratio::acwr(acute_internal, chronic_internal);
        let divergence_case = ratio::classify_divergence(external_acwr, internal_acwr);
        if !matches!(divergence_case, ratio::DivergenceCase::Computed(_)) {
            tracing::trace!(user = user_id, %date, case = ?divergence_case, "divergence unresolved");
        }

        let chronic_days_available = Self::existing_days(history_start, date, chronic_window);

        DailyLoadSnapshot {
            user_id: user_id.to_string(),
            date,
            configuration_id,
            acute_external,
            chronic_external,
            acute_internal,
            chronic_internal,
            external_acwr,
            internal_acwr,
            divergence: divergence_case.value(),
            chronic_days_available,
            low_confidence: chronic_days_available < chronic_window,
        }
    }

    /// Days of a `window`-day span ending at `date` that fall on or after history start
    fn existing_days(history_start: Option<NaiveDate>, date: NaiveDate, window: u16) -> u16 {
        let Some(history_start) = history_start else {
            return 0;
        };
        if history_start > date {
            return 0;
        }
        let since_start = (date - history_start).num_days() + 1;
        since_start.min(window as i64) as u16
    }

    fn window_dates(
        history_start: Option<NaiveDate>,
        date: NaiveDate,
        window: u16,
    ) -> impl Iterator<Item = (u16, NaiveDate)> {
        let available = Self::existing_days(history_start, date, window);
        (0..available).filter_map(move |days_ago| {
            date.checked_sub_days(Days::new(days_ago as u64))
                .map(|day| (days_ago, day))
        })
    }

    /// Rest days inside history contribute a real zero
    fn external_samples(
        daily: &BTreeMap<NaiveDate, DailyLoad>,
        history_start: Option<NaiveDate>,
        date: NaiveDate,
        window: u16,
    ) -> Vec<WindowSample> {
        Self::window_dates(history_start, date, window)
            .map(|(days_ago, day)| WindowSample {
                days_ago,
                value: daily.get(&day).map(|d| d.external_load).unwrap_or(Decimal::ZERO),
            })
            .collect()
    }

    /// Rest days contribute zero; days with activities but no TRIMP are skipped
    fn internal_samples(
        daily: &BTreeMap<NaiveDate, DailyLoad>,
        history_start: Option<NaiveDate>,
        date: NaiveDate,
        window: u16,
    ) -> Vec<WindowSample> {
        Self::window_dates(history_start, date, window)
            .filter_map(|(days_ago, day)| {
                let value = match daily.get(&day) {
                    Some(load) => load.internal_load?,
                    None => Decimal::ZERO,
                };
                Some(WindowSample { days_ago, value })
            })
            .collect()
    }
}
