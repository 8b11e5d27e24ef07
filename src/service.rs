//! Metrics service: owns the store, the default parameters and per-user write serialization

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::aggregator::LoadAggregator;
use crate::configuration::{resolve_acwr_parameters, ResolvedParameters};
use crate::database::{ActivityStore, Database};
use crate::error::{DatabaseError, LoadRsError, Result};
use crate::models::{AcwrConfiguration, AcwrParameters, ActivityRecord, DailyLoadSnapshot};
use crate::trimp;

/// One mutex per user, created on first use
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    fn lock_for(&self, user_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LoadRsError::Internal("user lock table poisoned".to_string()))?;
        Ok(locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

/// Summary of one activity sync
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub user_id: String,
    pub activities_stored: usize,
    pub with_trimp: usize,
    pub snapshots_written: usize,
}

/// Entry point for every snapshot read and write
pub struct MetricsService {
    store: Arc<Database>,
    default_parameters: AcwrParameters,
    user_locks: UserLocks,
}

impl MetricsService {
    pub fn new(store: Arc<Database>, default_parameters: AcwrParameters) -> Self {
        Self {
            store,
            default_parameters,
            user_locks: UserLocks::default(),
        }
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    pub fn store_handle(&self) -> Arc<Database> {
        Arc::clone(&self.store)
    }

    pub fn default_parameters(&self) -> &AcwrParameters {
        &self.default_parameters
    }

    /// Run `f` while holding the user's recomputation lock
    ///
    /// Writes for the same user never interleave; different users proceed in parallel.
    pub fn with_user_lock<T>(&self, user_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.user_locks.lock_for(user_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| LoadRsError::Database(DatabaseError::LockPoisoned))?;
        f()
    }

    /// Effective parameters for a user
    pub fn resolve_parameters(&self, user_id: &str) -> Result<ResolvedParameters> {
        let bound = self.store.bound_configuration(user_id)?;
        let profile = self.store.load_profile(user_id)?;
        Ok(resolve_acwr_parameters(
            bound.as_ref(),
            profile.as_ref(),
            &self.default_parameters,
        ))
    }

    /// Recompute and persist snapshots for `[start, end]` under the user's effective parameters
    pub fn recompute(&self, user_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyLoadSnapshot>> {
        self.with_user_lock(user_id, || {
            let resolved = self.resolve_parameters(user_id)?;
            self.recompute_unlocked(user_id, &resolved.parameters, resolved.configuration_id, start, end)
        })
    }

    /// Recompute and persist snapshots under a specific configuration row
    pub fn recompute_with(
        &self,
        user_id: &str,
        configuration: &AcwrConfiguration,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize> {
        self.with_user_lock(user_id, || {
            self.recompute_unlocked(user_id, &configuration.parameters, Some(configuration.id), start, end)
                .map(|snapshots| snapshots.len())
        })
    }

    /// Recompute a user's full history through `through`
    pub fn recompute_history(&self, user_id: &str, through: NaiveDate) -> Result<usize> {
        let Some(first) = self.store.first_activity_date(user_id)? else {
            return Ok(0);
        };
        if first > through {
            return Ok(0);
        }
        self.recompute(user_id, first, through).map(|snapshots| snapshots.len())
    }

    /// Snapshots under hypothetical parameters; nothing is written
    pub fn preview(
        &self,
        user_id: &str,
        parameters: &AcwrParameters,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyLoadSnapshot>> {
        LoadAggregator::new(parameters.clone()).snapshots_from_store(self.store.as_ref(), user_id, start, end, None)
    }

    /// Annotate, store and re-aggregate a batch of synced activities
    ///
    /// Snapshots are rebuilt from the earliest synced or previously stored date
    /// through `through`.
    pub fn sync_activities(
        &self,
        user_id: &str,
        records: &[ActivityRecord],
        through: NaiveDate,
    ) -> Result<SyncSummary> {
        if let Some(foreign) = records.iter().find(|r| r.user_id != user_id) {
            return Err(LoadRsError::Validation(format!(
                "activity {} belongs to {}, not {}",
                foreign.id, foreign.user_id, user_id
            )));
        }

        self.with_user_lock(user_id, || {
            let profile = self.store.load_profile(user_id)?;
            let annotated: Vec<ActivityRecord> = records
                .iter()
                .map(|record| trimp::annotated(record, profile.as_ref()))
                .collect();
            let ids: Vec<String> = annotated.iter().map(|r| r.id.clone()).collect();
            let previous_dates = self.store.stored_activity_dates(user_id, &ids)?;
            let stored = self.store.upsert_activities(&annotated)?;
            let with_trimp = annotated.iter().filter(|r| r.trimp.is_some()).count();

            // A moved activity invalidates snapshots from its old date too
            let earliest_changed = annotated.iter().map(|r| r.date).chain(previous_dates).min();
            let snapshots_written = match earliest_changed {
                Some(earliest) if earliest <= through => {
                    let resolved = self.resolve_parameters(user_id)?;
                    self.recompute_unlocked(
                        user_id,
                        &resolved.parameters,
                        resolved.configuration_id,
                        earliest,
                        through,
                    )?
                    .len()
                }
                _ => 0,
            };

            tracing::info!(
                user = user_id,
                stored,
                with_trimp,
                snapshots = snapshots_written,
                "activities synced"
            );

            Ok(SyncSummary {
                user_id: user_id.to_string(),
                activities_stored: stored,
                with_trimp,
                snapshots_written,
            })
        })
    }

    /// Re-derive TRIMP and external load for every stored activity of a user
    ///
    /// Used after a profile change; the caller recomputes snapshots afterwards.
    pub fn reannotate(&self, user_id: &str) -> Result<usize> {
        self.with_user_lock(user_id, || {
            let profile = self.store.load_profile(user_id)?;
            let records = self.store.all_activities(user_id)?;
            let annotations: Vec<_> = records
                .iter()
                .map(|record| trimp::annotate(record, profile.as_ref()))
                .collect();
            Ok(self.store.annotate_activities(&annotations)?)
        })
    }

    /// Metrics for a date: the stored snapshot, else computed on the fly without persisting
    pub fn snapshot_for(&self, user_id: &str, date: NaiveDate) -> Result<DailyLoadSnapshot> {
        if let Some(snapshot) = self.store.load_snapshot(user_id, date)? {
            return Ok(snapshot);
        }
        let resolved = self.resolve_parameters(user_id)?;
        let mut snapshots = LoadAggregator::new(resolved.parameters).snapshots_from_store(
            self.store.as_ref(),
            user_id,
            date,
            date,
            resolved.configuration_id,
        )?;
        snapshots
            .pop()
            .ok_or_else(|| LoadRsError::Internal(format!("no snapshot produced for {user_id} on {date}")))
    }

    fn recompute_unlocked(
        &self,
        user_id: &str,
        parameters: &AcwrParameters,
        configuration_id: Option<i64>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyLoadSnapshot>> {
        let aggregator = LoadAggregator::new(parameters.clone());
        let snapshots =
            aggregator.snapshots_from_store(self.store.as_ref(), user_id, start, end, configuration_id)?;
        self.store.replace_snapshots(user_id, start, end, &snapshots)?;

        tracing::debug!(
            user = user_id,
            %start,
            %end,
            window = parameters.chronic_window_days,
            decay = %parameters.decay_rate,
            "snapshots recomputed"
        );
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AthleteProfile;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn run(id: &str, user: &str, date: NaiveDate, km: i64, avg_hr: Option<u16>) -> ActivityRecord {
        ActivityRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            date,
            duration_seconds: 3000,
            distance_meters: Some(Decimal::from(km * 1000)),
            elevation_gain_meters: None,
            avg_heart_rate: avg_hr,
            max_heart_rate: None,
            trimp: None,
            external_load: None,
        }
    }

    fn service() -> MetricsService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        MetricsService::new(db, AcwrParameters::default())
    }

    #[test]
    fn test_sync_annotates_and_aggregates() {
        let service = service();
        service
            .store()
            .upsert_profile(&AthleteProfile {
                resting_hr: Some(50),
                max_hr: Some(190),
                ..AthleteProfile::new("u1")
            })
            .unwrap();

        let summary = service
            .sync_activities(
                "u1",
                &[run("a1", "u1", day(1), 10, Some(150)), run("a2", "u1", day(3), 5, None)],
                day(3),
            )
            .unwrap();

        assert_eq!(summary.activities_stored, 2);
        assert_eq!(summary.with_trimp, 1);
        assert_eq!(summary.snapshots_written, 3);

        let snapshot = service.store().load_snapshot("u1", day(3)).unwrap().unwrap();
        // (10 + 0 + 5) / 3 existing days
        assert_eq!(snapshot.acute_external, Some(dec!(5)));
        assert!(snapshot.low_confidence);
    }

    #[test]
    fn test_resync_moving_activity_later_rebuilds_old_dates() {
        let service = service();
        service
            .sync_activities(
                "u1",
                &[run("base", "u1", day(1), 5, None), run("x", "u1", day(3), 50, None)],
                day(10),
            )
            .unwrap();

        service
            .sync_activities("u1", &[run("x", "u1", day(8), 50, None)], day(10))
            .unwrap();

        let stored = service.store().load_snapshot("u1", day(5)).unwrap().unwrap();
        let fresh = service.preview("u1", &AcwrParameters::default(), day(5), day(5)).unwrap();
        // Days 1..=5 exist and only day 1 carries load now
        assert_eq!(stored.acute_external, Some(dec!(1)));
        assert_eq!(stored.acute_external, fresh[0].acute_external);
        assert_eq!(stored.chronic_external, fresh[0].chronic_external);
    }

    #[test]
    fn test_sync_rejects_foreign_records() {
        let service = service();
        let result = service.sync_activities("u1", &[run("a1", "u2", day(1), 10, None)], day(1));
        assert!(matches!(result, Err(LoadRsError::Validation(_))));
    }

    #[test]
    fn test_preview_does_not_persist() {
        let service = service();
        service
            .store()
            .upsert_activities(&[run("a1", "u1", day(1), 8, None)])
            .unwrap();

        let preview = service
            .preview("u1", &AcwrParameters::new(42, dec!(0.05)).unwrap(), day(1), day(5))
            .unwrap();
        assert_eq!(preview.len(), 5);
        assert!(preview.iter().all(|s| s.configuration_id.is_none()));
        assert!(service.store().load_snapshots("u1", day(1), day(5)).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_for_computes_when_missing() {
        let service = service();
        service
            .store()
            .upsert_activities(&[run("a1", "u1", day(1), 7, None)])
            .unwrap();

        let snapshot = service.snapshot_for("u1", day(2)).unwrap();
        assert_eq!(snapshot.chronic_days_available, 2);
        assert!(service.store().load_snapshot("u1", day(2)).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_recompute_for_same_user_is_serialized() {
        let service = Arc::new(service());
        service
            .store()
            .upsert_activities(&[run("a1", "u1", day(1), 7, None), run("a2", "u2", day(1), 9, None)])
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    let user = if i % 2 == 0 { "u1" } else { "u2" };
                    service.recompute(user, day(1), day(10)).unwrap().len()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 10);
        }
        assert_eq!(service.store().load_snapshots("u1", day(1), day(10)).unwrap().len(), 10);
    }
}
