//! Batch re-aggregation of historical snapshots using rayon
//!
//! A migration recomputes every snapshot of the targeted users over a date
//! range under one configuration. Work is split into batches of
//! (user chunk × date chunk); each batch is checkpointed with a fingerprint of
//! its inputs so an interrupted run can resume without redoing finished work.
//! The users of one batch are processed in parallel.

use chrono::{Days, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregator::LoadAggregator;
use crate::database::ActivityStore;
use crate::error::{ConfigurationError, LoadRsError, MigrationError, Result};
use crate::models::{AcwrConfiguration, CheckpointStatus, JobStatus, MigrationCheckpoint};
use crate::service::MetricsService;

/// Which users a migration covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationTarget {
    User(String),
    All,
}

/// Input of one migration run
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub target: MigrationTarget,
    pub configuration_id: i64,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Run id of an interrupted run to resume
    pub resume_run_id: Option<String>,
}

/// `[migration]` section of the application config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Users per batch
    pub batch_size: usize,
    /// Days per batch
    pub batch_days: u32,
    /// Minimum fraction of successful units for the run to validate
    pub success_rate_floor: f64,
    /// Wall-clock bound for the performance check
    pub max_duration_seconds: u64,
    /// Show progress bar during the run
    pub show_progress: bool,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            batch_days: 90,
            success_rate_floor: 0.95,
            max_duration_seconds: 300,
            show_progress: true,
        }
    }
}

/// Outcome of one batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub index: usize,
    pub users: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub succeeded: usize,
    pub failed: usize,
    /// Skipped because a completed checkpoint with the same fingerprint exists
    pub skipped: bool,
    pub snapshots_written: usize,
    pub duration_ms: u128,
}

/// One pass/fail validation check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub checks: Vec<CheckResult>,
}

impl ValidationSummary {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

/// Report of a migration run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub configuration_id: i64,
    pub users: usize,
    pub total_activities: usize,
    pub batches: Vec<BatchResult>,
    /// (user, date chunk) units recomputed successfully, skipped batches included
    pub successful: usize,
    pub failed: usize,
    pub total_duration_ms: u128,
    pub errors: Vec<(String, String)>,
    pub validation: ValidationSummary,
}

impl MigrationReport {
    pub fn success_rate(&self) -> f64 {
        let total = self.successful + self.failed;
        if total == 0 {
            return 1.0;
        }
        self.successful as f64 / total as f64
    }

    pub fn batches_skipped(&self) -> usize {
        self.batches.iter().filter(|b| b.skipped).count()
    }

    pub fn is_validated(&self) -> bool {
        self.validation.passed()
    }

    /// Get human-readable summary
    pub fn to_string_pretty(&self) -> String {
        let mut out = format!(
            "Migration Summary ({})\n  \
             Configuration: {}\n  \
             Users: {}\n  \
             Total Activities: {}\n  \
             Batches: {} ({} resumed)\n  \
             Successful: {}\n  \
             Failed: {}\n  \
             Success Rate: {:.1}%\n  \
             Total Time: {:.2}s\n  \
             Validation: {}",
            self.run_id,
            self.configuration_id,
            self.users,
            self.total_activities,
            self.batches.len(),
            self.batches_skipped(),
            self.successful,
            self.failed,
            self.success_rate() * 100.0,
            self.total_duration_ms as f64 / 1000.0,
            if self.is_validated() { "PASSED" } else { "FAILED" },
        );
        for check in &self.validation.checks {
            out.push_str(&format!(
                "\n    [{}] {}: {}",
                if check.passed { "ok" } else { "!!" },
                check.name,
                check.detail
            ));
        }
        out
    }
}

/// Result of draining the re-aggregation queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRunSummary {
    pub completed: usize,
    pub failed: usize,
    pub snapshots_written: usize,
}

struct BatchPlan {
    index: usize,
    users: Vec<String>,
    start: NaiveDate,
    end: NaiveDate,
}

pub struct MigrationRunner<'a> {
    metrics: &'a MetricsService,
    settings: MigrationSettings,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(metrics: &'a MetricsService, settings: MigrationSettings) -> Self {
        Self { metrics, settings }
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    /// Recompute snapshots for the request and validate the result
    pub fn run(&self, request: &MigrationRequest) -> Result<MigrationReport> {
        if self.settings.batch_size == 0 || self.settings.batch_days == 0 {
            return Err(MigrationError::InvalidBatchSize.into());
        }
        if request.start > request.end {
            return Err(LoadRsError::InvalidDateRange {
                start: request.start,
                end: request.end,
            });
        }

        let store = self.metrics.store();
        let configuration = store
            .load_configuration(request.configuration_id)?
            .ok_or(ConfigurationError::UnknownConfiguration(request.configuration_id))?;

        let users = match &request.target {
            MigrationTarget::User(user_id) => vec![user_id.clone()],
            MigrationTarget::All => store.user_ids()?,
        };
        if users.is_empty() {
            return Err(MigrationError::NoTargets.into());
        }

        let run_id = request
            .resume_run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let total_activities = store.activity_count(Some(&users))?;
        let plans = self.plan_batches(&users, request.start, request.end);

        info!(
            run_id = %run_id,
            configuration = configuration.id,
            users = users.len(),
            batches = plans.len(),
            "Starting migration"
        );

        let start_time = Instant::now();

        let progress = if self.settings.show_progress {
            Some(ProgressBar::new(plans.len() as u64))
        } else {
            None
        };
        if let Some(ref pb) = progress {
            match ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({msg})") {
                Ok(style) => pb.set_style(style.progress_chars("#>-")),
                Err(e) => warn!("Invalid progress template: {}", e),
            }
        }

        let mut batches = Vec::with_capacity(plans.len());
        let mut errors = Vec::new();

        for plan in &plans {
            let fingerprint = self.fingerprint(&configuration, plan)?;
            let finished = store
                .load_checkpoint(&run_id, plan.index)?
                .filter(|c| c.status == CheckpointStatus::Completed && c.fingerprint == fingerprint);

            let result = match finished {
                Some(checkpoint) => {
                    debug!(batch = plan.index, "Batch already completed; skipping");
                    BatchResult {
                        index: plan.index,
                        users: plan.users.len(),
                        start: plan.start,
                        end: plan.end,
                        succeeded: checkpoint.users_processed,
                        failed: checkpoint.users_failed,
                        skipped: true,
                        snapshots_written: 0,
                        duration_ms: 0,
                    }
                }
                None => {
                    let (result, batch_errors) = self.run_batch(&configuration, plan);
                    store.save_checkpoint(&MigrationCheckpoint {
                        run_id: run_id.clone(),
                        batch_index: plan.index,
                        fingerprint,
                        status: if result.failed == 0 {
                            CheckpointStatus::Completed
                        } else {
                            CheckpointStatus::Failed
                        },
                        users_processed: result.succeeded,
                        users_failed: result.failed,
                        updated_at: Utc::now(),
                    })?;
                    errors.extend(batch_errors);
                    result
                }
            };

            if let Some(ref pb) = progress {
                pb.set_message(format!("batch {} {}..{}", plan.index, plan.start, plan.end));
                pb.inc(1);
            }
            batches.push(result);
        }

        if let Some(pb) = progress {
            pb.finish_with_message("Complete");
        }

        let total_duration_ms = start_time.elapsed().as_millis();
        let successful = batches.iter().map(|b| b.succeeded).sum();
        let failed = batches.iter().map(|b| b.failed).sum();

        let mut report = MigrationReport {
            run_id,
            configuration_id: configuration.id,
            users: users.len(),
            total_activities,
            batches,
            successful,
            failed,
            total_duration_ms,
            errors,
            validation: ValidationSummary { checks: Vec::new() },
        };
        report.validation = self.validate(&report, &users, request)?;

        info!("{}", report.to_string_pretty());
        Ok(report)
    }

    /// Drain `Pending` re-aggregation jobs, recomputing each user's history through `today`
    pub fn run_pending_jobs(&self, today: NaiveDate) -> Result<JobRunSummary> {
        let store = self.metrics.store();
        let jobs = store.jobs_with_status(JobStatus::Pending)?;
        let mut summary = JobRunSummary::default();

        for job in jobs {
            store.update_job_status(job.id, JobStatus::Running, None)?;
            match self.metrics.recompute_history(&job.user_id, today) {
                Ok(written) => {
                    store.update_job_status(job.id, JobStatus::Completed, None)?;
                    summary.completed += 1;
                    summary.snapshots_written += written;
                    debug!(job = job.id, user = %job.user_id, written, "Re-aggregation job completed");
                }
                Err(e) => {
                    let message = e.to_string();
                    store.update_job_status(job.id, JobStatus::Failed, Some(&message))?;
                    summary.failed += 1;
                    warn!(job = job.id, user = %job.user_id, error = %message, "Re-aggregation job failed");
                }
            }
        }

        if summary.completed + summary.failed > 0 {
            info!(
                completed = summary.completed,
                failed = summary.failed,
                "Re-aggregation queue drained"
            );
        }
        Ok(summary)
    }

    fn plan_batches(&self, users: &[String], start: NaiveDate, end: NaiveDate) -> Vec<BatchPlan> {
        let mut ranges = Vec::new();
        let mut chunk_start = start;
        loop {
            let chunk_end = chunk_start
                .checked_add_days(Days::new(self.settings.batch_days as u64 - 1))
                .map_or(end, |d| d.min(end));
            ranges.push((chunk_start, chunk_end));
            match chunk_end.succ_opt() {
                Some(next) if chunk_end < end => chunk_start = next,
                _ => break,
            }
        }

        let mut plans = Vec::new();
        for user_chunk in users.chunks(self.settings.batch_size) {
            for &(start, end) in &ranges {
                plans.push(BatchPlan {
                    index: plans.len(),
                    users: user_chunk.to_vec(),
                    start,
                    end,
                });
            }
        }
        plans
    }

    /// SHA-256 over everything that determines a batch's output
    ///
    /// Covers the configuration, the date chunk, and for each user the history
    /// start plus every activity the batch's windows read.
    fn fingerprint(&self, configuration: &AcwrConfiguration, plan: &BatchPlan) -> Result<String> {
        let store = self.metrics.store();
        let read_from = LoadAggregator::new(configuration.parameters.clone()).window_read_start(plan.start);
        let mut hasher = Sha256::new();
        hasher.update(configuration.id.to_le_bytes());
        hasher.update(configuration.parameters.chronic_window_days.to_le_bytes());
        hasher.update(configuration.parameters.decay_rate.to_string().as_bytes());
        hasher.update(plan.start.to_string().as_bytes());
        hasher.update(plan.end.to_string().as_bytes());
        for user in &plan.users {
            hasher.update(user.as_bytes());
            hasher.update([0u8]);
            if let Some(first) = store.first_activity_date(user)? {
                hasher.update(first.to_string().as_bytes());
            }
            for record in store.activities_between(user, read_from, plan.end)? {
                let external = record
                    .external_load
                    .unwrap_or_else(|| crate::trimp::external_load(&record));
                hasher.update(record.id.as_bytes());
                hasher.update(record.date.to_string().as_bytes());
                hasher.update(external.to_string().as_bytes());
                hasher.update(record.trimp.map(|t| t.to_string()).unwrap_or_default().as_bytes());
                hasher.update([0u8]);
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn run_batch(&self, configuration: &AcwrConfiguration, plan: &BatchPlan) -> (BatchResult, Vec<(String, String)>) {
        let batch_start = Instant::now();

        let written = Arc::new(Mutex::new(0usize));
        let errors = Arc::new(Mutex::new(Vec::new()));

        plan.users
            .par_iter()
            .for_each_with((written.clone(), errors.clone()), |(count, err), user_id| {
                match self.metrics.recompute_with(user_id, configuration, plan.start, plan.end) {
                    Ok(rows) => {
                        if let Ok(mut c) = count.lock() {
                            *c += rows;
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        warn!(user = %user_id, batch = plan.index, error = %message, "Batch unit failed");
                        if let Ok(mut e) = err.lock() {
                            e.push((user_id.clone(), message));
                        }
                    }
                }
            });

        let snapshots_written = written.lock().map(|c| *c).unwrap_or(0);
        let errors = errors.lock().map(|e| e.clone()).unwrap_or_default();
        let failed = errors.len();

        let result = BatchResult {
            index: plan.index,
            users: plan.users.len(),
            start: plan.start,
            end: plan.end,
            succeeded: plan.users.len() - failed,
            failed,
            skipped: false,
            snapshots_written,
            duration_ms: batch_start.elapsed().as_millis(),
        };
        debug!(
            batch = plan.index,
            succeeded = result.succeeded,
            failed = result.failed,
            rows = snapshots_written,
            "Batch finished"
        );
        (result, errors)
    }

    fn validate(
        &self,
        report: &MigrationReport,
        users: &[String],
        request: &MigrationRequest,
    ) -> Result<ValidationSummary> {
        let store = self.metrics.store();
        let days = (request.end - request.start).num_days() as usize + 1;

        let mut missing_users = Vec::new();
        for user in users {
            let rows = store.snapshot_count(user, report.configuration_id, request.start, request.end)?;
            if rows != days {
                missing_users.push(format!("{user} ({rows}/{days})"));
            }
        }
        let rows_exist = CheckResult {
            name: "row existence".to_string(),
            passed: missing_users.is_empty(),
            detail: if missing_users.is_empty() {
                format!("{} rows per user present", days)
            } else {
                format!("incomplete: {}", missing_users.join(", "))
            },
        };

        let orphans = store.orphaned_snapshot_count()?;
        let referential = CheckResult {
            name: "referential integrity".to_string(),
            passed: orphans == 0,
            detail: format!("{} snapshots reference a missing configuration", orphans),
        };

        let bound_ms = self.settings.max_duration_seconds as u128 * 1000;
        let performance = CheckResult {
            name: "performance bound".to_string(),
            passed: report.total_duration_ms <= bound_ms,
            detail: format!("{} ms (limit {} ms)", report.total_duration_ms, bound_ms),
        };

        let rate = report.success_rate();
        let error_rate = CheckResult {
            name: "error rate".to_string(),
            passed: rate >= self.settings.success_rate_floor,
            detail: format!(
                "success rate {:.1}% (floor {:.1}%)",
                rate * 100.0,
                self.settings.success_rate_floor * 100.0
            ),
        };

        Ok(ValidationSummary {
            checks: vec![rows_exist, referential, performance, error_rate],
        })
    }
}
