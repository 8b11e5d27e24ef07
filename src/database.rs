use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use crate::error::DatabaseError;
use crate::models::{
    AcwrConfiguration, AcwrParameters, ActivityAnnotation, ActivityRecord, AlignmentScore,
    AthleteProfile, Autopsy, DailyLoadSnapshot, JobStatus, JournalEntry, MigrationCheckpoint,
    ReaggregationJob, Recommendation, RecommendationProvenance, UserPreferences,
};

/// Narrow read/write interface the analytics core uses for activities
pub trait ActivityStore: Send + Sync {
    /// Activities for a user with `start <= date <= end`, ordered by date then id
    fn activities_between(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ActivityRecord>, DatabaseError>;

    /// Date of the user's first recorded activity
    fn first_activity_date(&self, user_id: &str) -> Result<Option<NaiveDate>, DatabaseError>;

    /// Insert or fully replace synced activities
    fn upsert_activities(&self, records: &[ActivityRecord]) -> Result<usize, DatabaseError>;

    /// Write derived loads back onto stored activities
    fn annotate_activities(&self, annotations: &[ActivityAnnotation]) -> Result<usize, DatabaseError>;

    /// Every user with at least one activity
    fn user_ids(&self) -> Result<Vec<String>, DatabaseError>;
}

/// Result of persisting a recommendation
#[derive(Debug, Clone, PartialEq)]
pub enum RecommendationWrite {
    Inserted(i64),
    Updated(i64),
    /// Target date has elapsed; the stored row is returned untouched
    Frozen(Recommendation),
}

/// Result of persisting an autopsy
#[derive(Debug, Clone, PartialEq)]
pub enum AutopsyWrite {
    Created(Autopsy),
    /// An autopsy already existed for the date and was kept as-is
    Existing(Autopsy),
}

impl AutopsyWrite {
    pub fn into_inner(self) -> Autopsy {
        match self {
            AutopsyWrite::Created(autopsy) | AutopsyWrite::Existing(autopsy) => autopsy,
        }
    }
}

/// SQLite-backed store for activities and every derived row
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create or open a database at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema(true)?;
        Ok(db)
    }

    /// Private in-memory database, used by tests and previews
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema(false)?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    fn init_schema(&self, on_disk: bool) -> Result<(), DatabaseError> {
        let conn = self.conn()?;

        if on_disk {
            // journal_mode returns a row, so it cannot go through execute()
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
            conn.execute("PRAGMA synchronous=NORMAL", [])?;
        }
        conn.execute("PRAGMA foreign_keys=ON", [])?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS athletes (
                user_id TEXT PRIMARY KEY,
                resting_hr INTEGER,
                max_hr INTEGER,
                gender TEXT NOT NULL,
                legacy_chronic_window_days INTEGER,
                risk_tolerance TEXT NOT NULL,
                tone TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                date DATE NOT NULL,
                duration_seconds INTEGER NOT NULL,
                distance_m TEXT,
                elevation_gain_m TEXT,
                avg_hr INTEGER,
                max_hr INTEGER,
                trimp TEXT,
                external_load TEXT,
                synced_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_activities_user_date ON activities(user_id, date);

            CREATE TABLE IF NOT EXISTS acwr_configurations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                chronic_window_days INTEGER NOT NULL,
                decay_rate TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_acwr_configurations (
                user_id TEXT PRIMARY KEY,
                configuration_id INTEGER NOT NULL REFERENCES acwr_configurations(id),
                bound_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_load_snapshots (
                user_id TEXT NOT NULL,
                date DATE NOT NULL,
                configuration_id INTEGER,
                acute_external TEXT,
                chronic_external TEXT,
                acute_internal TEXT,
                chronic_internal TEXT,
                external_acwr TEXT,
                internal_acwr TEXT,
                divergence TEXT,
                chronic_days_available INTEGER NOT NULL,
                low_confidence INTEGER NOT NULL,
                computed_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, date)
            );

            CREATE TABLE IF NOT EXISTS reaggregation_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                configuration_id INTEGER NOT NULL REFERENCES acwr_configurations(id),
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON reaggregation_jobs(status);

            CREATE TABLE IF NOT EXISTS journal_entries (
                user_id TEXT NOT NULL,
                date DATE NOT NULL,
                notes TEXT NOT NULL,
                perceived_effort INTEGER,
                injury_flag INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, date)
            );

            CREATE TABLE IF NOT EXISTS recommendations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                target_date DATE NOT NULL,
                daily TEXT NOT NULL,
                weekly_context TEXT NOT NULL,
                pattern_insight TEXT NOT NULL,
                provenance TEXT NOT NULL,
                metrics TEXT,
                generated_at TEXT NOT NULL,
                UNIQUE (user_id, target_date)
            );

            CREATE TABLE IF NOT EXISTS autopsies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                date DATE NOT NULL,
                recommendation_id INTEGER REFERENCES recommendations(id),
                activity_ids TEXT NOT NULL,
                journal_linked INTEGER NOT NULL,
                alignment_score INTEGER,
                analysis TEXT NOT NULL,
                pattern TEXT NOT NULL,
                learning TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, date)
            );

            CREATE TABLE IF NOT EXISTS migration_checkpoints (
                run_id TEXT NOT NULL,
                batch_index INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                users_processed INTEGER NOT NULL,
                users_failed INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (run_id, batch_index)
            );
            "#,
        )?;

        Ok(())
    }

    // ---- athletes ------------------------------------------------------

    pub fn upsert_profile(&self, profile: &AthleteProfile) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO athletes (
                user_id, resting_hr, max_hr, gender, legacy_chronic_window_days,
                risk_tolerance, tone, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)
            "#,
            params![
                profile.user_id,
                profile.resting_hr,
                profile.max_hr,
                profile.gender.to_string(),
                profile.legacy_chronic_window_days,
                profile.preferences.risk_tolerance.to_string(),
                profile.preferences.tone.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn load_profile(&self, user_id: &str) -> Result<Option<AthleteProfile>, DatabaseError> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                r#"
                SELECT user_id, resting_hr, max_hr, gender, legacy_chronic_window_days,
                       risk_tolerance, tone
                FROM athletes WHERE user_id = ?1
                "#,
                params![user_id],
                |row| {
                    Ok(AthleteProfile {
                        user_id: row.get(0)?,
                        resting_hr: row.get(1)?,
                        max_hr: row.get(2)?,
                        gender: parsed_at(row, 3)?,
                        legacy_chronic_window_days: row.get(4)?,
                        preferences: UserPreferences {
                            risk_tolerance: parsed_at(row, 5)?,
                            tone: parsed_at(row, 6)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    // ---- activities ----------------------------------------------------

    /// Number of stored activities, for one user or all users
    pub fn activity_count(&self, user_ids: Option<&[String]>) -> Result<usize, DatabaseError> {
        let conn = self.conn()?;
        let count: i64 = match user_ids {
            None => conn.query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?,
            Some(users) => {
                let mut total = 0i64;
                let mut stmt = conn.prepare("SELECT COUNT(*) FROM activities WHERE user_id = ?1")?;
                for user in users {
                    total += stmt.query_row(params![user], |row| row.get::<_, i64>(0))?;
                }
                total
            }
        };
        Ok(count as usize)
    }

    /// Every stored activity of a user, ordered by date then id
    pub fn all_activities(&self, user_id: &str) -> Result<Vec<ActivityRecord>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, date, duration_seconds, distance_m, elevation_gain_m,
                   avg_hr, max_hr, trimp, external_load
            FROM activities WHERE user_id = ?1
            ORDER BY date, id
            "#,
        )?;
        let records = stmt
            .query_map(params![user_id], activity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Stored dates of the given activity ids for a user; unknown ids are skipped
    pub fn stored_activity_dates(&self, user_id: &str, ids: &[String]) -> Result<Vec<NaiveDate>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT date FROM activities WHERE user_id = ?1 AND id = ?2")?;
        let mut dates = Vec::new();
        for id in ids {
            if let Some(date) = stmt
                .query_row(params![user_id, id], |row| row.get::<_, NaiveDate>(0))
                .optional()?
            {
                dates.push(date);
            }
        }
        Ok(dates)
    }

    // ---- configurations ------------------------------------------------

    /// Insert a new immutable configuration row
    pub fn insert_configuration(
        &self,
        name: &str,
        parameters: &AcwrParameters,
        created_at: DateTime<Utc>,
    ) -> Result<AcwrConfiguration, DatabaseError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO acwr_configurations (name, chronic_window_days, decay_rate, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                name,
                parameters.chronic_window_days,
                parameters.decay_rate.to_string(),
                created_at,
            ],
        )?;

        Ok(AcwrConfiguration {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            parameters: parameters.clone(),
            created_at,
        })
    }

    pub fn load_configuration(&self, id: i64) -> Result<Option<AcwrConfiguration>, DatabaseError> {
        let conn = self.conn()?;
        let configuration = conn
            .query_row(
                "SELECT id, name, chronic_window_days, decay_rate, created_at FROM acwr_configurations WHERE id = ?1",
                params![id],
                configuration_from_row,
            )
            .optional()?;
        Ok(configuration)
    }

    pub fn list_configurations(&self) -> Result<Vec<AcwrConfiguration>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, chronic_window_days, decay_rate, created_at FROM acwr_configurations ORDER BY id",
        )?;
        let configurations = stmt
            .query_map([], configuration_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(configurations)
    }

    /// Configuration currently bound to a user
    pub fn bound_configuration(&self, user_id: &str) -> Result<Option<AcwrConfiguration>, DatabaseError> {
        let conn = self.conn()?;
        let configuration = conn
            .query_row(
                r#"
                SELECT c.id, c.name, c.chronic_window_days, c.decay_rate, c.created_at
                FROM user_acwr_configurations b
                JOIN acwr_configurations c ON c.id = b.configuration_id
                WHERE b.user_id = ?1
                "#,
                params![user_id],
                configuration_from_row,
            )
            .optional()?;
        Ok(configuration)
    }

    /// Swap the user's binding and queue a re-aggregation in one transaction
    pub fn bind_configuration(
        &self,
        user_id: &str,
        configuration_id: i64,
        at: DateTime<Utc>,
    ) -> Result<ReaggregationJob, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO user_acwr_configurations (user_id, configuration_id, bound_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET
                configuration_id = excluded.configuration_id,
                bound_at = excluded.bound_at
            "#,
            params![user_id, configuration_id, at],
        )?;

        tx.execute(
            r#"
            INSERT INTO reaggregation_jobs (user_id, configuration_id, status, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![user_id, configuration_id, JobStatus::Pending.to_string(), at],
        )?;
        let job_id = tx.last_insert_rowid();

        tx.commit()?;

        Ok(ReaggregationJob {
            id: job_id,
            user_id: user_id.to_string(),
            configuration_id,
            status: JobStatus::Pending,
            created_at: at,
            error: None,
        })
    }

    // ---- re-aggregation jobs -------------------------------------------

    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<ReaggregationJob>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, configuration_id, status, created_at, error
            FROM reaggregation_jobs WHERE status = ?1 ORDER BY id
            "#,
        )?;
        let jobs = stmt
            .query_map(params![status.to_string()], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn jobs_for_user(&self, user_id: &str) -> Result<Vec<ReaggregationJob>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, configuration_id, status, created_at, error
            FROM reaggregation_jobs WHERE user_id = ?1 ORDER BY id
            "#,
        )?;
        let jobs = stmt
            .query_map(params![user_id], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reaggregation_jobs SET status = ?1, error = ?2 WHERE id = ?3",
            params![status.to_string(), error, job_id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                table: "reaggregation_jobs".to_string(),
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    // ---- snapshots -----------------------------------------------------

    /// Replace every snapshot of a user in `[start, end]` with `snapshots`
    pub fn replace_snapshots(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        snapshots: &[DailyLoadSnapshot],
    ) -> Result<usize, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM daily_load_snapshots WHERE user_id = ?1 AND date >= ?2 AND date <= ?3",
            params![user_id, start, end],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO daily_load_snapshots (
                    user_id, date, configuration_id, acute_external, chronic_external,
                    acute_internal, chronic_internal, external_acwr, internal_acwr, divergence,
                    chronic_days_available, low_confidence
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )?;

            for snapshot in snapshots {
                if snapshot.user_id != user_id || snapshot.date < start || snapshot.date > end {
                    return Err(DatabaseError::Integrity(format!(
                        "snapshot {} / {} outside replaced range",
                        snapshot.user_id, snapshot.date
                    )));
                }
                stmt.execute(params![
                    snapshot.user_id,
                    snapshot.date,
                    snapshot.configuration_id,
                    decimal_text(snapshot.acute_external),
                    decimal_text(snapshot.chronic_external),
                    decimal_text(snapshot.acute_internal),
                    decimal_text(snapshot.chronic_internal),
                    decimal_text(snapshot.external_acwr),
                    decimal_text(snapshot.internal_acwr),
                    decimal_text(snapshot.divergence),
                    snapshot.chronic_days_available,
                    snapshot.low_confidence,
                ])?;
            }
        }

        tx.commit()?;
        Ok(snapshots.len())
    }

    pub fn load_snapshot(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyLoadSnapshot>, DatabaseError> {
        let conn = self.conn()?;
        let snapshot = conn
            .query_row(
                &format!("{SNAPSHOT_COLUMNS} WHERE user_id = ?1 AND date = ?2"),
                params![user_id, date],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    pub fn load_snapshots(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyLoadSnapshot>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{SNAPSHOT_COLUMNS} WHERE user_id = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date"
        ))?;
        let snapshots = stmt
            .query_map(params![user_id, start, end], snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    /// Most recent snapshot on or before `date`
    pub fn latest_snapshot_on_or_before(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyLoadSnapshot>, DatabaseError> {
        let conn = self.conn()?;
        let snapshot = conn
            .query_row(
                &format!("{SNAPSHOT_COLUMNS} WHERE user_id = ?1 AND date <= ?2 ORDER BY date DESC LIMIT 1"),
                params![user_id, date],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Snapshot rows in `[start, end]` computed under `configuration_id`
    pub fn snapshot_count(
        &self,
        user_id: &str,
        configuration_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize, DatabaseError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM daily_load_snapshots
            WHERE user_id = ?1 AND configuration_id = ?2 AND date >= ?3 AND date <= ?4
            "#,
            params![user_id, configuration_id, start, end],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Snapshots referencing a configuration row that does not exist
    pub fn orphaned_snapshot_count(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM daily_load_snapshots s
            LEFT JOIN acwr_configurations c ON c.id = s.configuration_id
            WHERE s.configuration_id IS NOT NULL AND c.id IS NULL
            "#,
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ---- journal -------------------------------------------------------

    pub fn save_journal_entry(&self, entry: &JournalEntry) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO journal_entries (
                user_id, date, notes, perceived_effort, injury_flag, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
            "#,
            params![
                entry.user_id,
                entry.date,
                entry.notes,
                entry.perceived_effort,
                entry.injury_flag,
            ],
        )?;
        Ok(())
    }

    pub fn load_journal_entry(&self, user_id: &str, date: NaiveDate) -> Result<Option<JournalEntry>, DatabaseError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                r#"
                SELECT user_id, date, notes, perceived_effort, injury_flag
                FROM journal_entries WHERE user_id = ?1 AND date = ?2
                "#,
                params![user_id, date],
                journal_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Entries in the `days`-day window ending at `through`, newest first
    pub fn recent_journal_entries(
        &self,
        user_id: &str,
        through: NaiveDate,
        days: u16,
    ) -> Result<Vec<JournalEntry>, DatabaseError> {
        let from = through
            .checked_sub_days(Days::new(days.saturating_sub(1) as u64))
            .unwrap_or(through);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, date, notes, perceived_effort, injury_flag
            FROM journal_entries
            WHERE user_id = ?1 AND date >= ?2 AND date <= ?3
            ORDER BY date DESC
            "#,
        )?;
        let entries = stmt
            .query_map(params![user_id, from, through], journal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ---- recommendations -----------------------------------------------

    pub fn load_recommendation(
        &self,
        user_id: &str,
        target_date: NaiveDate,
    ) -> Result<Option<Recommendation>, DatabaseError> {
        let conn = self.conn()?;
        load_recommendation_with(&conn, user_id, target_date)
    }

    /// Insert, overwrite in place, or leave frozen
    ///
    /// A row whose target date is before `today` is never rewritten. All three
    /// text sections of a live row are replaced by one UPDATE.
    pub fn save_recommendation(
        &self,
        recommendation: &Recommendation,
        today: NaiveDate,
    ) -> Result<RecommendationWrite, DatabaseError> {
        let provenance = serde_json::to_string(&recommendation.provenance)?;
        let metrics = recommendation
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM recommendations WHERE user_id = ?1 AND target_date = ?2",
                params![recommendation.user_id, recommendation.target_date],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(_) if recommendation.target_date < today => {
                let stored = load_recommendation_with(&tx, &recommendation.user_id, recommendation.target_date)?
                    .ok_or_else(|| DatabaseError::NotFound {
                        table: "recommendations".to_string(),
                        id: format!("{}/{}", recommendation.user_id, recommendation.target_date),
                    })?;
                RecommendationWrite::Frozen(stored)
            }
            Some(id) => {
                tx.execute(
                    r#"
                    UPDATE recommendations SET
                        daily = ?1,
                        weekly_context = ?2,
                        pattern_insight = ?3,
                        provenance = ?4,
                        metrics = ?5,
                        generated_at = ?6
                    WHERE id = ?7
                    "#,
                    params![
                        recommendation.daily,
                        recommendation.weekly_context,
                        recommendation.pattern_insight,
                        provenance,
                        metrics,
                        recommendation.generated_at,
                        id,
                    ],
                )?;
                RecommendationWrite::Updated(id)
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO recommendations (
                        user_id, target_date, daily, weekly_context, pattern_insight,
                        provenance, metrics, generated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    params![
                        recommendation.user_id,
                        recommendation.target_date,
                        recommendation.daily,
                        recommendation.weekly_context,
                        recommendation.pattern_insight,
                        provenance,
                        metrics,
                        recommendation.generated_at,
                    ],
                )?;
                RecommendationWrite::Inserted(tx.last_insert_rowid())
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    // ---- autopsies -----------------------------------------------------

    /// Persist an autopsy unless one already exists for the same (user, date)
    pub fn insert_autopsy(&self, autopsy: &Autopsy) -> Result<AutopsyWrite, DatabaseError> {
        let activity_ids = serde_json::to_string(&autopsy.activity_ids)?;
        let learning = serde_json::to_string(&autopsy.learning)?;

        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO autopsies (
                user_id, date, recommendation_id, activity_ids, journal_linked,
                alignment_score, analysis, pattern, learning, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                autopsy.user_id,
                autopsy.date,
                autopsy.recommendation_id,
                activity_ids,
                autopsy.journal_linked,
                autopsy.alignment.value(),
                autopsy.analysis,
                autopsy.pattern.to_string(),
                learning,
                autopsy.created_at,
            ],
        )?;

        let stored = load_autopsy_with(&conn, &autopsy.user_id, autopsy.date)?.ok_or_else(|| {
            DatabaseError::NotFound {
                table: "autopsies".to_string(),
                id: format!("{}/{}", autopsy.user_id, autopsy.date),
            }
        })?;

        Ok(if inserted == 1 {
            AutopsyWrite::Created(stored)
        } else {
            AutopsyWrite::Existing(stored)
        })
    }

    pub fn load_autopsy(&self, user_id: &str, date: NaiveDate) -> Result<Option<Autopsy>, DatabaseError> {
        let conn = self.conn()?;
        load_autopsy_with(&conn, user_id, date)
    }

    /// Up to `limit` autopsies dated before `before`, newest first
    pub fn recent_autopsies(
        &self,
        user_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Autopsy>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{AUTOPSY_COLUMNS} WHERE user_id = ?1 AND date < ?2 ORDER BY date DESC LIMIT ?3"
        ))?;
        let autopsies = stmt
            .query_map(params![user_id, before, limit as i64], autopsy_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(autopsies)
    }

    // ---- migration checkpoints -----------------------------------------

    pub fn save_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO migration_checkpoints (
                run_id, batch_index, fingerprint, status, users_processed, users_failed, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                checkpoint.run_id,
                checkpoint.batch_index as i64,
                checkpoint.fingerprint,
                checkpoint.status.to_string(),
                checkpoint.users_processed as i64,
                checkpoint.users_failed as i64,
                checkpoint.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(
        &self,
        run_id: &str,
        batch_index: usize,
    ) -> Result<Option<MigrationCheckpoint>, DatabaseError> {
        let conn = self.conn()?;
        let checkpoint = conn
            .query_row(
                r#"
                SELECT run_id, batch_index, fingerprint, status, users_processed, users_failed, updated_at
                FROM migration_checkpoints WHERE run_id = ?1 AND batch_index = ?2
                "#,
                params![run_id, batch_index as i64],
                |row| {
                    Ok(MigrationCheckpoint {
                        run_id: row.get(0)?,
                        batch_index: row.get::<_, i64>(1)? as usize,
                        fingerprint: row.get(2)?,
                        status: parsed_at(row, 3)?,
                        users_processed: row.get::<_, i64>(4)? as usize,
                        users_failed: row.get::<_, i64>(5)? as usize,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }
}

impl ActivityStore for Database {
    fn activities_between(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ActivityRecord>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, date, duration_seconds, distance_m, elevation_gain_m,
                   avg_hr, max_hr, trimp, external_load
            FROM activities
            WHERE user_id = ?1 AND date >= ?2 AND date <= ?3
            ORDER BY date, id
            "#,
        )?;
        let records = stmt
            .query_map(params![user_id, start, end], activity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn first_activity_date(&self, user_id: &str) -> Result<Option<NaiveDate>, DatabaseError> {
        let conn = self.conn()?;
        let date: Option<NaiveDate> = conn.query_row(
            "SELECT MIN(date) FROM activities WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(date)
    }

    fn upsert_activities(&self, records: &[ActivityRecord]) -> Result<usize, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO activities (
                    id, user_id, date, duration_seconds, distance_m, elevation_gain_m,
                    avg_hr, max_hr, trimp, external_load, synced_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, CURRENT_TIMESTAMP)
                "#,
            )?;
            for record in records {
                stmt.execute(params![
                    record.id,
                    record.user_id,
                    record.date,
                    record.duration_seconds,
                    decimal_text(record.distance_meters),
                    decimal_text(record.elevation_gain_meters),
                    record.avg_heart_rate,
                    record.max_heart_rate,
                    decimal_text(record.trimp),
                    decimal_text(record.external_load),
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn annotate_activities(&self, annotations: &[ActivityAnnotation]) -> Result<usize, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare("UPDATE activities SET trimp = ?1, external_load = ?2 WHERE id = ?3")?;
            for annotation in annotations {
                updated += stmt.execute(params![
                    decimal_text(annotation.trimp),
                    annotation.external_load.to_string(),
                    annotation.activity_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    fn user_ids(&self) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM activities ORDER BY user_id")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(users)
    }
}

const SNAPSHOT_COLUMNS: &str = r#"
    SELECT user_id, date, configuration_id, acute_external, chronic_external,
           acute_internal, chronic_internal, external_acwr, internal_acwr, divergence,
           chronic_days_available, low_confidence
    FROM daily_load_snapshots"#;

const AUTOPSY_COLUMNS: &str = r#"
    SELECT id, user_id, date, recommendation_id, activity_ids, journal_linked,
           alignment_score, analysis, pattern, learning, created_at
    FROM autopsies"#;

fn decimal_text(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn conversion_error(column: usize, message: impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.to_string().into())
}

/// Decimal stored as TEXT
fn decimal_at(row: &Row, column: usize) -> rusqlite::Result<Option<Decimal>> {
    row.get::<_, Option<String>>(column)?
        .map(|text| text.parse::<Decimal>().map_err(|e| conversion_error(column, e)))
        .transpose()
}

fn parsed_at<T>(row: &Row, column: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let text: String = row.get(column)?;
    text.parse::<T>().map_err(|e| conversion_error(column, e))
}

fn json_at<T: DeserializeOwned>(row: &Row, column: usize) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(column, e))
}

fn configuration_from_row(row: &Row) -> rusqlite::Result<AcwrConfiguration> {
    let decay_rate = decimal_at(row, 3)?.ok_or_else(|| conversion_error(3, "missing decay rate"))?;
    Ok(AcwrConfiguration {
        id: row.get(0)?,
        name: row.get(1)?,
        parameters: AcwrParameters {
            chronic_window_days: row.get(2)?,
            decay_rate,
        },
        created_at: row.get(4)?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<ReaggregationJob> {
    Ok(ReaggregationJob {
        id: row.get(0)?,
        user_id: row.get(1)?,
        configuration_id: row.get(2)?,
        status: parsed_at(row, 3)?,
        created_at: row.get(4)?,
        error: row.get(5)?,
    })
}

fn activity_from_row(row: &Row) -> rusqlite::Result<ActivityRecord> {
    Ok(ActivityRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        date: row.get(2)?,
        duration_seconds: row.get(3)?,
        distance_meters: decimal_at(row, 4)?,
        elevation_gain_meters: decimal_at(row, 5)?,
        avg_heart_rate: row.get(6)?,
        max_heart_rate: row.get(7)?,
        trimp: decimal_at(row, 8)?,
        external_load: decimal_at(row, 9)?,
    })
}

fn snapshot_from_row(row: &Row) -> rusqlite::Result<DailyLoadSnapshot> {
    Ok(DailyLoadSnapshot {
        user_id: row.get(0)?,
        date: row.get(1)?,
        configuration_id: row.get(2)?,
        acute_external: decimal_at(row, 3)?,
        chronic_external: decimal_at(row, 4)?,
        acute_internal: decimal_at(row, 5)?,
        chronic_internal: decimal_at(row, 6)?,
        external_acwr: decimal_at(row, 7)?,
        internal_acwr: decimal_at(row, 8)?,
        divergence: decimal_at(row, 9)?,
        chronic_days_available: row.get(10)?,
        low_confidence: row.get(11)?,
    })
}

fn journal_from_row(row: &Row) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        user_id: row.get(0)?,
        date: row.get(1)?,
        notes: row.get(2)?,
        perceived_effort: row.get(3)?,
        injury_flag: row.get(4)?,
    })
}

fn autopsy_from_row(row: &Row) -> rusqlite::Result<Autopsy> {
    let alignment = match row.get::<_, Option<u8>>(6)? {
        Some(score) => AlignmentScore::Scored(score),
        None => AlignmentScore::NotApplicable,
    };
    Ok(Autopsy {
        id: row.get(0)?,
        user_id: row.get(1)?,
        date: row.get(2)?,
        recommendation_id: row.get(3)?,
        activity_ids: json_at(row, 4)?,
        journal_linked: row.get(5)?,
        alignment,
        analysis: row.get(7)?,
        pattern: parsed_at(row, 8)?,
        learning: json_at(row, 9)?,
        created_at: row.get(10)?,
    })
}

fn load_recommendation_with(
    conn: &Connection,
    user_id: &str,
    target_date: NaiveDate,
) -> Result<Option<Recommendation>, DatabaseError> {
    let recommendation = conn
        .query_row(
            r#"
            SELECT id, user_id, target_date, daily, weekly_context, pattern_insight,
                   provenance, metrics, generated_at
            FROM recommendations WHERE user_id = ?1 AND target_date = ?2
            "#,
            params![user_id, target_date],
            |row| {
                let provenance: RecommendationProvenance = json_at(row, 6)?;
                let metrics = row
                    .get::<_, Option<String>>(7)?
                    .map(|text| serde_json::from_str(&text).map_err(|e| conversion_error(7, e)))
                    .transpose()?;
                Ok(Recommendation {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    target_date: row.get(2)?,
                    daily: row.get(3)?,
                    weekly_context: row.get(4)?,
                    pattern_insight: row.get(5)?,
                    provenance,
                    metrics,
                    generated_at: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(recommendation)
}

fn load_autopsy_with(conn: &Connection, user_id: &str, date: NaiveDate) -> Result<Option<Autopsy>, DatabaseError> {
    let autopsy = conn
        .query_row(
            &format!("{AUTOPSY_COLUMNS} WHERE user_id = ?1 AND date = ?2"),
            params![user_id, date],
            autopsy_from_row,
        )
        .optional()?;
    Ok(autopsy)
}
