use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use colored::*;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

use loadrs::config::AppConfig;
use loadrs::configuration::ConfigurationService;
use loadrs::database::{ActivityStore, Database};
use loadrs::feedback::FeedbackLoop;
use loadrs::import::CsvImporter;
use loadrs::logging::{init_logging, LogLevel};
use loadrs::migration::{MigrationRequest, MigrationRunner, MigrationTarget};
use loadrs::models::{AthleteProfile, DailyLoadSnapshot, Gender, JobStatus, JournalEntry, RiskTolerance, Tone};
use loadrs::ratio::{describe_ratio, RiskZone};
use loadrs::recommendation::RecommendationGenerator;
use loadrs::service::MetricsService;

/// loadrs - Training Load Analytics CLI
///
/// Acute:chronic workload ratios for external and internal load, with
/// journal-driven recommendation autopsies.
#[derive(Parser)]
#[command(name = "loadrs")]
#[command(version)]
#[command(about = "Training load analytics CLI", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Import activities from CSV and re-aggregate
    Import {
        /// Input CSV file
        #[arg(short, long)]
        file: PathBuf,

        /// User for rows without a user column
        #[arg(short, long)]
        user: Option<String>,

        /// Aggregate through this date (default: today)
        #[arg(long)]
        through: Option<NaiveDate>,
    },

    /// Create or update an athlete profile
    Profile(ProfileArgs),

    /// Recompute and store snapshots for a date range
    Aggregate {
        #[arg(short, long)]
        user: Option<String>,

        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,
    },

    /// Preview, commit or inspect ACWR configurations
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Save a journal entry and run the autopsy loop
    Journal {
        #[arg(short, long)]
        user: Option<String>,

        /// Journal date (default: today)
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Free-text notes
        #[arg(short, long)]
        notes: String,

        /// Perceived effort, 1-10
        #[arg(short, long)]
        effort: Option<u8>,

        /// Flag an injury explicitly
        #[arg(long)]
        injury: bool,
    },

    /// Generate the recommendation for a target date
    Recommend {
        #[arg(short, long)]
        user: Option<String>,

        /// Target date (default: tomorrow)
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },

    /// Recompute historical snapshots in checkpointed batches
    Migrate {
        /// Single user to migrate
        #[arg(short, long, conflicts_with = "all")]
        user: Option<String>,

        /// Migrate every user
        #[arg(long)]
        all: bool,

        /// Configuration id to compute under
        #[arg(long)]
        configuration: i64,

        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        /// Resume an interrupted run
        #[arg(long)]
        resume: Option<String>,
    },

    /// List or run queued re-aggregation jobs
    Jobs {
        /// Run every pending job
        #[arg(long)]
        run: bool,

        #[arg(short, long)]
        user: Option<String>,
    },

    /// Display stored snapshots
    Show {
        #[arg(short, long)]
        user: Option<String>,

        /// Range start (default: 14 days before --to)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Range end (default: today)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

#[derive(Args)]
struct ProfileArgs {
    #[arg(short, long)]
    user: Option<String>,

    #[arg(long)]
    resting_hr: Option<u16>,

    #[arg(long)]
    max_hr: Option<u16>,

    #[arg(long)]
    gender: Option<Gender>,

    #[arg(long)]
    risk_tolerance: Option<RiskTolerance>,

    #[arg(long)]
    tone: Option<Tone>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Compute snapshots under hypothetical parameters without saving
    Preview {
        #[arg(short, long)]
        user: Option<String>,

        #[arg(long)]
        window: u16,

        #[arg(long, default_value = "0")]
        decay: Decimal,

        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,
    },

    /// Create and bind a new configuration
    Commit {
        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        name: String,

        #[arg(long)]
        window: u16,

        #[arg(long, default_value = "0")]
        decay: Decimal,

        /// Run the queued re-aggregation immediately
        #[arg(long)]
        run_now: bool,
    },

    /// Show the active parameters and every stored configuration
    Show {
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Acute ext")]
    acute_external: String,
    #[tabled(rename = "Chronic ext")]
    chronic_external: String,
    #[tabled(rename = "ACWR ext")]
    external_acwr: String,
    #[tabled(rename = "ACWR int")]
    internal_acwr: String,
    #[tabled(rename = "Divergence")]
    divergence: String,
    #[tabled(rename = "Zone")]
    zone: String,
}

impl From<&DailyLoadSnapshot> for SnapshotRow {
    fn from(s: &DailyLoadSnapshot) -> Self {
        let amount = |v: Option<Decimal>| v.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".to_string());
        SnapshotRow {
            date: s.date.to_string(),
            acute_external: amount(s.acute_external),
            chronic_external: amount(s.chronic_external),
            external_acwr: describe_ratio(s.external_acwr, s.chronic_days_available, s.low_confidence),
            internal_acwr: describe_ratio(s.internal_acwr, s.chronic_days_available, s.low_confidence),
            divergence: describe_ratio(s.divergence, s.chronic_days_available, s.low_confidence),
            zone: s
                .external_acwr
                .map(|r| RiskZone::from_acwr(r).to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct ConfigurationRow {
    #[tabled(rename = "Id")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Window")]
    window: u16,
    #[tabled(rename = "Decay")]
    decay: String,
    #[tabled(rename = "Created")]
    created: String,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Id")]
    id: i64,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Configuration")]
    configuration: i64,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

fn print_snapshots(snapshots: &[DailyLoadSnapshot]) {
    if snapshots.is_empty() {
        println!("{}", "No snapshots in range".yellow());
        return;
    }
    let rows: Vec<SnapshotRow> = snapshots.iter().map(SnapshotRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

struct App {
    config: AppConfig,
    config_path: PathBuf,
    metrics: MetricsService,
}

impl App {
    fn open(config: AppConfig, config_path: PathBuf, database: Option<PathBuf>) -> Result<Self> {
        let db_path = database.unwrap_or_else(|| config.settings.database_path.clone());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
        let store = Database::new(&db_path).with_context(|| format!("Failed to open database {}", db_path.display()))?;
        let metrics = MetricsService::new(Arc::new(store), config.acwr.clone());
        Ok(Self {
            config,
            config_path,
            metrics,
        })
    }

    fn user(&self, user: Option<String>) -> Result<String> {
        user.or_else(|| self.config.settings.default_user.clone())
            .context("No --user given and no default_user in the config")
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
    let mut config = if config_path.exists() {
        AppConfig::load_from_file(&config_path)?
    } else {
        AppConfig::default()
    };

    config.logging.level = match cli.verbose {
        0 => config.logging.level,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    init_logging(&config.logging)?;

    if let Commands::Init { force } = cli.command {
        if config_path.exists() && !force {
            println!(
                "{} {}",
                "Config already exists:".yellow(),
                config_path.display()
            );
        } else {
            config.save_to_file(&config_path)?;
            println!("{} {}", "✓ Wrote config".green(), config_path.display());
        }
        let app = App::open(config, config_path, cli.database)?;
        println!(
            "{} {}",
            "✓ Database ready".green(),
            app.config.settings.database_path.display()
        );
        return Ok(());
    }

    let app = App::open(config, config_path, cli.database)?;
    run(&app, cli.command)
}

fn run(app: &App, command: Commands) -> Result<()> {
    let store = app.metrics.store();

    match command {
        Commands::Init { .. } => {}

        Commands::Import { file, user, through } => {
            println!("{}", "Importing activities...".green().bold());
            let mut importer = CsvImporter::new();
            if let Some(user) = user.or_else(|| app.config.settings.default_user.clone()) {
                importer = importer.with_default_user(user);
            }
            let records = importer.import_file(&file)?;

            let mut by_user: BTreeMap<String, Vec<_>> = BTreeMap::new();
            for record in records {
                by_user.entry(record.user_id.clone()).or_default().push(record);
            }

            let through = through.unwrap_or_else(today);
            for (user_id, records) in by_user {
                let summary = app.metrics.sync_activities(&user_id, &records, through)?;
                println!(
                    "  {}: {} activities ({} with TRIMP), {} snapshots",
                    user_id.bold(),
                    summary.activities_stored,
                    summary.with_trimp,
                    summary.snapshots_written
                );
            }
            println!("{}", "✓ Import completed successfully".green());
        }

        Commands::Profile(args) => {
            let user_id = app.user(args.user)?;
            let mut profile = store
                .load_profile(&user_id)?
                .unwrap_or_else(|| AthleteProfile::new(&user_id));
            if let Some(hr) = args.resting_hr {
                profile.resting_hr = Some(hr);
            }
            if let Some(hr) = args.max_hr {
                profile.max_hr = Some(hr);
            }
            if let Some(gender) = args.gender {
                profile.gender = gender;
            }
            if let Some(risk) = args.risk_tolerance {
                profile.preferences.risk_tolerance = risk;
            }
            if let Some(tone) = args.tone {
                profile.preferences.tone = tone;
            }
            store.upsert_profile(&profile)?;

            let annotated = app.metrics.reannotate(&user_id)?;
            let written = app.metrics.recompute_history(&user_id, today())?;
            println!(
                "{} {} ({} activities re-annotated, {} snapshots)",
                "✓ Profile saved for".green(),
                user_id,
                annotated,
                written
            );
        }

        Commands::Aggregate { user, from, to } => {
            let user_id = app.user(user)?;
            let snapshots = app.metrics.recompute(&user_id, from, to)?;
            print_snapshots(&snapshots);
            println!("{} {} snapshots", "✓ Stored".blue(), snapshots.len());
        }

        Commands::Config { action } => run_config(app, action)?,

        Commands::Journal {
            user,
            date,
            notes,
            effort,
            injury,
        } => {
            let user_id = app.user(user)?;
            let entry = JournalEntry {
                user_id,
                date: date.unwrap_or_else(today),
                notes,
                perceived_effort: effort,
                injury_flag: injury,
            };
            let generator = app.config.generator.build();
            let settings = app.config.recommendation_settings();
            let outcome = FeedbackLoop::new(&app.metrics, generator.as_ref(), &settings)
                .save_journal_entry(&entry, today())?;

            println!("{} {}", "Journal saved:".cyan().bold(), outcome.state);
            if let Some(autopsy) = &outcome.autopsy {
                println!("  Alignment: {}", autopsy.alignment);
                println!("  Pattern:   {}", autopsy.pattern);
                println!("  {}", autopsy.analysis);
            }
            if let Some(recommendation) = &outcome.recommendation {
                let r = recommendation.recommendation();
                println!("\n{} {}", "Guidance for".cyan().bold(), r.target_date);
                println!("  {}", r.daily);
            }
        }

        Commands::Recommend { user, date } => {
            let user_id = app.user(user)?;
            let now = today();
            let target = match date {
                Some(date) => date,
                None => now.checked_add_days(Days::new(1)).context("date overflow")?,
            };
            let generator = app.config.generator.build();
            let settings = app.config.recommendation_settings();
            let outcome =
                RecommendationGenerator::new(&app.metrics, generator.as_ref(), &settings).generate(&user_id, target, now, None)?;
            let r = outcome.recommendation();

            println!("{} {} ({})", "Recommendation for".magenta().bold(), r.target_date, r.provenance.source);
            println!("\n{}\n  {}", "DAILY".bold(), r.daily);
            println!("\n{}\n  {}", "WEEKLY CONTEXT".bold(), r.weekly_context);
            println!("\n{}\n  {}", "PATTERN INSIGHT".bold(), r.pattern_insight);
            if let Some(id) = r.provenance.autopsy_id {
                println!("\n{}", format!("Informed by autopsy #{}", id).dimmed());
            }
        }

        Commands::Migrate {
            user,
            all,
            configuration,
            from,
            to,
            resume,
        } => {
            let target = match (user, all) {
                (_, true) => MigrationTarget::All,
                (Some(user), false) => MigrationTarget::User(user),
                (None, false) => MigrationTarget::User(app.user(None)?),
            };
            let runner = MigrationRunner::new(&app.metrics, app.config.migration.clone());
            let report = runner.run(&MigrationRequest {
                target,
                configuration_id: configuration,
                start: from,
                end: to,
                resume_run_id: resume,
            })?;

            println!("{}", report.to_string_pretty());
            if report.is_validated() {
                println!("{}", "✓ Migration validated".green());
            } else {
                for (user, error) in &report.errors {
                    println!("  {} {}: {}", "✗".red(), user, error);
                }
                anyhow::bail!("Migration failed validation; resume with --resume {}", report.run_id);
            }
        }

        Commands::Jobs { run, user } => {
            if run {
                let runner = MigrationRunner::new(&app.metrics, app.config.migration.clone());
                let summary = runner.run_pending_jobs(today())?;
                println!(
                    "{} {} completed, {} failed, {} snapshots",
                    "✓ Jobs:".green(),
                    summary.completed,
                    summary.failed,
                    summary.snapshots_written
                );
            } else {
                let jobs = match user {
                    Some(user) => store.jobs_for_user(&user)?,
                    None => store.jobs_with_status(JobStatus::Pending)?,
                };
                let rows: Vec<JobRow> = jobs
                    .into_iter()
                    .map(|job| JobRow {
                        id: job.id,
                        user: job.user_id,
                        configuration: job.configuration_id,
                        status: job.status.to_string(),
                        error: job.error.unwrap_or_default(),
                    })
                    .collect();
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }

        Commands::Show { user, from, to } => {
            let user_id = app.user(user)?;
            let to = to.unwrap_or_else(today);
            let from = match from {
                Some(from) => from,
                None => to.checked_sub_days(Days::new(13)).context("date underflow")?,
            };
            if store.first_activity_date(&user_id)?.is_none() {
                println!("{}", "No activities yet: not enough data".yellow());
                return Ok(());
            }
            print_snapshots(&store.load_snapshots(&user_id, from, to)?);
        }
    }

    Ok(())
}

fn run_config(app: &App, action: ConfigAction) -> Result<()> {
    let service = ConfigurationService::new(&app.metrics);

    match action {
        ConfigAction::Preview {
            user,
            window,
            decay,
            from,
            to,
        } => {
            let user_id = app.user(user)?;
            let preview = service.preview(&user_id, window, decay, from, to)?;
            println!(
                "{} window {} days, decay {} (not saved)",
                "Preview:".cyan().bold(),
                preview.parameters.chronic_window_days,
                preview.parameters.decay_rate
            );
            print_snapshots(&preview.snapshots);
        }

        ConfigAction::Commit {
            user,
            name,
            window,
            decay,
            run_now,
        } => {
            let user_id = app.user(user)?;
            let outcome = service.commit(&user_id, &name, window, decay)?;
            println!(
                "{} configuration #{} '{}' bound to {} (job #{} queued)",
                "✓".green(),
                outcome.configuration.id,
                outcome.configuration.name,
                user_id,
                outcome.job.id
            );
            if run_now {
                let summary = MigrationRunner::new(&app.metrics, app.config.migration.clone()).run_pending_jobs(today())?;
                println!("  {} snapshots recomputed", summary.snapshots_written);
            }
        }

        ConfigAction::Show { user } => {
            if let Ok(user_id) = app.user(user) {
                let active = service.active(&user_id)?;
                println!(
                    "{} {}: window {} days, decay {} ({:?})",
                    "Active for".bold(),
                    user_id,
                    active.parameters.chronic_window_days,
                    active.parameters.decay_rate,
                    active.source
                );
            }
            let rows: Vec<ConfigurationRow> = app
                .metrics
                .store()
                .list_configurations()?
                .into_iter()
                .map(|c| ConfigurationRow {
                    id: c.id,
                    name: c.name,
                    window: c.parameters.chronic_window_days,
                    decay: c.parameters.decay_rate.to_string(),
                    created: c.created_at.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
            println!("{}", format!("Config file: {}", app.config_path.display()).dimmed());
        }
    }

    Ok(())
}
