// Library interface for loadrs modules
// This allows integration tests and benches to access the core functionality

pub mod aggregator;
pub mod autopsy;
pub mod config;
pub mod configuration;
pub mod database;
pub mod error;
pub mod feedback;
pub mod generator;
pub mod import;
pub mod logging;
pub mod migration;
pub mod models;
pub mod ratio;
pub mod recommendation;
pub mod service;
pub mod trimp;

// Re-export commonly used types for convenience
pub use models::*;
pub use aggregator::LoadAggregator;
pub use autopsy::AutopsyAnalyzer;
pub use configuration::{resolve_acwr_parameters, ConfigurationService, ParameterSource, ResolvedParameters};
pub use database::{ActivityStore, Database};
pub use error::{LoadRsError, Result};
pub use feedback::{AutopsyState, FeedbackLoop, FeedbackOutcome};
pub use generator::{CommandGenerator, GenerationParams, GenerationRequest, TextGenerator, UnavailableGenerator};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use migration::{MigrationReport, MigrationRequest, MigrationRunner, MigrationSettings, MigrationTarget};
pub use ratio::RiskZone;
pub use recommendation::{RecommendationGenerator, RecommendationOutcome, RecommendationSettings};
pub use service::MetricsService;
pub use trimp::TrimpCalculator;
