use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::generator::GeneratorSettings;
use crate::logging::LogConfig;
use crate::migration::MigrationSettings;
use crate::models::AcwrParameters;
use crate::recommendation::RecommendationSettings;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application metadata
    pub metadata: ConfigMetadata,

    /// General application settings
    #[serde(default)]
    pub settings: AppSettings,

    #[serde(default)]
    pub logging: LogConfig,

    /// Default ACWR parameters for users without a bound configuration
    #[serde(default)]
    pub acwr: AcwrParameters,

    #[serde(default)]
    pub recommendation: RecommendationSettings,

    #[serde(default)]
    pub generator: GeneratorSettings,

    #[serde(default)]
    pub migration: MigrationSettings,
}

/// Configuration metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// SQLite database file
    pub database_path: PathBuf,

    /// User assumed when a command omits `--user`
    pub default_user: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let now = Utc::now();
        AppConfig {
            metadata: ConfigMetadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                created_at: now,
                updated_at: now,
            },
            settings: AppSettings::default(),
            logging: LogConfig::default(),
            acwr: AcwrParameters::default(),
            recommendation: RecommendationSettings::default(),
            generator: GeneratorSettings::default(),
            migration: MigrationSettings::default(),
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            database_path: Self::default_data_dir().join("loadrs.db"),
            default_user: None,
        }
    }
}

impl AppSettings {
    fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".loadrs")
    }
}

/// Configuration management implementation
impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config
            .acwr
            .validate()
            .with_context(|| "Invalid [acwr] defaults in configuration")?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content = toml::to_string_pretty(self).with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        AppSettings::default_data_dir().join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                if config_path.exists() {
                    eprintln!("Ignoring unreadable config {}: {:#}", config_path.display(), e);
                }
                Self::default()
            }
        }
    }

    /// Save configuration to default location
    pub fn save_default(&mut self) -> Result<PathBuf> {
        let config_path = Self::default_config_path();
        self.save_to_file(&config_path)?;
        Ok(config_path)
    }

    /// Recommendation settings with the generator's sampling parameters applied
    pub fn recommendation_settings(&self) -> RecommendationSettings {
        RecommendationSettings {
            params: self.generator.params.clone(),
            ..self.recommendation.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.settings.default_user = Some("athlete-1".to_string());
        config.acwr = AcwrParameters::new(42, dec!(0.1)).unwrap();
        config.generator.command = Some("my-llm".to_string());
        config.generator.params.max_tokens = 400;
        config.migration.batch_size = 10;
        config.save_to_file(&path).unwrap();

        let loaded = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.settings.default_user.as_deref(), Some("athlete-1"));
        assert_eq!(loaded.acwr.chronic_window_days, 42);
        assert_eq!(loaded.acwr.decay_rate, dec!(0.1));
        assert_eq!(loaded.generator.command.as_deref(), Some("my-llm"));
        assert_eq!(loaded.migration.batch_size, 10);
        assert_eq!(loaded.recommendation_settings().params.max_tokens, 400);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[metadata]
version = "0.1.0"
created_at = "2024-01-01T00:00:00Z"
updated_at = "2024-01-01T00:00:00Z"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.acwr, AcwrParameters::default());
        assert_eq!(config.recommendation.history_limit, 3);
        assert!(config.generator.command.is_none());
    }

    #[test]
    fn test_out_of_range_defaults_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.acwr = AcwrParameters {
            chronic_window_days: 120,
            decay_rate: dec!(0),
        };
        config.save_to_file(&path).unwrap();

        let err = AppConfig::load_from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("chronic window"));
    }
}
