//! Pipeline configuration.
//!
//! Static parameters (coin list, destination names, schedule, training grid)
//! live in a TOML file. Secrets never do: the API key and optional overrides
//! are read from the process environment, see [`Credentials`].

use crate::coin_id::CoinId;
use crate::warehouse::{is_valid_identifier, qualified_name};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const API_KEY_ENV: &str = "COINGECKO_API_KEY";
pub const WAREHOUSE_PATH_ENV: &str = "WAREHOUSE_PATH";
pub const MLFLOW_URI_ENV: &str = "MLFLOW_TRACKING_URI";

/// Top-level configuration, one section per pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub coingecko: CoinGeckoSection,
    #[serde(default)]
    pub warehouse: WarehouseSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub transform: TransformSection,
    #[serde(default)]
    pub training: TrainingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinGeckoSection {
    /// Static list of coins fetched on every run
    pub coins: Vec<CoinId>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub load: LoadSection,
}

/// Destination of the raw snapshot rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSection {
    pub dataset_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseSection {
    #[serde(default = "default_warehouse_path")]
    pub path: PathBuf,
}

impl Default for WarehouseSection {
    fn default() -> Self {
        WarehouseSection {
            path: default_warehouse_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSection {
    /// First logical date the pipeline is responsible for
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
    /// Daily trigger time in UTC, `HH:MM`
    #[serde(default = "default_run_at")]
    pub run_at: String,
    /// Run every missed logical date since `start_date`, oldest first
    #[serde(default = "default_true")]
    pub catchup: bool,
    /// Extra attempts per task after the first failure
    #[serde(default = "default_task_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        ScheduleSection {
            start_date: default_start_date(),
            run_at: default_run_at(),
            catchup: true,
            retries: default_task_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSection {
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    #[serde(default = "default_target_schema")]
    pub target_schema: String,
    /// Model path prefixes (relative to the project dir) that are never run
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// Source name -> dataset name used by `source('name', 'table')`
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
}

impl Default for TransformSection {
    fn default() -> Self {
        TransformSection {
            project_dir: default_project_dir(),
            target_schema: default_target_schema(),
            exclude: default_exclude(),
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    #[serde(default = "default_feature_relation")]
    pub feature_relation: String,
    #[serde(default = "default_tracking_dir")]
    pub tracking_dir: PathBuf,
    /// When set, runs are logged to this MLflow server instead of `tracking_dir`
    #[serde(default)]
    pub mlflow_uri: Option<String>,
    #[serde(default = "default_experiment_id")]
    pub experiment_id: String,
    #[serde(default = "default_run_name")]
    pub run_name: String,
    #[serde(default = "default_cv_folds")]
    pub cv_folds: usize,
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,
    /// Retrain after every n-th successful logical date when scheduling
    #[serde(default)]
    pub retrain_every_days: Option<u32>,
    #[serde(default)]
    pub grid: GridSection,
}

impl Default for TrainingSection {
    fn default() -> Self {
        TrainingSection {
            feature_relation: default_feature_relation(),
            tracking_dir: default_tracking_dir(),
            mlflow_uri: None,
            experiment_id: default_experiment_id(),
            run_name: default_run_name(),
            cv_folds: default_cv_folds(),
            train_fraction: default_train_fraction(),
            retrain_every_days: None,
            grid: GridSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSection {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<usize>,
    pub learning_rate: Vec<f64>,
}

impl Default for GridSection {
    fn default() -> Self {
        GridSection {
            n_estimators: vec![50, 100, 200],
            max_depth: vec![3, 5, 7],
            learning_rate: vec![0.05, 0.1, 0.2],
        }
    }
}

fn default_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_requests_per_second() -> f64 {
    0.5
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_warehouse_path() -> PathBuf {
    PathBuf::from("coingecko.db")
}
fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 31).unwrap_or_default()
}
fn default_run_at() -> String {
    "08:30".to_string()
}
fn default_true() -> bool {
    true
}
fn default_task_retries() -> u32 {
    1
}
fn default_retry_delay_seconds() -> u64 {
    300
}
fn default_project_dir() -> PathBuf {
    PathBuf::from("coingecko_models")
}
fn default_target_schema() -> String {
    "dev_coingecko".to_string()
}
fn default_exclude() -> Vec<String> {
    vec!["models/example".to_string()]
}
fn default_feature_relation() -> String {
    "dev_coingecko_marts__ml_features_price_changes".to_string()
}
fn default_tracking_dir() -> PathBuf {
    PathBuf::from("mlruns")
}
fn default_experiment_id() -> String {
    "0".to_string()
}
fn default_run_name() -> String {
    "price_changes_direction_gbm".to_string()
}
fn default_cv_folds() -> usize {
    5
}
fn default_train_fraction() -> f64 {
    0.8
}

impl PipelineConfig {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parses and validates a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coingecko.coins.is_empty() {
            return Err(ConfigError::Invalid("coingecko.coins is empty".to_string()));
        }
        if !(self.coingecko.requests_per_second >= 0.0) {
            return Err(ConfigError::Invalid(
                "coingecko.requests_per_second must be >= 0".to_string(),
            ));
        }

        let identifiers = [
            ("coingecko.load.dataset_name", &self.coingecko.load.dataset_name),
            ("coingecko.load.table_name", &self.coingecko.load.table_name),
            ("transform.target_schema", &self.transform.target_schema),
            ("training.feature_relation", &self.training.feature_relation),
        ];
        for (field, value) in identifiers {
            if !is_valid_identifier(value) {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' must match [A-Za-z0-9_]+",
                    field, value
                )));
            }
        }
        for (name, dataset) in &self.transform.sources {
            if !is_valid_identifier(dataset) {
                return Err(ConfigError::Invalid(format!(
                    "transform.sources.{} '{}' must match [A-Za-z0-9_]+",
                    name, dataset
                )));
            }
        }

        self.run_at()?;

        let training = &self.training;
        if training.cv_folds < 2 {
            return Err(ConfigError::Invalid("training.cv_folds must be >= 2".to_string()));
        }
        if !(training.train_fraction > 0.0 && training.train_fraction < 1.0) {
            return Err(ConfigError::Invalid(
                "training.train_fraction must be in (0, 1)".to_string(),
            ));
        }
        if training.retrain_every_days == Some(0) {
            return Err(ConfigError::Invalid(
                "training.retrain_every_days must be >= 1".to_string(),
            ));
        }
        let grid = &training.grid;
        if grid.n_estimators.is_empty() || grid.max_depth.is_empty() || grid.learning_rate.is_empty()
        {
            return Err(ConfigError::Invalid("training.grid axes cannot be empty".to_string()));
        }
        if grid.learning_rate.iter().any(|lr| !(*lr > 0.0)) {
            return Err(ConfigError::Invalid(
                "training.grid.learning_rate values must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Daily trigger time.
    pub fn run_at(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.schedule.run_at, "%H:%M").map_err(|e| {
            ConfigError::Invalid(format!(
                "schedule.run_at '{}' is not HH:MM: {}",
                self.schedule.run_at, e
            ))
        })
    }

    /// Warehouse relation receiving the raw snapshot rows.
    pub fn raw_relation(&self) -> String {
        qualified_name(&self.coingecko.load.dataset_name, &self.coingecko.load.table_name)
    }

    /// Source name -> dataset map for the transform layer.
    ///
    /// The `coingecko` source always resolves to the ingestion dataset unless
    /// the file overrides it explicitly.
    pub fn source_datasets(&self) -> BTreeMap<String, String> {
        let mut sources = self.transform.sources.clone();
        sources
            .entry("coingecko".to_string())
            .or_insert_with(|| self.coingecko.load.dataset_name.clone());
        sources
    }

    /// Warehouse file, preferring the environment override.
    pub fn warehouse_path(&self, credentials: &Credentials) -> PathBuf {
        credentials
            .warehouse_path
            .clone()
            .unwrap_or_else(|| self.warehouse.path.clone())
    }

    /// MLflow server, preferring the environment override.
    pub fn mlflow_uri(&self, credentials: &Credentials) -> Option<String> {
        credentials
            .mlflow_uri
            .clone()
            .or_else(|| self.training.mlflow_uri.clone())
    }
}

/// Secrets and per-host overrides taken from the environment.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub warehouse_path: Option<PathBuf>,
    pub mlflow_uri: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("warehouse_path", &self.warehouse_path)
            .field("mlflow_uri", &self.mlflow_uri)
            .finish()
    }
}

impl Credentials {
    /// Reads credentials from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads credentials through an arbitrary lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Credentials {
            api_key: read(API_KEY_ENV),
            warehouse_path: read(WAREHOUSE_PATH_ENV).map(PathBuf::from),
            mlflow_uri: read(MLFLOW_URI_ENV),
        }
    }

    /// Returns the API key or a descriptive error naming the variable.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or(ConfigError::MissingSecret(API_KEY_ENV))
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read
    Io(String),
    /// The file is not valid TOML for this schema
    Parse(String),
    /// A value is out of range or inconsistent
    Invalid(String),
    /// A required environment variable is unset
    MissingSecret(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "Config read error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
            ConfigError::MissingSecret(var) => {
                write!(f, "Missing secret: environment variable {} is not set", var)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [coingecko]
        coins = ["bitcoin", "ethereum"]

        [coingecko.load]
        dataset_name = "raw_coingecko"
        table_name = "coins_history"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = PipelineConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.coingecko.coins.len(), 2);
        assert_eq!(config.coingecko.base_url, "https://api.coingecko.com/api/v3");
        assert_eq!(config.schedule.retries, 1);
        assert!(config.schedule.catchup);
        assert_eq!(config.run_at().unwrap(), NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(config.transform.exclude, vec!["models/example".to_string()]);
        assert_eq!(config.training.grid.n_estimators, vec![50, 100, 200]);
        assert_eq!(config.raw_relation(), "raw_coingecko__coins_history");
    }

    #[test]
    fn test_source_datasets_default_to_load_dataset() {
        let config = PipelineConfig::from_toml(MINIMAL).unwrap();
        let sources = config.source_datasets();
        assert_eq!(sources.get("coingecko").map(String::as_str), Some("raw_coingecko"));
    }

    #[test]
    fn test_empty_coin_list_rejected() {
        let content = MINIMAL.replace(r#"["bitcoin", "ethereum"]"#, "[]");
        let err = PipelineConfig::from_toml(&content).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_invalid_coin_id_rejected_at_parse() {
        let content = MINIMAL.replace(r#""ethereum""#, r#""ether eum""#);
        let err = PipelineConfig::from_toml(&content).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unsafe_table_name_rejected() {
        let content = MINIMAL.replace("coins_history", "coins; drop table x");
        let err = PipelineConfig::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("table_name"));
    }

    #[test]
    fn test_bad_run_at_rejected() {
        let content = format!("{}\n[schedule]\nrun_at = \"8h30\"\n", MINIMAL);
        assert!(PipelineConfig::from_toml(&content).is_err());
    }

    #[test]
    fn test_credentials_from_lookup_ignores_blank_values() {
        let creds = Credentials::from_lookup(|key| match key {
            API_KEY_ENV => Some("  ".to_string()),
            WAREHOUSE_PATH_ENV => Some("/tmp/wh.db".to_string()),
            _ => None,
        });
        assert!(creds.api_key.is_none());
        assert_eq!(creds.require_api_key().unwrap_err(), ConfigError::MissingSecret(API_KEY_ENV));
        assert_eq!(creds.warehouse_path, Some(PathBuf::from("/tmp/wh.db")));
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let config = PipelineConfig::from_toml(MINIMAL).unwrap();
        let creds = Credentials {
            api_key: Some("key".to_string()),
            warehouse_path: Some(PathBuf::from("override.db")),
            mlflow_uri: Some("http://mlflow:5000".to_string()),
        };
        assert_eq!(config.warehouse_path(&creds), PathBuf::from("override.db"));
        assert_eq!(config.mlflow_uri(&creds).as_deref(), Some("http://mlflow:5000"));
        assert_eq!(config.warehouse_path(&Credentials::default()), PathBuf::from("coingecko.db"));
    }

    #[test]
    fn test_credentials_debug_hides_api_key() {
        let creds = Credentials {
            api_key: Some("secret-key".to_string()),
            ..Credentials::default()
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret-key"));
    }
}
