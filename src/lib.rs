pub mod coin_id;
pub mod config;
pub mod schedule;
pub mod coingecko;
pub mod flatten;
pub mod ingest;
pub mod warehouse;
pub mod dag;
pub mod transform;
pub mod pipeline;
pub mod training;
pub mod error;

pub use coin_id::{CoinId, CoinIdError};
pub use config::{ConfigError, Credentials, PipelineConfig};
pub use schedule::{target_date, Scheduler};
pub use coingecko::{ClientConfig, CoinGeckoClient, FetchError};
pub use flatten::{flatten_json, CoinSnapshot};
pub use ingest::{run_ingestion, IngestReport, LoadOutcome};
pub use warehouse::{RunClaim, RunRecord, RunState, Warehouse, WarehouseError};
pub use dag::{DagError, NodeId, TaskGraph};
pub use transform::{ModelRun, SqlModel, TransformError, TransformProject, TransformRunner};
pub use pipeline::{Pipeline, PipelineTask, RunReport, TaskReport, TaskState};
pub use training::{run_training, Tracker, TrainingError, TrainingReport};
pub use error::PipelineError;
