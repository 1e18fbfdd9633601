//! Top-level error type for pipeline operations.

use crate::coin_id::CoinIdError;
use crate::coingecko::FetchError;
use crate::config::ConfigError;
use crate::dag::DagError;
use crate::training::TrainingError;
use crate::transform::TransformError;
use crate::warehouse::WarehouseError;

/// Errors surfaced by ingestion, transformation, orchestration and training.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    Config(ConfigError),
    CoinId(CoinIdError),
    Fetch(FetchError),
    Warehouse(WarehouseError),
    Transform(TransformError),
    Dag(DagError),
    Training(TrainingError),
    /// Invalid command arguments, e.g. an inverted date range
    InvalidArgument(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{}", e),
            PipelineError::CoinId(e) => write!(f, "{}", e),
            PipelineError::Fetch(e) => write!(f, "Fetch failed: {}", e),
            PipelineError::Warehouse(e) => write!(f, "Warehouse failed: {}", e),
            PipelineError::Transform(e) => write!(f, "Transform failed: {}", e),
            PipelineError::Dag(e) => write!(f, "Task graph error: {}", e),
            PipelineError::Training(e) => write!(f, "Training failed: {}", e),
            PipelineError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err)
    }
}

impl From<CoinIdError> for PipelineError {
    fn from(err: CoinIdError) -> Self {
        PipelineError::CoinId(err)
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        PipelineError::Fetch(err)
    }
}

impl From<WarehouseError> for PipelineError {
    fn from(err: WarehouseError) -> Self {
        PipelineError::Warehouse(err)
    }
}

impl From<TransformError> for PipelineError {
    fn from(err: TransformError) -> Self {
        PipelineError::Transform(err)
    }
}

impl From<DagError> for PipelineError {
    fn from(err: DagError) -> Self {
        PipelineError::Dag(err)
    }
}

impl From<TrainingError> for PipelineError {
    fn from(err: TrainingError) -> Self {
        PipelineError::Training(err)
    }
}
