//! Price-direction model training
//!
//! Loads the feature mart, grid-searches a boosted-tree classifier with
//! stratified k-fold cross-validation on the oldest rows, refits the best
//! parameters, scores the held-out recent rows and logs everything to the
//! experiment tracker.

pub mod dataset;
pub mod gbm;
pub mod grid;
pub mod metrics;
pub mod tracker;

pub use dataset::{FeatureDataset, FeatureRecord, FEATURE_COLUMNS};
pub use gbm::{FeatureImportance, GbmClassifier, GbmParams, ModelError};
pub use grid::{grid_search, stratified_folds, GridSearchResult, ParamGrid};
pub use metrics::{ClassificationMetrics, ConfusionMatrix};
pub use tracker::{Artifact, LocalTracker, LoggedRun, MlflowTracker, TrackedRun, Tracker, TrackerError};

use crate::config::TrainingSection;
use crate::warehouse::{Warehouse, WarehouseError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// A refit model with its search and test results.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub model: GbmClassifier,
    pub search: GridSearchResult,
    pub metrics: ClassificationMetrics,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Summary of one tracked training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub run_id: String,
    pub location: String,
    pub best_params: GbmParams,
    pub cv_accuracy: f64,
    pub metrics: ClassificationMetrics,
    pub train_rows: usize,
    pub test_rows: usize,
    pub num_features: usize,
}

/// Grid search on the training split, refit, and test-split scoring.
pub fn fit_and_evaluate(
    dataset: &FeatureDataset,
    section: &TrainingSection,
) -> Result<TrainedModel, TrainingError> {
    if dataset.is_empty() {
        return Err(TrainingError::MissingData("feature table has no labelled rows".to_string()));
    }
    let (train, test) = dataset.chronological_split(section.train_fraction);
    if train.is_empty() || test.is_empty() {
        return Err(TrainingError::InvalidInput(format!(
            "{} rows cannot be split into train and test at {}",
            dataset.len(),
            section.train_fraction
        )));
    }

    if train.positives() == 0 || train.positives() == train.len() {
        return Err(TrainingError::InvalidInput(format!(
            "training split of {} rows holds a single class",
            train.len()
        )));
    }

    let grid = ParamGrid::from_section(&section.grid);
    let search = grid_search(
        &train.feature_names,
        &train.rows,
        &train.labels,
        &grid,
        section.cv_folds,
    )?;

    let model = GbmClassifier::fit(search.best_params, &train.feature_names, &train.rows, &train.labels)?;
    let predictions = model.predict(&test.rows);
    let metrics = ClassificationMetrics::evaluate(&test.labels, &predictions);

    info!(
        train_rows = train.len(),
        test_rows = test.len(),
        accuracy = metrics.accuracy,
        f1 = metrics.f1,
        "Training: model evaluated"
    );

    Ok(TrainedModel {
        model,
        search,
        metrics,
        train_rows: train.len(),
        test_rows: test.len(),
    })
}

/// Params, metrics and artifacts to log for a trained model.
pub fn tracked_run(trained: &TrainedModel, section: &TrainingSection) -> Result<TrackedRun, TrainingError> {
    let best = &trained.search.best_params;
    let features = trained.model.feature_names();

    let params = BTreeMap::from([
        ("n_estimators".to_string(), best.n_estimators.to_string()),
        ("max_depth".to_string(), best.max_depth.to_string()),
        ("learning_rate".to_string(), best.learning_rate.to_string()),
        ("features".to_string(), features.join(", ")),
        ("num_features".to_string(), features.len().to_string()),
        ("cv_folds".to_string(), section.cv_folds.to_string()),
        ("train_rows".to_string(), trained.train_rows.to_string()),
        ("test_rows".to_string(), trained.test_rows.to_string()),
    ]);

    let mut metrics: BTreeMap<String, f64> = trained
        .metrics
        .as_pairs()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    metrics.insert("cv_accuracy".to_string(), trained.search.best_score);

    let model_json = trained
        .model
        .to_json()
        .map_err(|e| TrainingError::Artifact(format!("model.json: {}", e)))?;

    Ok(TrackedRun {
        run_name: section.run_name.clone(),
        params,
        metrics,
        artifacts: vec![
            Artifact {
                path: "feature_importance.csv".to_string(),
                content: feature_importance_csv(&trained.model.feature_importance())?,
            },
            Artifact {
                path: "confusion_matrix.csv".to_string(),
                content: confusion_matrix_csv(&trained.metrics.confusion)?,
            },
            Artifact {
                path: "model.json".to_string(),
                content: model_json.into_bytes(),
            },
        ],
    })
}

/// Loads features, trains off the async runtime and logs the run.
pub async fn run_training(
    warehouse: &Warehouse,
    section: &TrainingSection,
    tracker: &Tracker,
) -> Result<TrainingReport, TrainingError> {
    let dataset = FeatureDataset::load(warehouse, &section.feature_relation)?;
    let num_features = dataset.feature_names.len();

    let owned_section = section.clone();
    let trained = tokio::task::spawn_blocking(move || fit_and_evaluate(&dataset, &owned_section))
        .await
        .map_err(|e| TrainingError::Join(e.to_string()))??;

    let run = tracked_run(&trained, section)?;
    let logged = tracker.log_run(&run).await?;

    info!(
        run_id = %logged.run_id,
        n_estimators = trained.search.best_params.n_estimators,
        max_depth = trained.search.best_params.max_depth,
        learning_rate = trained.search.best_params.learning_rate,
        accuracy = trained.metrics.accuracy,
        "Training: run complete"
    );

    Ok(TrainingReport {
        run_id: logged.run_id,
        location: logged.location,
        best_params: trained.search.best_params,
        cv_accuracy: trained.search.best_score,
        metrics: trained.metrics,
        train_rows: trained.train_rows,
        test_rows: trained.test_rows,
        num_features,
    })
}

fn feature_importance_csv(importance: &[FeatureImportance]) -> Result<Vec<u8>, TrainingError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in importance {
        writer
            .serialize(row)
            .map_err(|e| TrainingError::Artifact(format!("feature_importance.csv: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| TrainingError::Artifact(format!("feature_importance.csv: {}", e.error())))
}

fn confusion_matrix_csv(confusion: &ConfusionMatrix) -> Result<Vec<u8>, TrainingError> {
    let csv_error = |e: csv::Error| TrainingError::Artifact(format!("confusion_matrix.csv: {}", e));
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["actual", "predicted_0", "predicted_1"])
        .map_err(csv_error)?;
    for (actual, counts) in confusion.as_rows().iter().enumerate() {
        writer
            .write_record([actual.to_string(), counts[0].to_string(), counts[1].to_string()])
            .map_err(csv_error)?;
    }
    writer
        .into_inner()
        .map_err(|e| TrainingError::Artifact(format!("confusion_matrix.csv: {}", e.error())))
}

/// Errors raised while training or logging a model.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingError {
    /// Arguments or data shape are unusable
    InvalidInput(String),
    /// The feature table is missing or empty
    MissingData(String),
    Model(ModelError),
    Warehouse(WarehouseError),
    Tracking(TrackerError),
    /// An artifact could not be rendered
    Artifact(String),
    /// The blocking training task panicked or was cancelled
    Join(String),
}

impl std::fmt::Display for TrainingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingError::InvalidInput(msg) => write!(f, "Invalid training input: {}", msg),
            TrainingError::MissingData(msg) => write!(f, "Missing training data: {}", msg),
            TrainingError::Model(e) => write!(f, "Model error: {}", e),
            TrainingError::Warehouse(e) => write!(f, "Warehouse error: {}", e),
            TrainingError::Tracking(e) => write!(f, "Tracking error: {}", e),
            TrainingError::Artifact(msg) => write!(f, "Artifact error: {}", msg),
            TrainingError::Join(msg) => write!(f, "Training task failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {}

impl From<ModelError> for TrainingError {
    fn from(err: ModelError) -> Self {
        TrainingError::Model(err)
    }
}

impl From<WarehouseError> for TrainingError {
    fn from(err: WarehouseError) -> Self {
        TrainingError::Warehouse(err)
    }
}

impl From<rusqlite::Error> for TrainingError {
    fn from(err: rusqlite::Error) -> Self {
        TrainingError::Warehouse(WarehouseError::from(err))
    }
}

impl From<TrackerError> for TrainingError {
    fn from(err: TrackerError) -> Self {
        TrainingError::Tracking(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_dataset(n: usize) -> FeatureDataset {
        let records = (0..n)
            .map(|i| {
                let momentum = ((i * 37) % 17) as f64 - 8.0;
                let mut values = vec![Some(1.0); FEATURE_COLUMNS.len() - 1];
                values[12] = Some(momentum);
                FeatureRecord {
                    coin_id: if i % 2 == 0 { "bitcoin" } else { "ethereum" }.to_string(),
                    report_date: format!("day-{:04}", i / 2),
                    values,
                    target: u8::from(momentum > 0.0),
                }
            })
            .collect();
        FeatureDataset::from_records(records)
    }

    fn small_section() -> TrainingSection {
        let mut section = TrainingSection::default();
        section.cv_folds = 3;
        section.grid.n_estimators = vec![5, 10];
        section.grid.max_depth = vec![2];
        section.grid.learning_rate = vec![0.3];
        section
    }

    #[test]
    fn test_fit_and_evaluate_learns_signal() {
        let dataset = synthetic_dataset(100);
        let trained = fit_and_evaluate(&dataset, &small_section()).unwrap();

        assert_eq!(trained.train_rows, 80);
        assert_eq!(trained.test_rows, 20);
        assert_eq!(trained.search.scores.len(), 2);
        assert!(trained.metrics.accuracy > 0.9);
        assert_eq!(trained.metrics.confusion.total(), 20);
    }

    #[test]
    fn test_fit_and_evaluate_rejects_empty_dataset() {
        let dataset = FeatureDataset::from_records(Vec::new());
        let err = fit_and_evaluate(&dataset, &small_section()).unwrap_err();
        assert!(matches!(err, TrainingError::MissingData(_)));
    }

    #[test]
    fn test_fit_and_evaluate_rejects_single_class_training_split() {
        let records = (0..50)
            .map(|i| {
                let mut values = vec![Some(1.0); FEATURE_COLUMNS.len() - 1];
                values[0] = Some(i as f64);
                FeatureRecord {
                    coin_id: "bitcoin".to_string(),
                    report_date: format!("day-{:04}", i),
                    values,
                    target: 1,
                }
            })
            .collect();
        let dataset = FeatureDataset::from_records(records);

        let err = fit_and_evaluate(&dataset, &small_section()).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidInput(_)));
    }

    #[test]
    fn test_tracked_run_contents() {
        let dataset = synthetic_dataset(60);
        let section = small_section();
        let trained = fit_and_evaluate(&dataset, &section).unwrap();
        let run = tracked_run(&trained, &section).unwrap();

        assert_eq!(run.params["num_features"], "23");
        assert!(run.params["features"].starts_with("coin_id, price, lag_price_1d"));
        for metric in ["accuracy", "precision", "recall", "f1_score", "cv_accuracy"] {
            assert!(run.metrics.contains_key(metric), "missing {}", metric);
        }
        let paths: Vec<&str> = run.artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["feature_importance.csv", "confusion_matrix.csv", "model.json"]);

        let confusion = String::from_utf8(run.artifacts[1].content.clone()).unwrap();
        assert!(confusion.starts_with("actual,predicted_0,predicted_1\n0,"));
        let importance = String::from_utf8(run.artifacts[0].content.clone()).unwrap();
        assert!(importance.starts_with("feature,splits,gain\n"));
        assert_eq!(importance.lines().count(), 24);
    }
}
