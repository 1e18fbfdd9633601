//! Hyperparameter grid search with stratified k-fold cross-validation.

use super::gbm::{GbmClassifier, GbmParams};
use super::metrics::accuracy;
use super::TrainingError;
use crate::config::GridSection;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Candidate values for each tuned hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<usize>,
    pub learning_rate: Vec<f64>,
}

impl ParamGrid {
    pub fn from_section(section: &GridSection) -> Self {
        ParamGrid {
            n_estimators: section.n_estimators.clone(),
            max_depth: section.max_depth.clone(),
            learning_rate: section.learning_rate.clone(),
        }
    }

    /// Every combination, with `learning_rate` varying slowest and
    /// `n_estimators` fastest.
    pub fn points(&self) -> Vec<GbmParams> {
        let mut points = Vec::with_capacity(self.len());
        for &learning_rate in &self.learning_rate {
            for &max_depth in &self.max_depth {
                for &n_estimators in &self.n_estimators {
                    points.push(GbmParams {
                        n_estimators,
                        max_depth,
                        learning_rate,
                        ..GbmParams::default()
                    });
                }
            }
        }
        points
    }

    pub fn len(&self) -> usize {
        self.n_estimators.len() * self.max_depth.len() * self.learning_rate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Test-fold indices for stratified k-fold splitting without shuffling.
///
/// Classes are numbered in order of first appearance. Each fold receives
/// its share of every class, and each class's samples are dealt to folds in
/// contiguous blocks, so the result depends only on the label sequence.
pub fn stratified_folds(labels: &[u8], n_splits: usize) -> Result<Vec<Vec<usize>>, TrainingError> {
    if n_splits < 2 {
        return Err(TrainingError::InvalidInput(format!(
            "need at least 2 folds, got {}",
            n_splits
        )));
    }
    if n_splits > labels.len() {
        return Err(TrainingError::InvalidInput(format!(
            "cannot split {} samples into {} folds",
            labels.len(),
            n_splits
        )));
    }

    let mut classes: Vec<u8> = Vec::new();
    let mut encoded = Vec::with_capacity(labels.len());
    for &label in labels {
        let code = match classes.iter().position(|&c| c == label) {
            Some(code) => code,
            None => {
                classes.push(label);
                classes.len() - 1
            }
        };
        encoded.push(code);
    }

    let mut counts = vec![0usize; classes.len()];
    for &code in &encoded {
        counts[code] += 1;
    }
    if counts.iter().all(|&count| count < n_splits) {
        return Err(TrainingError::InvalidInput(format!(
            "every class has fewer than {} members",
            n_splits
        )));
    }

    let mut order = encoded.clone();
    order.sort_unstable();
    let allocation: Vec<Vec<usize>> = (0..n_splits)
        .map(|fold| {
            let mut per_class = vec![0usize; classes.len()];
            for &code in order.iter().skip(fold).step_by(n_splits) {
                per_class[code] += 1;
            }
            per_class
        })
        .collect();

    let mut test_fold = vec![0usize; labels.len()];
    for class in 0..classes.len() {
        let mut assigned = (0..n_splits)
            .flat_map(|fold| std::iter::repeat(fold).take(allocation[fold][class]));
        for (i, &code) in encoded.iter().enumerate() {
            if code == class {
                test_fold[i] = assigned.next().unwrap_or(n_splits - 1);
            }
        }
    }

    Ok((0..n_splits)
        .map(|fold| (0..labels.len()).filter(|&i| test_fold[i] == fold).collect())
        .collect())
}

/// Cross-validation result for one grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPointScore {
    pub params: GbmParams,
    pub fold_scores: Vec<f64>,
    pub mean_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSearchResult {
    pub best_params: GbmParams,
    pub best_score: f64,
    /// One entry per grid point, in grid order
    pub scores: Vec<GridPointScore>,
}

struct Fold {
    train_rows: Vec<Vec<f64>>,
    train_labels: Vec<u8>,
    test_rows: Vec<Vec<f64>>,
    test_labels: Vec<u8>,
}

/// Scores every grid point by mean fold accuracy.
///
/// Grid points are evaluated in parallel; among equal scores the earliest
/// grid point wins.
pub fn grid_search(
    feature_names: &[String],
    rows: &[Vec<f64>],
    labels: &[u8],
    grid: &ParamGrid,
    n_splits: usize,
) -> Result<GridSearchResult, TrainingError> {
    if grid.is_empty() {
        return Err(TrainingError::InvalidInput("parameter grid is empty".to_string()));
    }
    if rows.len() != labels.len() {
        return Err(TrainingError::InvalidInput(format!(
            "{} rows but {} labels",
            rows.len(),
            labels.len()
        )));
    }

    let folds: Vec<Fold> = stratified_folds(labels, n_splits)?
        .into_iter()
        .map(|test| {
            let mut in_test = vec![false; rows.len()];
            for &i in &test {
                in_test[i] = true;
            }
            let train: Vec<usize> = (0..rows.len()).filter(|&i| !in_test[i]).collect();
            Fold {
                train_rows: train.iter().map(|&i| rows[i].clone()).collect(),
                train_labels: train.iter().map(|&i| labels[i]).collect(),
                test_rows: test.iter().map(|&i| rows[i].clone()).collect(),
                test_labels: test.iter().map(|&i| labels[i]).collect(),
            }
        })
        .collect();

    info!(
        grid_points = grid.len(),
        folds = folds.len(),
        samples = rows.len(),
        "Training: grid search started"
    );

    let scores: Vec<GridPointScore> = grid
        .points()
        .into_par_iter()
        .map(|params| {
            let mut fold_scores = Vec::with_capacity(folds.len());
            for fold in &folds {
                let model =
                    GbmClassifier::fit(params, feature_names, &fold.train_rows, &fold.train_labels)?;
                fold_scores.push(accuracy(&fold.test_labels, &model.predict(&fold.test_rows)));
            }
            let mean_score = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
            debug!(
                n_estimators = params.n_estimators,
                max_depth = params.max_depth,
                learning_rate = params.learning_rate,
                mean_score,
                "Training: grid point scored"
            );
            Ok(GridPointScore {
                params,
                fold_scores,
                mean_score,
            })
        })
        .collect::<Result<Vec<_>, TrainingError>>()?;

    let mut best = &scores[0];
    for score in &scores[1..] {
        if OrderedFloat(score.mean_score) > OrderedFloat(best.mean_score) {
            best = score;
        }
    }
    let (best_params, best_score) = (best.params, best.mean_score);

    info!(
        n_estimators = best_params.n_estimators,
        max_depth = best_params.max_depth,
        learning_rate = best_params.learning_rate,
        best_score,
        "Training: grid search finished"
    );

    Ok(GridSearchResult {
        best_params,
        best_score,
        scores,
    })
}
