//! Binary classification metrics.

use serde::{Deserialize, Serialize};

/// Counts of actual (row) vs predicted (column) labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_negative: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub true_positive: u64,
}

impl ConfusionMatrix {
    pub fn from_predictions(y_true: &[u8], y_pred: &[u8]) -> Self {
        let mut matrix = ConfusionMatrix::default();
        for (&actual, &predicted) in y_true.iter().zip(y_pred) {
            match (actual, predicted) {
                (1, 1) => matrix.true_positive += 1,
                (1, _) => matrix.false_negative += 1,
                (_, 1) => matrix.false_positive += 1,
                _ => matrix.true_negative += 1,
            }
        }
        matrix
    }

    pub fn total(&self) -> u64 {
        self.true_negative + self.false_positive + self.false_negative + self.true_positive
    }

    /// `[[tn, fp], [fn, tp]]`
    pub fn as_rows(&self) -> [[u64; 2]; 2] {
        [
            [self.true_negative, self.false_positive],
            [self.false_negative, self.true_positive],
        ]
    }
}

/// Test-set scores for the positive class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confusion: ConfusionMatrix,
}

impl ClassificationMetrics {
    /// Scores predictions; a zero denominator yields 0 rather than NaN.
    pub fn evaluate(y_true: &[u8], y_pred: &[u8]) -> Self {
        let confusion = ConfusionMatrix::from_predictions(y_true, y_pred);
        let tp = confusion.true_positive as f64;
        let precision = ratio(tp, tp + confusion.false_positive as f64);
        let recall = ratio(tp, tp + confusion.false_negative as f64);

        ClassificationMetrics {
            accuracy: ratio(
                (confusion.true_positive + confusion.true_negative) as f64,
                confusion.total() as f64,
            ),
            precision,
            recall,
            f1: ratio(2.0 * precision * recall, precision + recall),
            confusion,
        }
    }

    /// Metric name/value pairs as logged to the tracker.
    pub fn as_pairs(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("accuracy", self.accuracy),
            ("precision", self.precision),
            ("recall", self.recall),
            ("f1_score", self.f1),
        ]
    }
}

/// Share of predictions equal to the truth.
pub fn accuracy(y_true: &[u8], y_pred: &[u8]) -> f64 {
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    ratio(correct as f64, y_true.len().min(y_pred.len()) as f64)
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_match_hand_computed_values() {
        let y_true = [1, 1, 1, 0, 0, 0, 1, 0];
        let y_pred = [1, 0, 1, 0, 1, 0, 1, 0];
        let metrics = ClassificationMetrics::evaluate(&y_true, &y_pred);

        assert_eq!(
            metrics.confusion,
            ConfusionMatrix {
                true_negative: 3,
                false_positive: 1,
                false_negative: 1,
                true_positive: 3
            }
        );
        assert!((metrics.accuracy - 0.75).abs() < 1e-12);
        assert!((metrics.precision - 0.75).abs() < 1e-12);
        assert!((metrics.recall - 0.75).abs() < 1e-12);
        assert!((metrics.f1 - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_zero_division_yields_zero() {
        let metrics = ClassificationMetrics::evaluate(&[0, 0, 1], &[0, 0, 0]);
        assert_eq!(metrics.precision, 0.0);
        assert_eq!(metrics.recall, 0.0);
        assert_eq!(metrics.f1, 0.0);
        assert!((metrics.accuracy - 2.0 / 3.0).abs() < 1e-12);

        let empty = ClassificationMetrics::evaluate(&[], &[]);
        assert_eq!(empty.accuracy, 0.0);
    }

    #[test]
    fn test_confusion_rows_layout() {
        let matrix = ConfusionMatrix::from_predictions(&[0, 0, 1, 1, 1], &[0, 1, 0, 1, 1]);
        assert_eq!(matrix.as_rows(), [[1, 1], [1, 2]]);
    }

    #[test]
    fn test_accuracy_helper() {
        assert_eq!(accuracy(&[1, 0, 1, 1], &[1, 0, 0, 1]), 0.75);
    }
}
