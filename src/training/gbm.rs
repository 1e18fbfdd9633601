//! Gradient Boosting Machine implementation
//!
//! Binary classifier with logistic loss. Each round fits one regression tree
//! to the first and second derivatives of the loss (Newton boosting), grown
//! level by level with exact greedy splits over presorted feature columns.
//! Missing values (`NaN`) are routed by a per-split default direction chosen
//! during training.

use serde::{Deserialize, Serialize};

const MIN_HESSIAN: f64 = 1e-16;
const PROBABILITY_CLAMP: f64 = 1e-6;
const NO_SLOT: usize = usize::MAX;

/// Errors that can occur with the model
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Training data is empty or malformed
    InvalidData(String),
    /// Hyperparameters are out of range
    InvalidParams(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            ModelError::InvalidParams(msg) => write!(f, "Invalid parameters: {}", msg),
        }
    }
}

impl std::error::Error for ModelError {}

/// GBM hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GbmParams {
    /// Number of boosting rounds (trees)
    pub n_estimators: usize,
    /// Maximum depth of each tree
    pub max_depth: usize,
    /// Shrinkage applied to every leaf value
    pub learning_rate: f64,
    /// L2 regularisation on leaf values
    pub reg_lambda: f64,
    /// Minimum hessian sum required in each child
    pub min_child_weight: f64,
}

impl Default for GbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.3,
            reg_lambda: 1.0,
            min_child_weight: 1.0,
        }
    }
}

impl GbmParams {
    fn validate(&self) -> Result<(), ModelError> {
        if self.n_estimators == 0 {
            return Err(ModelError::InvalidParams("n_estimators must be >= 1".to_string()));
        }
        if self.max_depth == 0 {
            return Err(ModelError::InvalidParams("max_depth must be >= 1".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ModelError::InvalidParams("learning_rate must be > 0".to_string()));
        }
        if !(self.reg_lambda >= 0.0) || !(self.min_child_weight >= 0.0) {
            return Err(ModelError::InvalidParams(
                "reg_lambda and min_child_weight must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One node of a flattened tree; children are indices into the same vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        /// Values strictly below go left
        threshold: f64,
        /// Direction taken by missing values
        default_left: bool,
        left: usize,
        right: usize,
    },
}

/// A regression tree; the root is node 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    fn predict_with<F: Fn(usize) -> f64>(&self, value_of: F) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                } => {
                    let x = value_of(*feature);
                    let go_left = if x.is_nan() { *default_left } else { x < *threshold };
                    index = if go_left { *left } else { *right };
                }
            }
        }
    }
}

/// Per-feature importance of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    /// Number of splits using the feature
    pub splits: u32,
    /// Summed loss reduction of those splits
    pub gain: f64,
}

/// Fitted boosted-tree binary classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmClassifier {
    params: GbmParams,
    feature_names: Vec<String>,
    /// Initial log-odds shared by every sample
    base_margin: f64,
    trees: Vec<Tree>,
    split_counts: Vec<u32>,
    split_gains: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    node: usize,
    grad: f64,
    hess: f64,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    default_left: bool,
    gain: f64,
    left_grad: f64,
    left_hess: f64,
}

/// Training state shared by every boosting round.
struct Trainer<'a> {
    params: &'a GbmParams,
    columns: Vec<Vec<f64>>,
    /// Per feature, indices of non-missing samples in ascending value order
    sorted: Vec<Vec<usize>>,
}

impl GbmClassifier {
    /// Fits a classifier on row-major features and 0/1 labels.
    pub fn fit(
        params: GbmParams,
        feature_names: &[String],
        rows: &[Vec<f64>],
        labels: &[u8],
    ) -> Result<Self, ModelError> {
        params.validate()?;
        let n = rows.len();
        let d = feature_names.len();
        if n == 0 {
            return Err(ModelError::InvalidData("no training rows".to_string()));
        }
        if labels.len() != n {
            return Err(ModelError::InvalidData(format!(
                "{} rows but {} labels",
                n,
                labels.len()
            )));
        }
        if let Some(row) = rows.iter().find(|row| row.len() != d) {
            return Err(ModelError::InvalidData(format!(
                "row has {} values, expected {}",
                row.len(),
                d
            )));
        }
        if labels.iter().any(|&label| label > 1) {
            return Err(ModelError::InvalidData("labels must be 0 or 1".to_string()));
        }

        let columns: Vec<Vec<f64>> = (0..d).map(|f| rows.iter().map(|row| row[f]).collect()).collect();
        let sorted = columns
            .iter()
            .map(|column| {
                let mut indices: Vec<usize> = (0..n).filter(|&i| !column[i].is_nan()).collect();
                indices.sort_by(|&a, &b| column[a].total_cmp(&column[b]));
                indices
            })
            .collect();
        let trainer = Trainer {
            params: &params,
            columns,
            sorted,
        };

        let targets: Vec<f64> = labels.iter().map(|&label| f64::from(label)).collect();
        let positive_rate = (targets.iter().sum::<f64>() / n as f64)
            .clamp(PROBABILITY_CLAMP, 1.0 - PROBABILITY_CLAMP);
        let base_margin = (positive_rate / (1.0 - positive_rate)).ln();

        let mut model = GbmClassifier {
            params,
            feature_names: feature_names.to_vec(),
            base_margin,
            trees: Vec::with_capacity(params.n_estimators),
            split_counts: vec![0; d],
            split_gains: vec![0.0; d],
        };

        let mut margins = vec![base_margin; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        for _ in 0..params.n_estimators {
            for i in 0..n {
                let p = sigmoid(margins[i]);
                grad[i] = p - targets[i];
                hess[i] = (p * (1.0 - p)).max(MIN_HESSIAN);
            }

            let tree = trainer.build_tree(&grad, &hess, &mut model.split_counts, &mut model.split_gains);
            for (i, margin) in margins.iter_mut().enumerate() {
                *margin += tree.predict_with(|f| trainer.columns[f][i]);
            }
            model.trees.push(tree);
        }

        Ok(model)
    }

    pub fn params(&self) -> &GbmParams {
        &self.params
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    /// Probability of class 1 for each row.
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter().map(|row| sigmoid(self.margin(row))).collect()
    }

    /// Class predictions, 1 when the probability exceeds 0.5.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Vec<u8> {
        self.predict_proba(rows)
            .into_iter()
            .map(|p| u8::from(p > 0.5))
            .collect()
    }

    fn margin(&self, row: &[f64]) -> f64 {
        self.base_margin
            + self
                .trees
                .iter()
                .map(|tree| tree.predict_with(|f| row.get(f).copied().unwrap_or(f64::NAN)))
                .sum::<f64>()
    }

    /// Split count and gain per feature, most used first.
    pub fn feature_importance(&self) -> Vec<FeatureImportance> {
        let mut importance: Vec<FeatureImportance> = self
            .feature_names
            .iter()
            .enumerate()
            .map(|(f, name)| FeatureImportance {
                feature: name.clone(),
                splits: self.split_counts[f],
                gain: self.split_gains[f],
            })
            .collect();
        importance.sort_by(|a, b| {
            b.splits
                .cmp(&a.splits)
                .then_with(|| b.gain.total_cmp(&a.gain))
                .then_with(|| a.feature.cmp(&b.feature))
        });
        importance
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Trainer<'_> {
    fn leaf_value(&self, grad: f64, hess: f64) -> f64 {
        -grad / (hess + self.params.reg_lambda) * self.params.learning_rate
    }

    fn score(&self, grad: f64, hess: f64) -> f64 {
        grad * grad / (hess + self.params.reg_lambda)
    }

    fn build_tree(
        &self,
        grad: &[f64],
        hess: &[f64],
        split_counts: &mut [u32],
        split_gains: &mut [f64],
    ) -> Tree {
        let n = grad.len();
        let mut nodes = vec![TreeNode::Leaf { value: 0.0 }];
        let mut position = vec![0usize; n];
        let mut open = vec![OpenNode {
            node: 0,
            grad: grad.iter().sum(),
            hess: hess.iter().sum(),
            count: n,
        }];

        for depth in 0..=self.params.max_depth {
            if open.is_empty() {
                break;
            }
            let candidates = if depth < self.params.max_depth {
                self.best_splits(&open, &position, nodes.len(), grad, hess)
            } else {
                vec![None; open.len()]
            };

            let mut next_open = Vec::new();
            for (slot, current) in open.iter().enumerate() {
                match candidates[slot] {
                    Some(candidate) if candidate.gain > 0.0 => {
                        let left = nodes.len();
                        let right = left + 1;
                        nodes.push(TreeNode::Leaf { value: 0.0 });
                        nodes.push(TreeNode::Leaf { value: 0.0 });
                        nodes[current.node] = TreeNode::Split {
                            feature: candidate.feature,
                            threshold: candidate.threshold,
                            default_left: candidate.default_left,
                            left,
                            right,
                        };
                        split_counts[candidate.feature] += 1;
                        split_gains[candidate.feature] += candidate.gain;

                        next_open.push(OpenNode {
                            node: left,
                            grad: candidate.left_grad,
                            hess: candidate.left_hess,
                            count: 0,
                        });
                        next_open.push(OpenNode {
                            node: right,
                            grad: current.grad - candidate.left_grad,
                            hess: current.hess - candidate.left_hess,
                            count: 0,
                        });
                    }
                    _ => {
                        nodes[current.node] = TreeNode::Leaf {
                            value: self.leaf_value(current.grad, current.hess),
                        };
                    }
                }
            }

            // Route samples of freshly split nodes into their children.
            for (i, node) in position.iter_mut().enumerate() {
                if let TreeNode::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                } = &nodes[*node]
                {
                    let x = self.columns[*feature][i];
                    let go_left = if x.is_nan() { *default_left } else { x < *threshold };
                    *node = if go_left { *left } else { *right };
                }
            }
            let mut counts = vec![0usize; nodes.len()];
            for &node in &position {
                counts[node] += 1;
            }
            for child in next_open.iter_mut() {
                child.count = counts[child.node];
            }
            open = next_open;
        }

        Tree { nodes }
    }

    /// Keeps `candidate` in `best` when it is valid and strictly better.
    #[allow(clippy::too_many_arguments)]
    fn consider(
        &self,
        best: &mut Option<SplitCandidate>,
        node: &OpenNode,
        feature: usize,
        threshold: f64,
        default_left: bool,
        left_grad: f64,
        left_hess: f64,
    ) {
        let right_grad = node.grad - left_grad;
        let right_hess = node.hess - left_hess;
        let min_child = self.params.min_child_weight;
        if left_hess < min_child || right_hess < min_child {
            return;
        }
        let gain = 0.5
            * (self.score(left_grad, left_hess) + self.score(right_grad, right_hess)
                - self.score(node.grad, node.hess));
        if best.map_or(true, |current| gain > current.gain) {
            *best = Some(SplitCandidate {
                feature,
                threshold,
                default_left,
                gain,
                left_grad,
                left_hess,
            });
        }
    }

    /// Best split per open node, scanning each presorted column once.
    fn best_splits(
        &self,
        open: &[OpenNode],
        position: &[usize],
        node_count: usize,
        grad: &[f64],
        hess: &[f64],
    ) -> Vec<Option<SplitCandidate>> {
        let slots = open.len();
        let mut slot_of = vec![NO_SLOT; node_count];
        for (slot, current) in open.iter().enumerate() {
            slot_of[current.node] = slot;
        }
        let mut best: Vec<Option<SplitCandidate>> = vec![None; slots];

        for (feature, order) in self.sorted.iter().enumerate() {
            let column = &self.columns[feature];

            let mut present_grad = vec![0.0; slots];
            let mut present_hess = vec![0.0; slots];
            let mut present_count = vec![0usize; slots];
            for &i in order {
                let slot = slot_of[position[i]];
                if slot == NO_SLOT {
                    continue;
                }
                present_grad[slot] += grad[i];
                present_hess[slot] += hess[i];
                present_count[slot] += 1;
            }

            let mut left_grad = vec![0.0; slots];
            let mut left_hess = vec![0.0; slots];
            let mut last: Vec<Option<f64>> = vec![None; slots];
            for &i in order {
                let slot = slot_of[position[i]];
                if slot == NO_SLOT {
                    continue;
                }
                let value = column[i];
                if let Some(previous) = last[slot] {
                    if value > previous {
                        let node = &open[slot];
                        let mut threshold = previous + (value - previous) / 2.0;
                        if threshold <= previous {
                            threshold = value;
                        }
                        let missing_grad = node.grad - present_grad[slot];
                        let missing_hess = node.hess - present_hess[slot];
                        let options = [
                            (false, left_grad[slot], left_hess[slot]),
                            (true, left_grad[slot] + missing_grad, left_hess[slot] + missing_hess),
                        ];
                        let tried = if present_count[slot] < node.count { 2 } else { 1 };
                        for &(default_left, gl, hl) in &options[..tried] {
                            self.consider(&mut best[slot], node, feature, threshold, default_left, gl, hl);
                        }
                    }
                }
                left_grad[slot] += grad[i];
                left_hess[slot] += hess[i];
                last[slot] = Some(value);
            }

            // Every present value on the left, every missing one on the right.
            for (slot, node) in open.iter().enumerate() {
                if present_count[slot] > 0 && present_count[slot] < node.count {
                    self.consider(
                        &mut best[slot],
                        node,
                        feature,
                        f64::MAX,
                        false,
                        present_grad[slot],
                        present_hess[slot],
                    );
                }
            }
        }

        best
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{}", i)).collect()
    }

    fn params(n_estimators: usize, max_depth: usize) -> GbmParams {
        GbmParams {
            n_estimators,
            max_depth,
            learning_rate: 0.3,
            ..GbmParams::default()
        }
    }

    #[test]
    fn test_learns_threshold_rule() {
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let labels: Vec<u8> = (0..40).map(|i| u8::from(i >= 20)).collect();

        let model = GbmClassifier::fit(params(20, 2), &names(2), &rows, &labels).unwrap();
        assert_eq!(model.predict(&rows), labels);

        let importance = model.feature_importance();
        assert_eq!(importance[0].feature, "f0");
        assert!(importance[0].splits > 0);
        assert!(importance[0].gain > 0.0);
    }

    #[test]
    fn test_probabilities_in_unit_interval() {
        let rows: Vec<Vec<f64>> = (0..30).map(|i| vec![(i * 7 % 11) as f64]).collect();
        let labels: Vec<u8> = (0..30).map(|i| (i % 2) as u8).collect();
        let model = GbmClassifier::fit(params(10, 3), &names(1), &rows, &labels).unwrap();

        for p in model.predict_proba(&rows) {
            assert!(p > 0.0 && p < 1.0);
        }
    }

    #[test]
    fn test_missing_values_follow_learned_direction() {
        // Missing values only occur on positive samples.
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..20 {
            rows.push(vec![i as f64]);
            labels.push(0);
            rows.push(vec![f64::NAN]);
            labels.push(1);
        }
        let model = GbmClassifier::fit(params(20, 2), &names(1), &rows, &labels).unwrap();

        assert_eq!(model.predict(&[vec![f64::NAN]]), vec![1]);
        assert_eq!(model.predict(&[vec![5.0]]), vec![0]);
    }

    #[test]
    fn test_single_class_predicts_that_class() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let labels = vec![1u8; 10];
        let model = GbmClassifier::fit(params(5, 3), &names(1), &rows, &labels).unwrap();
        assert_eq!(model.predict(&rows), labels);
    }

    #[test]
    fn test_min_child_weight_blocks_tiny_splits() {
        let rows = vec![vec![0.0], vec![1.0]];
        let labels = vec![0u8, 1u8];
        // Each child would hold a hessian of 0.25, below the default of 1.0.
        let model = GbmClassifier::fit(params(3, 3), &names(1), &rows, &labels).unwrap();
        assert!(model
            .trees()
            .iter()
            .all(|tree| matches!(tree.nodes.as_slice(), [TreeNode::Leaf { .. }])));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let rows = vec![vec![1.0, 2.0]];
        assert!(GbmClassifier::fit(params(1, 1), &names(2), &[], &[]).is_err());
        assert!(GbmClassifier::fit(params(1, 1), &names(2), &rows, &[0, 1]).is_err());
        assert!(GbmClassifier::fit(params(1, 1), &names(3), &rows, &[0]).is_err());
        assert!(GbmClassifier::fit(params(1, 1), &names(2), &rows, &[2]).is_err());
        assert!(GbmClassifier::fit(params(0, 1), &names(2), &rows, &[0]).is_err());
    }

    #[test]
    fn test_serde_round_trip_preserves_predictions() {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, (20 - i) as f64]).collect();
        let labels: Vec<u8> = (0..20).map(|i| u8::from(i % 4 < 2)).collect();
        let model = GbmClassifier::fit(params(8, 3), &names(2), &rows, &labels).unwrap();

        let restored: GbmClassifier = serde_json::from_str(&model.to_json().unwrap()).unwrap();
        assert_eq!(restored.predict_proba(&rows), model.predict_proba(&rows));
    }
}
