//! Random forests of CART trees.
//!
//! Each tree is grown on a bootstrap sample of the training rows, trying a random subset of the
//! features at every node. Regression trees minimize the squared error and predict the leaf
//! mean; classification trees minimize Gini impurity and predict the leaf's class frequencies.
//! The forest averages its trees. All randomness comes from one `StdRng` seeded with
//! `random_state`, so the same data and parameters always give the same forest.

use ndarray::{Array1, Array2, ArrayView1};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};

use super::{Result, TrainingError, dataset::Dataset, estimators::Predictor};

/// Upper bound on `n_estimators`, which otherwise sets the cost of a single call
pub const MAX_ESTIMATORS: usize = 1000;

/// Hyperparameters shared by [`ForestRegressor`] and [`ForestClassifier`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// Unlimited when absent
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features tried per split; all of them for regression and `sqrt(n)` for
    /// classification when absent
    pub max_features: Option<usize>,
    pub random_state: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            random_state: 42,
        }
    }
}

impl ForestParams {
    fn validate(&self, n_features: usize) -> Result<()> {
        if self.n_estimators == 0 || self.n_estimators > MAX_ESTIMATORS {
            return Err(TrainingError::validation(format!(
                "n_estimators must be between 1 and {MAX_ESTIMATORS}"
            )));
        }
        if self.max_depth == Some(0) {
            return Err(TrainingError::validation("max_depth must be positive"));
        }
        if self.min_samples_split < 2 {
            return Err(TrainingError::validation("min_samples_split must be at least 2"));
        }
        if self.min_samples_leaf == 0 {
            return Err(TrainingError::validation("min_samples_leaf must be positive"));
        }
        match self.max_features {
            Some(max_features) if max_features == 0 || max_features > n_features => Err(TrainingError::validation(
                format!("max_features must be between 1 and the number of features ({n_features})"),
            )),
            _ => Ok(()),
        }
    }
}

/// A node of a fitted tree. Children are indices into the tree's node list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
enum Node {
    /// Mean label for regression, class frequencies for classification
    Leaf { values: Vec<f64> },
    /// Rows with `x[feature] <= threshold` go left
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn leaf_values(&self, row: ArrayView1<f64>) -> &[f64] {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                Node::Leaf { values } => return values,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => id = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }
}

/// Random forest regression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestRegressor {
    pub trees: Vec<DecisionTree>,
}

impl ForestRegressor {
    pub fn fit(params: &ForestParams, data: &Dataset) -> Result<Self> {
        let n_features = data.features.ncols();
        params.validate(n_features)?;

        let target = Target::Continuous(&data.labels);
        let max_features = params.max_features.unwrap_or(n_features);
        let trees = grow_forest(&data.features, &target, params, max_features);
        Ok(Self { trees })
    }
}

impl Predictor for ForestRegressor {
    fn predict(&self, features: &Array2<f64>) -> Array1<f64> {
        let n_trees = self.trees.len().max(1) as f64;
        features
            .rows()
            .into_iter()
            .map(|row| self.trees.iter().map(|tree| tree.leaf_values(row)[0]).sum::<f64>() / n_trees)
            .collect()
    }
}

/// Random forest classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestClassifier {
    /// Sorted distinct labels seen in training; leaf frequencies follow this order
    pub classes: Vec<f64>,
    pub trees: Vec<DecisionTree>,
}

impl ForestClassifier {
    pub fn fit(params: &ForestParams, data: &Dataset) -> Result<Self> {
        let n_features = data.features.ncols();
        params.validate(n_features)?;

        let mut classes = data.labels.to_vec();
        classes.sort_by(f64::total_cmp);
        classes.dedup();
        if classes.len() < 2 {
            return Err(TrainingError::validation(
                "random_forest_classifier needs at least two distinct label values in the training data",
            ));
        }

        let labels: Vec<usize> = data
            .labels
            .iter()
            .map(|y| classes.partition_point(|c| c < y))
            .collect();
        let target = Target::Classes {
            labels: &labels,
            n_classes: classes.len(),
        };
        let max_features = params
            .max_features
            .unwrap_or_else(|| ((n_features as f64).sqrt() as usize).max(1));
        let trees = grow_forest(&data.features, &target, params, max_features);

        Ok(Self { classes, trees })
    }
}

impl Predictor for ForestClassifier {
    fn predict(&self, features: &Array2<f64>) -> Array1<f64> {
        features
            .rows()
            .into_iter()
            .map(|row| {
                let mut votes = vec![0.0; self.classes.len()];
                for tree in &self.trees {
                    for (vote, p) in votes.iter_mut().zip(tree.leaf_values(row)) {
                        *vote += p;
                    }
                }
                // Ties go to the smaller label
                let best = votes
                    .iter()
                    .enumerate()
                    .fold((0, f64::MIN), |best, (k, &v)| if v > best.1 { (k, v) } else { best })
                    .0;
                self.classes[best]
            })
            .collect()
    }
}

enum Target<'a> {
    Continuous(&'a Array1<f64>),
    Classes { labels: &'a [usize], n_classes: usize },
}

impl Target<'_> {
    fn leaf(&self, rows: &[usize]) -> Vec<f64> {
        let n = rows.len().max(1) as f64;
        match self {
            Target::Continuous(y) => vec![rows.iter().map(|&r| y[r]).sum::<f64>() / n],
            Target::Classes { labels, n_classes } => {
                let mut counts = vec![0.0; *n_classes];
                for &r in rows {
                    counts[labels[r]] += 1.0;
                }
                counts.iter().map(|c| c / n).collect()
            }
        }
    }
}

/// Running impurity statistics of a set of rows.
#[derive(Clone)]
enum Stats {
    Continuous { n: f64, sum: f64, sum_sq: f64 },
    Classes { n: f64, counts: Vec<f64> },
}

impl Stats {
    fn empty(target: &Target) -> Self {
        match target {
            Target::Continuous(_) => Stats::Continuous {
                n: 0.0,
                sum: 0.0,
                sum_sq: 0.0,
            },
            Target::Classes { n_classes, .. } => Stats::Classes {
                n: 0.0,
                counts: vec![0.0; *n_classes],
            },
        }
    }

    fn of(target: &Target, rows: &[usize]) -> Self {
        let mut stats = Self::empty(target);
        for &r in rows {
            stats.shift(target, r, 1.0);
        }
        stats
    }

    fn shift(&mut self, target: &Target, row: usize, sign: f64) {
        match (self, target) {
            (Stats::Continuous { n, sum, sum_sq }, Target::Continuous(y)) => {
                *n += sign;
                *sum += sign * y[row];
                *sum_sq += sign * y[row] * y[row];
            }
            (Stats::Classes { n, counts }, Target::Classes { labels, .. }) => {
                *n += sign;
                counts[labels[row]] += sign;
            }
            _ => {}
        }
    }

    /// Impurity times row count: squared error or Gini
    fn cost(&self) -> f64 {
        match self {
            Stats::Continuous { n, sum, sum_sq } if *n > 0.0 => (sum_sq - sum * sum / n).max(0.0),
            Stats::Classes { n, counts } if *n > 0.0 => n - counts.iter().map(|c| c * c).sum::<f64>() / n,
            _ => 0.0,
        }
    }
}

struct Split {
    feature: usize,
    threshold: f64,
    cost: f64,
}

fn grow_forest(x: &Array2<f64>, target: &Target, params: &ForestParams, max_features: usize) -> Vec<DecisionTree> {
    let n = x.nrows();
    let mut rng = StdRng::seed_from_u64(params.random_state);

    (0..params.n_estimators)
        .map(|_| {
            let sample: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
            grow_tree(x, target, sample, params, max_features, &mut rng)
        })
        .collect()
}

/// Grow one tree depth first with an explicit work list.
fn grow_tree(
    x: &Array2<f64>,
    target: &Target,
    rows: Vec<usize>,
    params: &ForestParams,
    max_features: usize,
    rng: &mut StdRng,
) -> DecisionTree {
    let placeholder = || Node::Leaf { values: Vec::new() };
    let mut nodes = vec![placeholder()];
    let mut pending = vec![(0, rows, 0)];

    while let Some((id, rows, depth)) = pending.pop() {
        let can_split = rows.len() >= params.min_samples_split
            && rows.len() >= 2 * params.min_samples_leaf
            && params.max_depth.is_none_or(|max| depth < max);

        let split = if can_split {
            let candidates = index::sample(rng, x.ncols(), max_features).into_vec();
            best_split(x, target, &rows, &candidates, params.min_samples_leaf)
        } else {
            None
        };

        match split {
            Some(split) => {
                let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
                    rows.iter().partition(|&&r| x[[r, split.feature]] <= split.threshold);
                let left = nodes.len();
                let right = left + 1;
                nodes.push(placeholder());
                nodes.push(placeholder());
                nodes[id] = Node::Split {
                    feature: split.feature,
                    threshold: split.threshold,
                    left,
                    right,
                };
                pending.push((right, right_rows, depth + 1));
                pending.push((left, left_rows, depth + 1));
            }
            None => nodes[id] = Node::Leaf { values: target.leaf(&rows) },
        }
    }

    DecisionTree { nodes }
}

/// The lowest-cost split over `features`, if any lowers the node's impurity.
fn best_split(x: &Array2<f64>, target: &Target, rows: &[usize], features: &[usize], min_leaf: usize) -> Option<Split> {
    let parent = Stats::of(target, rows).cost();
    if parent <= f64::EPSILON {
        return None;
    }

    let n = rows.len();
    let mut best: Option<Split> = None;
    let mut sorted = rows.to_vec();

    for &feature in features {
        sorted.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));
        let mut left = Stats::empty(target);
        let mut right = Stats::of(target, &sorted);

        for i in 0..n - 1 {
            left.shift(target, sorted[i], 1.0);
            right.shift(target, sorted[i], -1.0);

            let (value, next) = (x[[sorted[i], feature]], x[[sorted[i + 1], feature]]);
            if i + 1 < min_leaf || n - i - 1 < min_leaf || value == next {
                continue;
            }

            let cost = left.cost() + right.cost();
            if cost < best.as_ref().map_or(parent, |b| b.cost) {
                let mid = value + (next - value) / 2.0;
                // Guard against the midpoint rounding up to `next`
                let threshold = if mid < next { mid } else { value };
                best = Some(Split { feature, threshold, cost });
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn step_data() -> Dataset {
        // Label jumps from 10 to 50 at x = 5; the second column is noise
        let rows: Vec<f64> = (0..20).flat_map(|i| [i as f64 * 0.5, (i * 7 % 5) as f64]).collect();
        let features = Array2::from_shape_vec((20, 2), rows).unwrap();
        let labels = features.column(0).mapv(|v| if v < 5.0 { 10.0 } else { 50.0 });
        Dataset { features, labels }
    }

    #[test]
    fn test_regressor_learns_step() {
        let model = ForestRegressor::fit(&ForestParams::default(), &step_data()).unwrap();
        assert_eq!(model.trees.len(), 100);

        let predictions = model.predict(&array![[1.0, 0.0], [8.0, 0.0]]);
        assert!((predictions[0] - 10.0).abs() < 5.0, "{predictions}");
        assert!((predictions[1] - 50.0).abs() < 5.0, "{predictions}");
    }

    #[test]
    fn test_classifier_learns_bands() {
        let mut data = step_data();
        data.labels = data.labels.mapv(|y| if y > 20.0 { 3.0 } else { 1.0 });

        let model = ForestClassifier::fit(&ForestParams::default(), &data).unwrap();
        assert_eq!(model.classes, vec![1.0, 3.0]);
        assert_eq!(model.predict(&array![[0.5, 1.0], [9.0, 1.0]]).to_vec(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_same_seed_same_forest() {
        let data = step_data();
        let params = ForestParams {
            n_estimators: 10,
            ..Default::default()
        };
        let a = ForestRegressor::fit(&params, &data).unwrap();
        let b = ForestRegressor::fit(&params, &data).unwrap();

        let input = array![[4.9, 2.0], [5.1, 3.0], [2.5, 0.0]];
        assert_eq!(a.predict(&input), b.predict(&input));
    }

    #[test]
    fn test_depth_limit() {
        let params = ForestParams {
            n_estimators: 1,
            max_depth: Some(1),
            ..Default::default()
        };
        let model = ForestRegressor::fit(&params, &step_data()).unwrap();
        // One split at most: a root and two leaves
        assert!(model.trees[0].nodes.len() <= 3);
    }

    #[test]
    fn test_invalid_params() {
        let data = step_data();
        for params in [
            ForestParams {
                n_estimators: 0,
                ..Default::default()
            },
            ForestParams {
                n_estimators: MAX_ESTIMATORS + 1,
                ..Default::default()
            },
            ForestParams {
                max_depth: Some(0),
                ..Default::default()
            },
            ForestParams {
                min_samples_split: 1,
                ..Default::default()
            },
            ForestParams {
                max_features: Some(3),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                ForestRegressor::fit(&params, &data),
                Err(TrainingError::Validation { .. })
            ));
        }

        let mut single_class = data;
        single_class.labels.fill(1.0);
        assert!(ForestClassifier::fit(&ForestParams::default(), &single_class).is_err());
    }
}
