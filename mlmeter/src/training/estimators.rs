//! Supported model families.
//!
//! Fitted parameters are plain serde data so the registry can store them as JSON.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::debug;

use super::{
    ModelType, Result, TrainingError,
    dataset::Dataset,
    forest::{ForestClassifier, ForestRegressor},
};

/// Relative pivot size below which a linear system is treated as singular
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Upper bound on `max_iter`, which otherwise sets the cost of a single call
pub const MAX_ITER_LIMIT: usize = 100_000;

pub trait Predictor {
    /// One prediction per row of `features`.
    fn predict(&self, features: &Array2<f64>) -> Array1<f64>;
}

/// A trained model of any supported type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedModel {
    LinearRegression(LinearModel),
    LogisticRegression(LogisticModel),
    RandomForestRegressor(ForestRegressor),
    RandomForestClassifier(ForestClassifier),
}

impl FittedModel {
    /// Fit a `model_type` model on `data`. `params` must only hold keys that model accepts.
    pub fn fit(model_type: ModelType, params: &Map<String, Value>, data: &Dataset) -> Result<Self> {
        match model_type {
            ModelType::LinearRegression => Ok(FittedModel::LinearRegression(LinearModel::fit(&parse_params(params)?, data)?)),
            ModelType::LogisticRegression => Ok(FittedModel::LogisticRegression(LogisticModel::fit(&parse_params(params)?, data)?)),
            ModelType::RandomForestRegressor => Ok(FittedModel::RandomForestRegressor(ForestRegressor::fit(
                &parse_params(params)?,
                data,
            )?)),
            ModelType::RandomForestClassifier => Ok(FittedModel::RandomForestClassifier(ForestClassifier::fit(
                &parse_params(params)?,
                data,
            )?)),
        }
    }

    pub fn model_type(&self) -> ModelType {
        match self {
            FittedModel::LinearRegression(_) => ModelType::LinearRegression,
            FittedModel::LogisticRegression(_) => ModelType::LogisticRegression,
            FittedModel::RandomForestRegressor(_) => ModelType::RandomForestRegressor,
            FittedModel::RandomForestClassifier(_) => ModelType::RandomForestClassifier,
        }
    }
}

impl Predictor for FittedModel {
    fn predict(&self, features: &Array2<f64>) -> Array1<f64> {
        match self {
            FittedModel::LinearRegression(model) => model.predict(features),
            FittedModel::LogisticRegression(model) => model.predict(features),
            FittedModel::RandomForestRegressor(model) => model.predict(features),
            FittedModel::RandomForestClassifier(model) => model.predict(features),
        }
    }
}

fn parse_params<P: DeserializeOwned>(params: &Map<String, Value>) -> Result<P> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| TrainingError::validation(format!("Invalid model_params: {e}")))
}

/// Hyperparameters of [`LinearModel`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinearParams {
    /// L2 penalty; 0 is ordinary least squares
    pub alpha: f64,
    pub fit_intercept: bool,
}

impl Default for LinearParams {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            fit_intercept: true,
        }
    }
}

/// Least squares regression solved through the normal equations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub coefficients: Array1<f64>,
    pub intercept: f64,
}

impl LinearModel {
    pub fn fit(params: &LinearParams, data: &Dataset) -> Result<Self> {
        if !(params.alpha.is_finite() && params.alpha >= 0.0) {
            return Err(TrainingError::validation("alpha must be a non-negative number"));
        }

        let x = &data.features;
        let y = &data.labels;
        let n_features = x.ncols();

        let (x_mean, y_mean) = if params.fit_intercept {
            (column_means(x)?, y.mean().unwrap_or(0.0))
        } else {
            (Array1::zeros(n_features), 0.0)
        };
        let xc = x - &x_mean;
        let yc = y - y_mean;

        let mut gram = xc.t().dot(&xc);
        gram.diag_mut().mapv_inplace(|d| d + params.alpha);
        let rhs = xc.t().dot(&yc);

        let coefficients = match solve(gram.clone(), rhs.clone()) {
            Some(w) => w,
            None => {
                // Collinear columns: nudge the diagonal so the system has a unique solution
                let jitter = 1e-10 * (gram.diag().sum() / n_features as f64).max(1.0);
                debug!(jitter, "Singular normal equations, retrying with a small ridge");
                gram.diag_mut().mapv_inplace(|d| d + jitter);
                solve(gram, rhs).ok_or_else(|| {
                    TrainingError::validation("Features are linearly dependent; set a positive alpha in model_params")
                })?
            }
        };

        let intercept = y_mean - x_mean.dot(&coefficients);
        Ok(Self { coefficients, intercept })
    }
}

impl Predictor for LinearModel {
    fn predict(&self, features: &Array2<f64>) -> Array1<f64> {
        features.dot(&self.coefficients) + self.intercept
    }
}

/// Hyperparameters of [`LogisticModel`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogisticParams {
    /// Gradient descent epochs over the full training set
    pub max_iter: usize,
    pub learning_rate: f64,
    /// L2 penalty on the weights (not the intercept)
    pub alpha: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            learning_rate: 0.1,
            alpha: 1e-4,
        }
    }
}

/// Logistic regression classifier.
///
/// Two classes share one weight vector scoring the larger label; more classes are fitted one
/// versus rest and the highest score wins. Features are standardized with the training
/// statistics before scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    /// Sorted distinct labels seen in training
    pub classes: Vec<f64>,
    pub means: Array1<f64>,
    pub scales: Array1<f64>,
    /// One row per scored class
    pub weights: Array2<f64>,
    pub intercepts: Array1<f64>,
}

impl LogisticModel {
    pub fn fit(params: &LogisticParams, data: &Dataset) -> Result<Self> {
        if params.max_iter == 0 || params.max_iter > MAX_ITER_LIMIT {
            return Err(TrainingError::validation(format!(
                "max_iter must be between 1 and {MAX_ITER_LIMIT}"
            )));
        }
        if !(params.learning_rate.is_finite() && params.learning_rate > 0.0) {
            return Err(TrainingError::validation("learning_rate must be a positive number"));
        }
        if !(params.alpha.is_finite() && params.alpha >= 0.0) {
            return Err(TrainingError::validation("alpha must be a non-negative number"));
        }

        let mut classes = data.labels.to_vec();
        classes.sort_by(f64::total_cmp);
        classes.dedup();
        if classes.len() < 2 {
            return Err(TrainingError::validation(
                "logistic_regression needs at least two distinct label values in the training data",
            ));
        }

        let means = column_means(&data.features)?;
        let scales = data.features.std_axis(Axis(0), 0.0).mapv(|s| if s > 0.0 { s } else { 1.0 });
        let xs = (&data.features - &means) / &scales;

        // Binary problems score only the larger label
        let scored: &[f64] = if classes.len() == 2 { &classes[1..] } else { &classes };

        let mut weights = Array2::<f64>::zeros((scored.len(), xs.ncols()));
        let mut intercepts = Array1::<f64>::zeros(scored.len());
        for (k, &class) in scored.iter().enumerate() {
            let targets = data.labels.mapv(|y| if y == class { 1.0 } else { 0.0 });
            let (w, b) = gradient_descent(&xs, &targets, params);
            weights.row_mut(k).assign(&w);
            intercepts[k] = b;
        }

        Ok(Self {
            classes,
            means,
            scales,
            weights,
            intercepts,
        })
    }

    /// Raw linear scores, one column per scored class.
    fn scores(&self, features: &Array2<f64>) -> Array2<f64> {
        let xs = (features - &self.means) / &self.scales;
        xs.dot(&self.weights.t()) + &self.intercepts
    }
}

impl Predictor for LogisticModel {
    fn predict(&self, features: &Array2<f64>) -> Array1<f64> {
        let scores = self.scores(features);

        if self.weights.nrows() == 1 {
            // sigmoid(score) >= 0.5
            return scores.column(0).mapv(|s| if s >= 0.0 { self.classes[1] } else { self.classes[0] });
        }

        scores
            .rows()
            .into_iter()
            .map(|row| {
                let best = row
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(k, _)| k);
                self.classes[best]
            })
            .collect()
    }
}

/// Full-batch gradient descent on the L2-penalized log loss.
fn gradient_descent(xs: &Array2<f64>, targets: &Array1<f64>, params: &LogisticParams) -> (Array1<f64>, f64) {
    let n = xs.nrows() as f64;
    let mut w: Array1<f64> = Array1::zeros(xs.ncols());
    let mut b = 0.0;

    for _ in 0..params.max_iter {
        let residual = (xs.dot(&w) + b).mapv(sigmoid) - targets;
        let grad_w = xs.t().dot(&residual) / n + &w * params.alpha;
        let grad_b = residual.sum() / n;
        w.scaled_add(-params.learning_rate, &grad_w);
        b -= params.learning_rate * grad_b;
    }

    (w, b)
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn column_means(x: &Array2<f64>) -> Result<Array1<f64>> {
    x.mean_axis(Axis(0))
        .ok_or_else(|| TrainingError::validation("Training set has no rows"))
}

/// Solve `a * x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when `a` is singular (relative to its largest entry).
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let scale = a.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(f64::MIN_POSITIVE);

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot, col]].abs() <= PIVOT_TOLERANCE * scale {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([pivot, k], [col, k]);
            }
            b.swap(pivot, col);
        }

        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    fn dataset(features: Array2<f64>, labels: Array1<f64>) -> Dataset {
        Dataset { features, labels }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_solve() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let b = array![3.0, 5.0];
        let x = solve(a, b).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);

        // Needs a row swap
        let x = solve(array![[0.0, 1.0], [1.0, 0.0]], array![2.0, 3.0]).unwrap();
        assert_eq!(x.to_vec(), vec![3.0, 2.0]);

        assert!(solve(array![[1.0, 2.0], [2.0, 4.0]], array![1.0, 2.0]).is_none());
    }

    #[test]
    fn test_linear_regression_recovers_coefficients() {
        let x = array![[1.0, 0.0], [2.0, 1.0], [3.0, 5.0], [4.0, 2.0], [5.0, 7.0]];
        let y = x.column(0).mapv(|a| 3.0 * a) - x.column(1).mapv(|b| 2.0 * b) + 4.0;
        let model = LinearModel::fit(&LinearParams::default(), &dataset(x.clone(), y.clone())).unwrap();

        assert!((model.coefficients[0] - 3.0).abs() < 1e-9);
        assert!((model.coefficients[1] + 2.0).abs() < 1e-9);
        assert!((model.intercept - 4.0).abs() < 1e-9);

        let predictions = model.predict(&x);
        for (p, t) in predictions.iter().zip(y.iter()) {
            assert!((p - t).abs() < 1e-9);
        }
    }

    #[test]
    fn test_linear_without_intercept() {
        let x = array![[1.0], [2.0], [3.0]];
        let y = array![2.0, 4.0, 6.0];
        let linear = LinearParams {
            fit_intercept: false,
            ..Default::default()
        };
        let model = LinearModel::fit(&linear, &dataset(x, y)).unwrap();
        assert_eq!(model.intercept, 0.0);
        assert!((model.coefficients[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_ridge_shrinks_coefficients() {
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = array![2.0, 4.0, 6.0, 8.0];
        let data = dataset(x, y);

        let ols = LinearModel::fit(&LinearParams::default(), &data).unwrap();
        let ridge = LinearModel::fit(
            &LinearParams {
                alpha: 10.0,
                ..Default::default()
            },
            &data,
        )
        .unwrap();
        assert!(ridge.coefficients[0] < ols.coefficients[0]);
    }

    #[test]
    fn test_duplicated_column_still_fits() {
        let x = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0]];
        let y = array![1.0, 2.0, 3.0, 4.0];
        let model = LinearModel::fit(&LinearParams::default(), &dataset(x.clone(), y.clone())).unwrap();

        let predictions = model.predict(&x);
        for (p, t) in predictions.iter().zip(y.iter()) {
            assert!((p - t).abs() < 1e-4);
        }
    }

    #[test]
    fn test_logistic_multiclass() {
        // Three well separated bands on one axis
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (class, centre) in [(1.0, -10.0), (2.0, 0.0), (3.0, 10.0)] {
            for offset in [-1.0, -0.5, 0.0, 0.5, 1.0] {
                rows.push(centre + offset);
                rows.push(offset);
                labels.push(class);
            }
        }
        let x = Array2::from_shape_vec((labels.len(), 2), rows).unwrap();
        let data = dataset(x, Array1::from(labels));

        let model = LogisticModel::fit(&LogisticParams::default(), &data).unwrap();
        assert_eq!(model.classes, vec![1.0, 2.0, 3.0]);
        assert_eq!(model.weights.nrows(), 3);

        let predictions = model.predict(&array![[-10.0, 0.0], [0.2, 0.0], [9.5, 0.0]]);
        assert_eq!(predictions.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_logistic_needs_two_classes() {
        let data = dataset(array![[1.0], [2.0]], array![1.0, 1.0]);
        let err = LogisticModel::fit(&LogisticParams::default(), &data).unwrap_err();
        assert!(matches!(err, TrainingError::Validation { .. }));
    }

    #[test]
    fn test_params_parsing() {
        let data = dataset(array![[1.0], [2.0], [3.0]], array![1.0, 2.0, 3.0]);

        let model = FittedModel::fit(
            ModelType::LinearRegression,
            &params(json!({"alpha": 0.5, "fit_intercept": false})),
            &data,
        )
        .unwrap();
        assert_eq!(model.model_type(), ModelType::LinearRegression);

        let err = FittedModel::fit(ModelType::LinearRegression, &params(json!({"n_estimators": 10})), &data).unwrap_err();
        assert!(err.to_string().starts_with("Invalid model_params"));

        let err = FittedModel::fit(ModelType::LogisticRegression, &params(json!({"max_iter": "many"})), &data).unwrap_err();
        assert!(matches!(err, TrainingError::Validation { .. }));

        let err = FittedModel::fit(ModelType::LinearRegression, &params(json!({"alpha": -1.0})), &data).unwrap_err();
        assert!(matches!(err, TrainingError::Validation { .. }));
    }

    #[test]
    fn test_iteration_and_tree_counts_are_capped() {
        let data = dataset(array![[0.0], [1.0], [2.0], [3.0]], array![0.0, 0.0, 1.0, 1.0]);

        let err = FittedModel::fit(ModelType::LogisticRegression, &params(json!({"max_iter": 100_001})), &data).unwrap_err();
        assert!(err.to_string().contains("max_iter must be between 1 and 100000"));
        assert!(FittedModel::fit(ModelType::LogisticRegression, &params(json!({"max_iter": 50})), &data).is_ok());

        let err = FittedModel::fit(
            ModelType::RandomForestClassifier,
            &params(json!({"n_estimators": 1001})),
            &data,
        )
        .unwrap_err();
        assert!(matches!(err, TrainingError::Validation { .. }));
    }

    #[test]
    fn test_forest_params_parsing() {
        let data = dataset(array![[0.0], [1.0], [2.0], [3.0]], array![0.0, 0.0, 1.0, 1.0]);

        let model = FittedModel::fit(
            ModelType::RandomForestRegressor,
            &params(json!({"n_estimators": 5, "max_depth": 3, "random_state": 7})),
            &data,
        )
        .unwrap();
        assert_eq!(model.model_type(), ModelType::RandomForestRegressor);

        let err = FittedModel::fit(ModelType::RandomForestClassifier, &params(json!({"alpha": 1.0})), &data).unwrap_err();
        assert!(err.to_string().starts_with("Invalid model_params"));
    }

    #[test]
    fn test_forest_serde() {
        let data = dataset(array![[0.0], [1.0], [2.0], [3.0]], array![0.0, 0.0, 1.0, 1.0]);
        let model = FittedModel::fit(ModelType::RandomForestClassifier, &params(json!({"n_estimators": 5})), &data).unwrap();

        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["kind"], "random_forest_classifier");

        let restored: FittedModel = serde_json::from_value(json).unwrap();
        let input = array![[0.0], [3.0]];
        assert_eq!(restored.predict(&input), model.predict(&input));
    }

    #[test]
    fn test_fitted_model_serde() {
        let data = dataset(array![[0.0], [1.0], [2.0], [3.0]], array![0.0, 0.0, 1.0, 1.0]);
        let model = FittedModel::fit(ModelType::LogisticRegression, &Map::new(), &data).unwrap();

        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["kind"], "logistic_regression");

        let restored: FittedModel = serde_json::from_value(json).unwrap();
        let input = array![[0.0], [3.0]];
        assert_eq!(restored.predict(&input), model.predict(&input));
    }
}
