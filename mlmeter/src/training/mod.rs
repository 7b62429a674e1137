//! Model training and prediction.
//!
//! - [`dataset`]: CSV parsing and the deterministic train/test split
//! - [`estimators`]: the supported model families and their fitted parameters
//! - [`evaluation`]: regression and classification metrics
//! - [`forest`]: random forest regression and classification
//! - [`registry`]: file-backed storage of trained models
//!
//! [`TrainingService`] ties them together behind the four operations the HTTP layer meters:
//! train, predict, list and metrics. Everything here is synchronous and CPU bound; callers on
//! the async runtime go through `tokio::task::spawn_blocking`.

pub mod dataset;
pub mod estimators;
pub mod evaluation;
pub mod forest;
pub mod registry;

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::Utc;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error as ThisError;
use tracing::{info, instrument};
use utoipa::ToSchema;

use dataset::Dataset;
use estimators::{FittedModel, Predictor};
use registry::{ModelRecord, ModelRegistry, StoredModel};

/// Seed of the train/test shuffle, so a retrain on the same file reproduces its metrics
pub const SPLIT_SEED: u64 = 42;

/// Metric name to value
pub type Metrics = BTreeMap<String, f64>;

#[derive(ThisError, Debug)]
pub enum TrainingError {
    /// Bad input: unknown columns, non-numeric values, bad parameters
    #[error("{message}")]
    Validation { message: String },

    /// A prediction input lacks some of the model's features
    #[error("Missing features in input: {}", .features.join(", "))]
    MissingFeature { features: Vec<String> },

    #[error("Model '{name}' not found")]
    ModelNotFound { name: String },

    #[error("Model storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Training failed: {message}")]
    Internal { message: String },
}

impl TrainingError {
    pub fn validation(message: impl Into<String>) -> Self {
        TrainingError::Validation { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, TrainingError>;

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    LinearRegression,
    LogisticRegression,
    RandomForestRegressor,
    RandomForestClassifier,
}

impl ModelType {
    pub const ALL: [ModelType; 4] = [
        ModelType::LinearRegression,
        ModelType::LogisticRegression,
        ModelType::RandomForestRegressor,
        ModelType::RandomForestClassifier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::LinearRegression => "linear_regression",
            ModelType::LogisticRegression => "logistic_regression",
            ModelType::RandomForestRegressor => "random_forest_regressor",
            ModelType::RandomForestClassifier => "random_forest_classifier",
        }
    }

    pub fn is_classification(&self) -> bool {
        matches!(self, ModelType::LogisticRegression | ModelType::RandomForestClassifier)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self> {
        ModelType::ALL.into_iter().find(|t| t.as_str() == s).ok_or_else(|| {
            let supported: Vec<_> = ModelType::ALL.iter().map(ModelType::as_str).collect();
            TrainingError::validation(format!(
                "Unsupported model type: {s}. Supported types: {}",
                supported.join(", ")
            ))
        })
    }
}

/// Everything needed to fit and store one model.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    pub model_name: String,
    pub model_type: ModelType,
    pub features: Vec<String>,
    pub label: String,
    pub model_params: Map<String, Value>,
    pub test_size: f64,
}

/// Outcome of a successful training run.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub model_type: ModelType,
    pub features: Vec<String>,
    pub label: String,
    pub metrics: Metrics,
    pub test_size: f64,
}

/// Trains, stores and serves models.
#[derive(Debug)]
pub struct TrainingService {
    registry: ModelRegistry,
}

impl TrainingService {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Fit a model on `csv`, evaluate it on a held-out split and store it under its name.
    ///
    /// Retraining an existing name replaces the stored model.
    #[instrument(skip(self, csv, request), fields(model_name = %request.model_name, model_type = %request.model_type, bytes = csv.len()))]
    pub fn train(&self, csv: &[u8], request: TrainRequest) -> Result<TrainOutcome> {
        registry::validate_model_name(&request.model_name)?;
        if !(request.test_size > 0.0 && request.test_size < 1.0) {
            return Err(TrainingError::validation(format!(
                "test_size must be between 0 and 1 (exclusive), got {}",
                request.test_size
            )));
        }

        let dataset = Dataset::from_csv(csv, &request.features, &request.label)?;
        let (train, test) = dataset.split(request.test_size, SPLIT_SEED)?;

        let model = FittedModel::fit(request.model_type, &request.model_params, &train)?;
        let predictions = model.predict(&test.features);
        let metrics = if request.model_type.is_classification() {
            evaluation::classification_metrics(&test.labels, &predictions)
        } else {
            evaluation::regression_metrics(&test.labels, &predictions)
        };
        // JSON has no encoding for these, so the stored model could not be read back
        if let Some((name, value)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(TrainingError::validation(format!(
                "Training produced a non-finite {name} ({value}); rescale the feature and label values"
            )));
        }

        let record = ModelRecord {
            model_name: request.model_name,
            model_type: request.model_type,
            features: request.features,
            label: request.label,
            trained_at: Utc::now(),
            metrics,
        };
        let outcome = TrainOutcome {
            model_type: record.model_type,
            features: record.features.clone(),
            label: record.label.clone(),
            metrics: record.metrics.clone(),
            test_size: request.test_size,
        };

        info!(rows = dataset.len(), train_rows = train.len(), test_rows = test.len(), "Model trained");
        self.registry.store(StoredModel { record, model })?;
        Ok(outcome)
    }

    /// Run a stored model on one row of feature values.
    #[instrument(skip(self, input))]
    pub fn predict(&self, model_name: &str, input: &Map<String, Value>) -> Result<f64> {
        let stored = self.registry.get(model_name)?;
        let row = input_row(&stored.record.features, input)?;
        let prediction = stored
            .model
            .predict(&row)
            .first()
            .copied()
            .ok_or_else(|| TrainingError::Internal {
                message: "model produced no prediction".to_string(),
            })?;

        if !prediction.is_finite() {
            return Err(TrainingError::validation(format!(
                "Prediction is not a finite number ({prediction}); check the scale of the input values"
            )));
        }
        Ok(prediction)
    }

    pub fn list_models(&self) -> Vec<ModelRecord> {
        self.registry.list()
    }

    pub fn model_metrics(&self, model_name: &str) -> Result<ModelRecord> {
        Ok(self.registry.get(model_name)?.record.clone())
    }
}

/// Order `input` by the model's feature list into a 1 x n matrix.
fn input_row(features: &[String], input: &Map<String, Value>) -> Result<Array2<f64>> {
    let missing: Vec<String> = features.iter().filter(|f| !input.contains_key(*f)).cloned().collect();
    if !missing.is_empty() {
        return Err(TrainingError::MissingFeature { features: missing });
    }

    let values = features
        .iter()
        .map(|name| numeric_input(name, &input[name]))
        .collect::<Result<Vec<_>>>()?;

    Array2::from_shape_vec((1, values.len()), values).map_err(|e| TrainingError::Internal { message: e.to_string() })
}

fn numeric_input(name: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| TrainingError::validation(format!("Feature '{name}' must be a finite number, got {value}")))
}
