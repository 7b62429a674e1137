//! API request/response models for training and prediction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::training::{Metrics, ModelType, TrainOutcome, registry::ModelRecord};

/// Status value reported by a successful training run
pub const TRAINED_STATUS: &str = "model trained";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TrainResponse {
    /// Always `model trained`
    pub status: String,
    pub model_type: ModelType,
    pub features: Vec<String>,
    pub label: String,
    /// Metrics on the held-out split
    pub metrics: Metrics,
    pub test_size: f64,
}

impl From<TrainOutcome> for TrainResponse {
    fn from(outcome: TrainOutcome) -> Self {
        Self {
            status: TRAINED_STATUS.to_string(),
            model_type: outcome.model_type,
            features: outcome.features,
            label: outcome.label,
            metrics: outcome.metrics,
            test_size: outcome.test_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PredictionResponse {
    pub prediction: f64,
}

/// A stored model's metadata
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    pub model_name: String,
    pub model_type: ModelType,
    pub features: Vec<String>,
    pub label: String,
    pub trained_at: DateTime<Utc>,
    pub metrics: Metrics,
}

impl From<ModelRecord> for ModelInfo {
    fn from(record: ModelRecord) -> Self {
        Self {
            model_name: record.model_name,
            model_type: record.model_type,
            features: record.features,
            label: record.label,
            trained_at: record.trained_at,
            metrics: record.metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelsListResponse {
    /// Every stored model, sorted by name
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelMetricsResponse {
    pub model_name: String,
    pub model_type: ModelType,
    pub metrics: Metrics,
    pub trained_at: DateTime<Utc>,
}

impl From<ModelRecord> for ModelMetricsResponse {
    fn from(record: ModelRecord) -> Self {
        Self {
            model_name: record.model_name,
            model_type: record.model_type,
            metrics: record.metrics,
            trained_at: record.trained_at,
        }
    }
}
