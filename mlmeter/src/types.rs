//! Common type definitions.
//!
//! - [`Identity`]: the stable key shared by the ledger, the rate limiter and the credential store
//! - [`Operation`]: the metered operations a caller can pay for

use serde::{Deserialize, Serialize};
use std::fmt;

/// Verified caller identity (the username carried in the session token).
pub type Identity = String;

/// Metered operations exposed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// List the metadata of every trained model
    ListModels,
    /// Read the evaluation metrics of one model
    ModelMetrics,
    /// Fit a model from an uploaded CSV file
    Train,
    /// Run a stored model on one input row
    Predict,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListModels => "list_models",
            Operation::ModelMetrics => "model_metrics",
            Operation::Train => "train",
            Operation::Predict => "predict",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
