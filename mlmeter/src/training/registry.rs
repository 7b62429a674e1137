//! File-backed model registry.
//!
//! Every model lives in `<dir>/<model_name>.json` holding its [`ModelRecord`] and fitted
//! parameters. The directory is scanned once when the registry opens; afterwards the in-memory
//! map is authoritative and every store writes through to disk.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{Metrics, ModelType, Result, TrainingError, estimators::FittedModel};

const MAX_MODEL_NAME_LENGTH: usize = 64;

/// Metadata of a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_name: String,
    pub model_type: ModelType,
    pub features: Vec<String>,
    pub label: String,
    pub trained_at: DateTime<Utc>,
    pub metrics: Metrics,
}

/// A record together with the parameters needed to predict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredModel {
    pub record: ModelRecord,
    pub model: FittedModel,
}

#[derive(Debug)]
pub struct ModelRegistry {
    dir: PathBuf,
    models: DashMap<String, Arc<StoredModel>>,
}

/// Model names double as file names, so they are restricted to `[A-Za-z0-9_-]{1,64}`.
pub fn validate_model_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_MODEL_NAME_LENGTH
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TrainingError::validation(format!(
            "Invalid model name '{name}': use 1 to {MAX_MODEL_NAME_LENGTH} letters, digits, '_' or '-'"
        )))
    }
}

impl ModelRegistry {
    /// Open (creating if needed) the registry directory and load every stored model.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let models = DashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match load_model(&path) {
                Ok(stored) => {
                    models.insert(stored.record.model_name.clone(), Arc::new(stored));
                }
                Err(e) => warn!(path = %path.display(), "Skipping unreadable model file: {}", e),
            }
        }

        info!(dir = %dir.display(), count = models.len(), "Model registry opened");
        Ok(Self { dir, models })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `stored`, replacing any model with the same name.
    ///
    /// Each call writes its own temporary file, then renames it over `<name>.json` while holding
    /// the name's map entry, so concurrent stores of one name leave the file and the map agreeing
    /// on the last writer.
    pub fn store(&self, stored: StoredModel) -> Result<()> {
        let name = stored.record.model_name.clone();
        validate_model_name(&name)?;

        let path = self.path_for(&name);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec(&stored)?)?;
        tmp.as_file().sync_all()?;

        let entry = self.models.entry(name);
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(model_name = %entry.key(), path = %path.display(), "Model stored");
        entry.insert(Arc::new(stored));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<StoredModel>> {
        self.models
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TrainingError::ModelNotFound { name: name.to_string() })
    }

    /// Every model's record, sorted by name.
    pub fn list(&self) -> Vec<ModelRecord> {
        let mut records: Vec<ModelRecord> = self.models.iter().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        records
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

fn load_model(path: &Path) -> Result<StoredModel> {
    let bytes = fs::read(path)?;
    let stored: StoredModel = serde_json::from_slice(&bytes)?;
    if stored.model.model_type() != stored.record.model_type {
        return Err(TrainingError::Internal {
            message: format!("record says {} but parameters are {}", stored.record.model_type, stored.model.model_type()),
        });
    }
    Ok(stored)
}
