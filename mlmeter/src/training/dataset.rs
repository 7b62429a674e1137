//! Tabular training data.

use csv::{ReaderBuilder, Trim};
use ndarray::{Array1, Array2, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{Result, TrainingError};

/// Numeric feature matrix (rows x features) with one label per row.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f64>,
    pub labels: Array1<f64>,
}

impl Dataset {
    /// Parse a CSV file with a header row, keeping the `features` columns (in that order) and
    /// the `label` column. Every kept cell must hold a finite number.
    pub fn from_csv(bytes: &[u8], features: &[String], label: &str) -> Result<Self> {
        if features.is_empty() {
            return Err(TrainingError::validation("At least one feature column is required"));
        }

        let mut reader = ReaderBuilder::new().has_headers(true).trim(Trim::All).from_reader(bytes);
        let headers = reader
            .headers()
            .map_err(|e| TrainingError::validation(format!("Failed to read CSV header: {e}")))?
            .clone();
        let column = |name: &str| headers.iter().position(|h| h == name);

        let missing: Vec<&str> = features
            .iter()
            .map(String::as_str)
            .filter(|f| column(*f).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(TrainingError::validation(format!(
                "Features not found in CSV: {}",
                missing.join(", ")
            )));
        }
        let label_index = column(label)
            .ok_or_else(|| TrainingError::validation(format!("Label column '{label}' not found in CSV")))?;
        let feature_indices: Vec<usize> = features.iter().filter_map(|f| column(f.as_str())).collect();

        let mut values = Vec::new();
        let mut labels = Vec::new();
        for (row, record) in reader.records().enumerate() {
            // 1-indexed, plus the header line
            let line = row + 2;
            let record = record.map_err(|e| TrainingError::validation(format!("Failed to parse CSV line {line}: {e}")))?;

            for (&index, name) in feature_indices.iter().zip(features) {
                values.push(parse_cell(record.get(index), name, line)?);
            }
            labels.push(parse_cell(record.get(label_index), label, line)?);
        }

        if labels.is_empty() {
            return Err(TrainingError::validation("CSV file contains no data rows"));
        }

        let features = Array2::from_shape_vec((labels.len(), feature_indices.len()), values)
            .map_err(|e| TrainingError::Internal { message: e.to_string() })?;
        Ok(Self {
            features,
            labels: Array1::from(labels),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shuffle rows with a seeded RNG and hold out `ceil(len * test_size)` of them.
    ///
    /// Returns `(train, test)`; both must end up non-empty.
    pub fn split(&self, test_size: f64, seed: u64) -> Result<(Dataset, Dataset)> {
        let n = self.len();
        let n_test = (n as f64 * test_size).ceil() as usize;
        if n_test == 0 || n_test >= n {
            return Err(TrainingError::validation(format!(
                "Cannot split {n} rows with test_size {test_size}: both the training and the test set need at least one row"
            )));
        }

        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        let (test_indices, train_indices) = indices.split_at(n_test);

        Ok((self.select(train_indices), self.select(test_indices)))
    }

    fn select(&self, rows: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select(Axis(0), rows),
            labels: self.labels.select(Axis(0), rows),
        }
    }
}

fn parse_cell(cell: Option<&str>, column: &str, line: usize) -> Result<f64> {
    let raw = cell.unwrap_or("");
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TrainingError::validation(format!("Non-numeric value '{raw}' in column '{column}' at line {line}")))
}
