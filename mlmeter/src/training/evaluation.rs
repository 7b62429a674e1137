//! Evaluation metrics computed on the held-out split.

use ndarray::Array1;

use super::Metrics;

/// `mae`, `mse`, `rmse` and `r2`.
pub fn regression_metrics(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> Metrics {
    let n = y_true.len().max(1) as f64;
    let errors = y_true - y_pred;

    let mae = errors.mapv(f64::abs).sum() / n;
    let mse = errors.mapv(|e| e * e).sum() / n;

    let mean = y_true.mean().unwrap_or(0.0);
    let ss_res = errors.mapv(|e| e * e).sum();
    let ss_tot = y_true.mapv(|y| (y - mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        // Constant target predicted exactly
        1.0
    } else {
        0.0
    };

    Metrics::from([
        ("mae".to_string(), mae),
        ("mse".to_string(), mse),
        ("rmse".to_string(), mse.sqrt()),
        ("r2".to_string(), r2),
    ])
}

/// `accuracy`, `precision`, `recall` and `f1_score`.
///
/// With exactly two classes in `y_true` the scores are for the larger label. Otherwise they are
/// averaged over every label in `y_true` or `y_pred`, weighted by how often each occurs in
/// `y_true`. A ratio with a zero denominator counts as 0.
pub fn classification_metrics(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> Metrics {
    let n = y_true.len();
    let correct = y_true.iter().zip(y_pred.iter()).filter(|(t, p)| t == p).count();
    let accuracy = if n == 0 { 0.0 } else { correct as f64 / n as f64 };

    let true_classes = distinct(y_true.iter().copied());
    let (precision, recall, f1) = if true_classes.len() == 2 {
        let scores = ClassScores::for_label(true_classes[1], y_true, y_pred);
        (scores.precision(), scores.recall(), scores.f1())
    } else {
        weighted_scores(y_true, y_pred)
    };

    Metrics::from([
        ("accuracy".to_string(), accuracy),
        ("precision".to_string(), precision),
        ("recall".to_string(), recall),
        ("f1_score".to_string(), f1),
    ])
}

fn weighted_scores(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> (f64, f64, f64) {
    let labels = distinct(y_true.iter().chain(y_pred.iter()).copied());
    let mut totals = (0.0, 0.0, 0.0);
    let mut total_support = 0.0;

    for label in labels {
        let scores = ClassScores::for_label(label, y_true, y_pred);
        let support = scores.support() as f64;
        totals.0 += support * scores.precision();
        totals.1 += support * scores.recall();
        totals.2 += support * scores.f1();
        total_support += support;
    }

    if total_support == 0.0 {
        return (0.0, 0.0, 0.0);
    }
    (totals.0 / total_support, totals.1 / total_support, totals.2 / total_support)
}

/// One-vs-rest confusion counts for a single label.
struct ClassScores {
    true_positives: usize,
    false_positives: usize,
    false_negatives: usize,
}

impl ClassScores {
    fn for_label(label: f64, y_true: &Array1<f64>, y_pred: &Array1<f64>) -> Self {
        let mut scores = Self {
            true_positives: 0,
            false_positives: 0,
            false_negatives: 0,
        };
        for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
            match (t == label, p == label) {
                (true, true) => scores.true_positives += 1,
                (false, true) => scores.false_positives += 1,
                (true, false) => scores.false_negatives += 1,
                (false, false) => {}
            }
        }
        scores
    }

    fn support(&self) -> usize {
        self.true_positives + self.false_negatives
    }

    fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    fn recall(&self) -> f64 {
        ratio(self.true_positives, self.support())
    }

    fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn distinct(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut values: Vec<f64> = values.collect();
    values.sort_by(f64::total_cmp);
    values.dedup();
    values
}
