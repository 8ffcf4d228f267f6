//! # Confusion Evaluator
//!
//! Scores the whole reference cohort once at startup and cross-tabulates the
//! predictions against the ground truth. The resulting matrix is read-only for
//! the lifetime of the process.

use crate::model::artifact::{Classifier, ModelError};
use crate::model::data::ReferenceDataset;
use crate::schema::Outcome;
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error("Batch prediction over the reference data failed: {0}")]
    Model(#[from] ModelError),
    #[error("The classifier returned {found} predictions for {expected} rows.")]
    PredictionCount { expected: usize, found: usize },
}

/// A 2x2 table of counts indexed `[actual][predicted]` by `Outcome::index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: [[u64; 2]; 2],
}

impl ConfusionMatrix {
    pub fn record(&mut self, actual: Outcome, predicted: Outcome) {
        self.counts[actual.index()][predicted.index()] += 1;
    }

    pub fn count(&self, actual: Outcome, predicted: Outcome) -> u64 {
        self.counts[actual.index()][predicted.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    /// Fraction of rows on the diagonal, or `None` for an empty matrix.
    pub fn accuracy(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let correct: u64 = Outcome::ALL.iter().map(|&o| self.count(o, o)).sum();
        Some(correct as f64 / total as f64)
    }

    /// All four cells, actual-major.
    pub fn cells(&self) -> impl Iterator<Item = ConfusionCell> + '_ {
        Outcome::ALL.into_iter().flat_map(move |actual| {
            Outcome::ALL.into_iter().map(move |predicted| ConfusionCell {
                actual,
                predicted,
                count: self.count(actual, predicted),
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfusionCell {
    pub actual: Outcome,
    pub predicted: Outcome,
    pub count: u64,
}

impl Serialize for ConfusionMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let cells: Vec<ConfusionCell> = self.cells().collect();
        let mut state = serializer.serialize_struct("ConfusionMatrix", 2)?;
        state.serialize_field("cells", &cells)?;
        state.serialize_field("total", &self.total())?;
        state.end()
    }
}

/// The matrix plus an account of which reference rows did not contribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub matrix: ConfusionMatrix,
    pub rows_total: usize,
    pub excluded_missing_label: usize,
    pub excluded_missing_features: usize,
}

/// Batch-predicts every complete reference row and tallies `(actual, predicted)`.
///
/// Rows without a ground-truth label are dropped. Rows with a missing predictor
/// yield no prediction and are dropped as well. Both are counted.
pub fn evaluate(
    dataset: &ReferenceDataset,
    classifier: &dyn Classifier,
) -> Result<Evaluation, EvaluateError> {
    let mut rows = Vec::with_capacity(dataset.len());
    let mut actuals = Vec::with_capacity(dataset.len());
    let mut excluded_missing_label = 0;
    let mut excluded_missing_features = 0;

    for (index, outcome) in dataset.outcomes().iter().enumerate() {
        let Some(actual) = outcome else {
            excluded_missing_label += 1;
            continue;
        };
        match dataset.row(index) {
            Some(row) => {
                rows.push(row);
                actuals.push(*actual);
            }
            None => excluded_missing_features += 1,
        }
    }

    if excluded_missing_label > 0 || excluded_missing_features > 0 {
        log::warn!(
            "Excluded {} reference rows from evaluation: {} without a label, {} with missing predictors.",
            excluded_missing_label + excluded_missing_features,
            excluded_missing_label,
            excluded_missing_features
        );
    }

    let predictions = classifier.predict_class(&rows)?;
    if predictions.len() != actuals.len() {
        return Err(EvaluateError::PredictionCount {
            expected: actuals.len(),
            found: predictions.len(),
        });
    }

    let mut matrix = ConfusionMatrix::default();
    for (actual, predicted) in actuals.into_iter().zip(predictions) {
        matrix.record(actual, predicted);
    }
    log::info!(
        "Confusion matrix over {} reference rows: {:?}",
        matrix.total(),
        matrix.counts
    );

    Ok(Evaluation {
        matrix,
        rows_total: dataset.len(),
        excluded_missing_label,
        excluded_missing_features,
    })
}
