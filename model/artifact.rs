use crate::schema::{FeatureRow, FeatureSchema, FeatureValue, Outcome};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the public, human-readable format of the trained model
// when serialized to a TOML file.

/// How one predictor enters the linear model.
///
/// Categorical features are treatment coded: the first level is the reference and
/// every later level gets its own indicator column. Continuous features enter as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEncoding {
    pub name: String,
    /// The level order the model was fit with. Absent for continuous features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<String>>,
}

impl FeatureEncoding {
    /// The encoding implied by a schema, in schema order.
    pub fn from_schema(schema: &FeatureSchema) -> Vec<Self> {
        schema
            .features()
            .iter()
            .map(|spec| FeatureEncoding {
                name: spec.name.to_string(),
                levels: spec
                    .labels()
                    .map(|labels| labels.iter().map(|l| l.to_string()).collect()),
            })
            .collect()
    }
}

/// The complete blueprint of a trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Defines the canonical order of predictors. Prediction rows must match it exactly.
    pub features: Vec<FeatureEncoding>,
    /// Outcome labels as `[negative, positive]`.
    pub class_labels: Vec<String>,
    /// A row is assigned the positive class when its probability is at least this value.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Ridge penalty applied to every coefficient except the intercept.
    pub lambda: f64,
    pub convergence_tolerance: f64,
    pub max_iterations: usize,
    pub num_training_rows: usize,
}

fn default_threshold() -> f64 {
    0.5
}

/// The fitted coefficients, keyed by term name (`HighBPYes`, `BMI`, `SexMale`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedCoefficients {
    pub intercept: f64,
    pub terms: BTreeMap<String, f64>,
}

/// The top-level, self-contained, trained model artifact.
/// This is the structure that gets saved to and loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub config: ModelConfig,
    pub coefficients: MappedCoefficients,
}

/// Custom error type for model loading, saving, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model input does not match the trained artifact: {0}")]
    SchemaMismatch(String),
    #[error("Internal error: design matrix dimensions are inconsistent with the coefficients.")]
    InternalStackingError,
}

/// The read-only prediction contract every classifier artifact satisfies.
///
/// Batch calls are the primitive; the single-row forms are conveniences over a
/// one-element slice.
pub trait Classifier: Send + Sync {
    /// Probability of the positive class for each row, in `[0, 1]`.
    fn predict_probability(&self, rows: &[FeatureRow]) -> Result<Array1<f64>, ModelError>;

    /// Predicted outcome for each row.
    fn predict_class(&self, rows: &[FeatureRow]) -> Result<Vec<Outcome>, ModelError>;

    fn predict_probability_one(&self, row: &FeatureRow) -> Result<f64, ModelError> {
        self.predict_probability(std::slice::from_ref(row))?
            .get(0)
            .copied()
            .ok_or(ModelError::InternalStackingError)
    }

    fn predict_class_one(&self, row: &FeatureRow) -> Result<Outcome, ModelError> {
        self.predict_class(std::slice::from_ref(row))?
            .first()
            .copied()
            .ok_or(ModelError::InternalStackingError)
    }
}

impl TrainedModel {
    /// Saves the trained model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }

    /// Verifies that this artifact was fit against exactly `schema`.
    ///
    /// Compares feature names, order and level sets, the outcome labels, and the
    /// presence of a finite coefficient for every design term.
    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<(), ModelError> {
        let expected = FeatureEncoding::from_schema(schema);
        if self.config.features != expected {
            return Err(ModelError::SchemaMismatch(format!(
                "artifact features {:?} differ from serving schema {:?}",
                self.config.features, expected
            )));
        }

        let expected_labels: Vec<String> =
            Outcome::ALL.iter().map(|o| o.label().to_string()).collect();
        if self.config.class_labels != expected_labels {
            return Err(ModelError::SchemaMismatch(format!(
                "artifact class labels {:?} differ from {:?}",
                self.config.class_labels, expected_labels
            )));
        }

        if !(0.0..=1.0).contains(&self.config.threshold) {
            return Err(ModelError::SchemaMismatch(format!(
                "decision threshold {} is outside [0, 1]",
                self.config.threshold
            )));
        }

        self.flatten_coefficients().map(|_| ())
    }

    /// Linear predictor `eta = X beta` for a batch of rows.
    pub fn linear_predictor(&self, rows: &[FeatureRow]) -> Result<Array1<f64>, ModelError> {
        let x = internal::construct_design_matrix(rows, &self.config.features)?;
        let beta = self.flatten_coefficients()?;
        if x.ncols() != beta.len() {
            return Err(ModelError::InternalStackingError);
        }
        Ok(x.dot(&beta))
    }

    /// Orders the coefficients to match the design-matrix columns.
    pub fn flatten_coefficients(&self) -> Result<Array1<f64>, ModelError> {
        let names = term_names(&self.config.features);
        let mut flattened = Vec::with_capacity(names.len() + 1);
        flattened.push(self.coefficients.intercept);
        for name in &names {
            let value = self.coefficients.terms.get(name).copied().ok_or_else(|| {
                ModelError::SchemaMismatch(format!("no coefficient for term '{name}'"))
            })?;
            flattened.push(value);
        }
        if flattened.iter().any(|c| !c.is_finite()) {
            return Err(ModelError::SchemaMismatch(
                "artifact contains non-finite coefficients".to_string(),
            ));
        }
        Ok(Array1::from_vec(flattened))
    }
}

impl Classifier for TrainedModel {
    fn predict_probability(&self, rows: &[FeatureRow]) -> Result<Array1<f64>, ModelError> {
        let eta = self.linear_predictor(rows)?;
        Ok(eta.mapv(inverse_logit))
    }

    fn predict_class(&self, rows: &[FeatureRow]) -> Result<Vec<Outcome>, ModelError> {
        let threshold = self.config.threshold;
        Ok(self
            .predict_probability(rows)?
            .iter()
            .map(|&p| {
                if p >= threshold {
                    Outcome::Diabetes
                } else {
                    Outcome::NoDiabetes
                }
            })
            .collect())
    }
}

/// Clamped logistic function shared by prediction and fitting.
pub fn inverse_logit(eta: f64) -> f64 {
    // Clamp eta to prevent numerical overflow in exp()
    let eta_clamped = eta.clamp(-700.0, 700.0);
    let p = 1.0 / (1.0 + f64::exp(-eta_clamped));
    p.clamp(1e-8, 1.0 - 1e-8)
}

/// Names of the non-intercept design columns, in column order.
pub fn term_names(features: &[FeatureEncoding]) -> Vec<String> {
    let mut names = Vec::new();
    for feature in features {
        match &feature.levels {
            Some(levels) => {
                for level in levels.iter().skip(1) {
                    names.push(format!("{}{}", feature.name, level));
                }
            }
            None => names.push(feature.name.clone()),
        }
    }
    names
}

/// Builds the design matrix (intercept column first) for a batch of rows.
pub fn design_matrix(
    rows: &[FeatureRow],
    features: &[FeatureEncoding],
) -> Result<Array2<f64>, ModelError> {
    internal::construct_design_matrix(rows, features)
}

/// Internal module for prediction-specific implementation details.
mod internal {
    use super::*;

    /// Constructs the design matrix `X` for new data following a strict canonical order:
    /// intercept, then each feature's columns in `features` order.
    pub(super) fn construct_design_matrix(
        rows: &[FeatureRow],
        features: &[FeatureEncoding],
    ) -> Result<Array2<f64>, ModelError> {
        let ncols = 1 + term_names(features).len();
        let encoded: Vec<Vec<f64>> = rows
            .par_iter()
            .map(|row| encode_row(row, features))
            .collect::<Result<_, _>>()?;

        let flat: Vec<f64> = encoded.into_iter().flatten().collect();
        Array2::from_shape_vec((rows.len(), ncols), flat)
            .map_err(|_| ModelError::InternalStackingError)
    }

    fn encode_row(row: &FeatureRow, features: &[FeatureEncoding]) -> Result<Vec<f64>, ModelError> {
        if row.len() != features.len() {
            return Err(ModelError::SchemaMismatch(format!(
                "row has {} features but the model expects {}",
                row.len(),
                features.len()
            )));
        }

        let mut out = Vec::with_capacity(1 + features.len());
        out.push(1.0);
        for ((name, value), feature) in row.iter().zip(features) {
            if name != feature.name {
                return Err(ModelError::SchemaMismatch(format!(
                    "expected feature '{}' but found '{}'",
                    feature.name, name
                )));
            }
            match (&feature.levels, value) {
                (Some(levels), FeatureValue::Category(label)) => {
                    let index = levels.iter().position(|l| l.as_str() == *label).ok_or_else(|| {
                        ModelError::SchemaMismatch(format!(
                            "level '{}' of feature '{}' is unknown to the model (levels {:?})",
                            label, name, levels
                        ))
                    })?;
                    for position in 1..levels.len() {
                        out.push(if position == index { 1.0 } else { 0.0 });
                    }
                }
                (None, FeatureValue::Number(number)) => out.push(*number),
                (Some(_), FeatureValue::Number(_)) => {
                    return Err(ModelError::SchemaMismatch(format!(
                        "feature '{name}' is categorical in the model but numeric in the input"
                    )));
                }
                (None, FeatureValue::Category(_)) => {
                    return Err(ModelError::SchemaMismatch(format!(
                        "feature '{name}' is continuous in the model but categorical in the input"
                    )));
                }
            }
        }
        Ok(out)
    }
}

/// Builds an artifact for `schema` from explicit coefficients. Used by fitting and by tests.
pub fn assemble_model(
    schema: &FeatureSchema,
    intercept: f64,
    terms: BTreeMap<String, f64>,
    summary: FitSummary,
) -> TrainedModel {
    let features = FeatureEncoding::from_schema(schema);
    TrainedModel {
        config: ModelConfig {
            features,
            class_labels: Outcome::ALL.iter().map(|o| o.label().to_string()).collect(),
            threshold: default_threshold(),
            lambda: summary.lambda,
            convergence_tolerance: summary.convergence_tolerance,
            max_iterations: summary.max_iterations,
            num_training_rows: summary.num_training_rows,
        },
        coefficients: MappedCoefficients { intercept, terms },
    }
}

/// Hyperparameters and bookkeeping recorded alongside the coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSummary {
    pub lambda: f64,
    pub convergence_tolerance: f64,
    pub max_iterations: usize,
    pub num_training_rows: usize,
}

impl Default for FitSummary {
    fn default() -> Self {
        Self {
            lambda: 0.0,
            convergence_tolerance: 1e-6,
            max_iterations: 0,
            num_training_rows: 0,
        }
    }
}
