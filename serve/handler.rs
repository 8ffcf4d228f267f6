//! # Prediction Handler
//!
//! Encodes one request, then runs the classifier on the resulting row. Validation
//! failures stop here and never reach the model.

use crate::defaults::{DefaultValues, DefaultsError};
use crate::encode::{EncodeError, RawInput, RequestEncoder};
use crate::model::artifact::{Classifier, ModelError};
use crate::schema::{FeatureRow, FeatureSchema, Outcome};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// The response body of a prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    /// The fully-populated row the model saw, defaults included.
    pub input: FeatureRow,
    pub predicted_class: Outcome,
    #[serde(rename = "prob_Diabetes")]
    pub prob_diabetes: f64,
}

/// Shared, read-only request pipeline. Cheap to clone.
#[derive(Clone)]
pub struct PredictionHandler {
    encoder: Arc<RequestEncoder>,
    defaults: Arc<DefaultValues>,
    classifier: Arc<dyn Classifier>,
}

impl PredictionHandler {
    /// Fails when `defaults` does not cover every feature of `schema`.
    pub fn new(
        schema: &FeatureSchema,
        defaults: DefaultValues,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self, DefaultsError> {
        let encoder = RequestEncoder::new(schema, &defaults)?;
        Ok(Self {
            encoder: Arc::new(encoder),
            defaults: Arc::new(defaults),
            classifier,
        })
    }

    pub fn defaults(&self) -> &DefaultValues {
        &self.defaults
    }

    pub fn encode(&self, raw: &RawInput) -> Result<FeatureRow, EncodeError> {
        self.encoder.encode(raw)
    }

    pub fn predict(&self, raw: &RawInput) -> Result<PredictionResult, PredictError> {
        let row = self.encode(raw)?;
        self.predict_row(row)
    }

    /// Scores a row that has already been encoded against this handler's schema.
    pub fn predict_row(&self, row: FeatureRow) -> Result<PredictionResult, PredictError> {
        log::debug!("Scoring row: {row:?}");
        let scored = self.classifier.predict_class_one(&row).and_then(|class| {
            self.classifier
                .predict_probability_one(&row)
                .map(|probability| (class, probability))
        });
        let (predicted_class, prob_diabetes) = match scored {
            Ok(scored) => scored,
            Err(err) => {
                if let ModelError::SchemaMismatch(detail) = &err {
                    log::error!(
                        "Serving schema and trained artifact have diverged: {detail}. Redeploy a matching model."
                    );
                }
                return Err(err.into());
            }
        };

        Ok(PredictionResult {
            input: row,
            predicted_class,
            prob_diabetes,
        })
    }
}
