//! # Startup
//!
//! Everything the service needs is built here, once, before a listener is bound:
//! the trained artifact is loaded and checked against the serving schema, the
//! reference cohort is loaded, defaults are resolved and the confusion matrix is
//! computed. Any failure aborts startup.

use crate::config::{ServiceConfig, ServiceInfo};
use crate::defaults::{DefaultValues, DefaultsError, compute_defaults};
use crate::evaluate::{ConfusionMatrix, EvaluateError, Evaluation, evaluate};
use crate::handler::PredictionHandler;
use crate::model::artifact::{Classifier, ModelError, TrainedModel};
use crate::model::data::{DataError, ReferenceDataset, load_reference_dataset};
use crate::schema::FeatureSchema;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Could not load the trained model from '{path}': {source}")]
    ModelLoad {
        path: String,
        #[source]
        source: ModelError,
    },
    #[error("The trained model does not match the serving schema: {0}")]
    ModelSchema(#[source] ModelError),
    #[error("Could not load the reference data: {0}")]
    Data(#[from] DataError),
    #[error("Could not resolve default values: {0}")]
    Defaults(#[from] DefaultsError),
    #[error("Could not evaluate the model on the reference data: {0}")]
    Evaluate(#[from] EvaluateError),
}

/// The immutable, process-wide state shared by every request.
pub struct ServiceContext {
    handler: PredictionHandler,
    evaluation: Evaluation,
    info: ServiceInfo,
    prediction_timeout: Option<Duration>,
}

impl ServiceContext {
    /// Runs the full startup sequence described by `config`.
    pub fn initialize(config: &ServiceConfig) -> Result<Self, StartupError> {
        let schema = FeatureSchema::standard();

        log::info!("Loading trained model from '{}'", config.model.path);
        let model =
            TrainedModel::load(&config.model.path).map_err(|source| StartupError::ModelLoad {
                path: config.model.path.clone(),
                source,
            })?;
        model
            .check_schema(&schema)
            .map_err(StartupError::ModelSchema)?;

        let dataset = load_reference_dataset(
            &config.data.reference_data,
            &schema,
            &config.data.outcome_column,
        )?;
        log::info!("Loaded {} reference rows", dataset.len());

        let timeout = config.server.prediction_timeout_secs.map(Duration::from_secs);
        let context = Self::from_dataset(schema, &dataset, Arc::new(model), config.info.clone())?;
        Ok(context.with_prediction_timeout(timeout))
    }

    /// Resolves defaults and evaluates `classifier` over an in-memory cohort.
    pub fn from_dataset(
        schema: FeatureSchema,
        dataset: &ReferenceDataset,
        classifier: Arc<dyn Classifier>,
        info: ServiceInfo,
    ) -> Result<Self, StartupError> {
        let defaults = compute_defaults(&schema, dataset)?;
        let evaluation = evaluate(dataset, classifier.as_ref())?;
        let handler = PredictionHandler::new(&schema, defaults, classifier)?;
        Ok(Self::from_parts(handler, evaluation, info))
    }

    pub fn from_parts(handler: PredictionHandler, evaluation: Evaluation, info: ServiceInfo) -> Self {
        Self {
            handler,
            evaluation,
            info,
            prediction_timeout: None,
        }
    }

    pub fn with_prediction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prediction_timeout = timeout;
        self
    }

    pub fn handler(&self) -> &PredictionHandler {
        &self.handler
    }

    pub fn defaults(&self) -> &DefaultValues {
        self.handler.defaults()
    }

    pub fn confusion_matrix(&self) -> &ConfusionMatrix {
        &self.evaluation.matrix
    }

    pub fn evaluation(&self) -> &Evaluation {
        &self.evaluation
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub fn prediction_timeout(&self) -> Option<Duration> {
        self.prediction_timeout
    }
}
