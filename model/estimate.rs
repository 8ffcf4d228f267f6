// model/estimate.rs

//! # Offline Model Estimation via Penalized Likelihood
//!
//! Fits the logistic classifier served by the prediction endpoints. This never runs
//! while serving; it is the `train` subcommand's engine and produces the TOML
//! artifact that the service later loads.
//!
//! 1.  **Design:** Reference rows with a complete feature set and a ground-truth
//!     label are treatment coded with the same encoder used at prediction time,
//!     so the artifact and the serving path cannot disagree on column order.
//!
//! 2.  **Standardization:** Non-intercept columns are centered and scaled before
//!     optimization and the coefficients are mapped back to the raw scale
//!     afterwards. The ridge penalty therefore acts on the standardized scale.
//!
//! 3.  **Optimization (BFGS):** The mean negative log-likelihood plus
//!     `lambda / 2 * ||beta||^2` (intercept excluded) is minimised with the
//!     `wolfe_bfgs` library, starting from the intercept-only fit.

// External Crate for Optimization
use wolfe_bfgs::{Bfgs, BfgsSolution};

// Crate-level imports
use crate::model::artifact::{
    FeatureEncoding, FitSummary, ModelError, TrainedModel, assemble_model, design_matrix,
    term_names,
};
use crate::model::data::ReferenceDataset;
use crate::schema::{FeatureSchema, Outcome};

use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;
use thiserror::Error;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("No reference rows have both a complete feature set and a ground-truth label.")]
    NoTrainingRows,

    #[error("All {rows} training rows have the outcome '{outcome}'; a classifier cannot be fit.")]
    SingleClass { rows: usize, outcome: Outcome },

    #[error("BFGS optimization failed to converge: {0}")]
    OptimizationFailed(String),

    #[error("Design matrix construction failed: {0}")]
    Model(#[from] ModelError),
}

/// Hyperparameters for the offline fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub lambda: f64,
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            lambda: 1e-4,
            max_iterations: 200,
            convergence_tolerance: 1e-5,
        }
    }
}

/// The main entry point for model training.
pub fn train_model(
    dataset: &ReferenceDataset,
    schema: &FeatureSchema,
    config: &FitConfig,
) -> Result<TrainedModel, EstimationError> {
    // 1. Keep only rows that carry every feature and a label.
    let mut rows = Vec::with_capacity(dataset.len());
    let mut labels = Vec::with_capacity(dataset.len());
    for (index, outcome) in dataset.outcomes().iter().enumerate() {
        if let (Some(row), Some(outcome)) = (dataset.row(index), outcome) {
            rows.push(row);
            labels.push(*outcome);
        }
    }
    if rows.is_empty() {
        return Err(EstimationError::NoTrainingRows);
    }
    if let Some(first) = labels.first().copied() {
        if labels.iter().all(|&o| o == first) {
            return Err(EstimationError::SingleClass {
                rows: labels.len(),
                outcome: first,
            });
        }
    }
    log::info!(
        "Starting model training. {} of {} reference rows are complete and labelled.",
        rows.len(),
        dataset.len()
    );

    // 2. Build and standardize the design matrix.
    let features = FeatureEncoding::from_schema(schema);
    let x = design_matrix(&rows, &features)?;
    let y: Array1<f64> = labels
        .iter()
        .map(|o| if o.is_positive() { 1.0 } else { 0.0 })
        .collect();
    let (x_std, scaling) = internal::standardize(&x);

    // 3. Start from the intercept-only fit.
    let prevalence = y.mean().unwrap_or(0.5);
    let mut initial_beta: Array1<f64> = Array1::zeros(x_std.ncols());
    initial_beta[0] = (prevalence / (1.0 - prevalence)).ln();

    let lambda = config.lambda;
    let n = y.len() as f64;
    let cost_and_grad = move |beta: &Array1<f64>| -> (f64, Array1<f64>) {
        internal::penalized_cost_and_gradient(&x_std, &y, beta, lambda, n)
    };

    log::info!(
        "Starting BFGS optimization with {} parameters...",
        initial_beta.len()
    );
    let BfgsSolution {
        final_point,
        final_value,
        iterations,
        ..
    } = Bfgs::new(initial_beta, cost_and_grad)
        .with_tolerance(config.convergence_tolerance)
        .with_max_iterations(config.max_iterations)
        .run()
        .map_err(|e| EstimationError::OptimizationFailed(format!("BFGS failed: {:?}", e)))?;
    log::info!(
        "BFGS optimization completed in {} iterations with final value: {:.6}",
        iterations,
        final_value
    );

    // 4. Map back to the raw scale and name the coefficients.
    let raw_beta = scaling.unstandardize(&final_point);
    let names = term_names(&features);
    let terms: BTreeMap<String, f64> = names
        .into_iter()
        .zip(raw_beta.iter().skip(1).copied())
        .collect();

    let model = assemble_model(
        schema,
        raw_beta[0],
        terms,
        FitSummary {
            lambda,
            convergence_tolerance: config.convergence_tolerance,
            max_iterations: config.max_iterations,
            num_training_rows: rows.len(),
        },
    );
    model.check_schema(schema)?;
    Ok(model)
}

/// Internal module for estimation-specific implementation details.
mod internal {
    use super::*;

    /// Column means and scales used to standardize the non-intercept columns.
    pub(super) struct Scaling {
        means: Array1<f64>,
        scales: Array1<f64>,
    }

    impl Scaling {
        /// Converts standardized-scale coefficients to the raw design scale.
        pub(super) fn unstandardize(&self, beta: &Array1<f64>) -> Array1<f64> {
            let mut raw = beta.clone();
            let mut intercept = beta[0];
            for j in 1..beta.len() {
                raw[j] = beta[j] / self.scales[j];
                intercept -= beta[j] * self.means[j] / self.scales[j];
            }
            raw[0] = intercept;
            raw
        }
    }

    /// Centers and scales every column but the intercept. Constant columns are
    /// left untouched.
    pub(super) fn standardize(x: &Array2<f64>) -> (Array2<f64>, Scaling) {
        let ncols = x.ncols();
        let mut means: Array1<f64> = Array1::zeros(ncols);
        let mut scales: Array1<f64> = Array1::ones(ncols);
        let mut out = x.clone();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate().skip(1) {
            let mean = column.mean().unwrap_or(0.0);
            let sd = column.std(0.0);
            if sd > 1e-12 {
                column.mapv_inplace(|v| (v - mean) / sd);
                means[j] = mean;
                scales[j] = sd;
            }
        }
        (out, Scaling { means, scales })
    }

    /// Numerically stable `ln(1 + exp(eta))`.
    fn log1p_exp(eta: f64) -> f64 {
        if eta > 0.0 {
            eta + (-eta).exp().ln_1p()
        } else {
            eta.exp().ln_1p()
        }
    }

    /// Mean logistic deviance plus ridge penalty, and its gradient.
    pub(super) fn penalized_cost_and_gradient(
        x: &Array2<f64>,
        y: &Array1<f64>,
        beta: &Array1<f64>,
        lambda: f64,
        n: f64,
    ) -> (f64, Array1<f64>) {
        let eta = x.dot(beta);
        let mut cost = 0.0;
        let mut residual = Array1::zeros(eta.len());
        for i in 0..eta.len() {
            cost += log1p_exp(eta[i]) - y[i] * eta[i];
            let mu = 1.0 / (1.0 + (-eta[i]).exp());
            residual[i] = mu - y[i];
        }
        cost /= n;

        let mut grad = x.t().dot(&residual) / n;
        for j in 1..beta.len() {
            cost += 0.5 * lambda * beta[j] * beta[j];
            grad[j] += lambda * beta[j];
        }

        if !cost.is_finite() {
            log::warn!("Non-finite cost encountered: {}, returning large finite value", cost);
            return (1e10, grad.mapv(|g| if g.is_finite() { g } else { 0.0 }));
        }
        (cost, grad)
    }
}
