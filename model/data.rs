//! # Reference Dataset Loading and Validation
//!
//! The reference dataset is the labelled cohort read once at startup. It feeds the
//! default resolver (modes and means of each predictor), the confusion evaluator
//! (ground truth against batch predictions) and offline model fitting.
//!
//! - Strict Schema: the predictor columns are named exactly as the features in
//!   `FeatureSchema`; only the outcome column name is configurable.
//! - Missing Values Are Data: unlike the model inputs, reference cells may be
//!   absent (empty or `NA`). They are preserved as `None` because both the
//!   imputation and the evaluation rules depend on what is missing.
//! - Labels or Codes: categorical cells may hold the canonical label (`"Yes"`) or
//!   the integer level code used by the source survey (`1`, `1.0`).

use crate::schema::{FeatureKind, FeatureRow, FeatureSchema, FeatureSpec, FeatureValue, Outcome};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Default name of the ground-truth column in the survey extract.
pub const DEFAULT_OUTCOME_COLUMN: &str = "Diabetes_binary";

/// A comprehensive error type for all reference data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. Reference data must be finite where present."
    )]
    NonFiniteValuesFound(String),
    #[error(
        "Value '{value}' in column '{column}' (row {row}) is neither a known label nor a valid level code."
    )]
    UnrecognizedValue {
        column: String,
        row: usize,
        value: String,
    },
    #[error("Column '{column}' has {found} rows but {expected} were expected.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("Expected {expected} feature columns but {found} were supplied.")]
    ColumnCount { expected: usize, found: usize },
    #[error("The reference dataset contains no data rows.")]
    EmptyDataset,
}

/// One predictor column of the reference dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub name: &'static str,
    pub values: Vec<Option<FeatureValue>>,
}

/// The labelled cohort, stored column-major in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDataset {
    columns: Vec<FeatureColumn>,
    outcomes: Vec<Option<Outcome>>,
}

impl ReferenceDataset {
    /// Assembles a dataset from in-memory columns, enforcing the schema's domains.
    ///
    /// `columns` must be given in schema order, one entry per feature, and every
    /// column must have as many cells as `outcomes`.
    pub fn new(
        schema: &FeatureSchema,
        columns: Vec<Vec<Option<FeatureValue>>>,
        outcomes: Vec<Option<Outcome>>,
    ) -> Result<Self, DataError> {
        if columns.len() != schema.len() {
            return Err(DataError::ColumnCount {
                expected: schema.len(),
                found: columns.len(),
            });
        }
        if outcomes.is_empty() {
            return Err(DataError::EmptyDataset);
        }

        let mut validated = Vec::with_capacity(columns.len());
        for (spec, values) in schema.features().iter().zip(columns) {
            if values.len() != outcomes.len() {
                return Err(DataError::LengthMismatch {
                    column: spec.name.to_string(),
                    expected: outcomes.len(),
                    found: values.len(),
                });
            }
            for (row, cell) in values.iter().enumerate() {
                if let Some(value) = cell {
                    validate_cell(spec, row, value)?;
                }
            }
            validated.push(FeatureColumn {
                name: spec.name,
                values,
            });
        }

        Ok(Self {
            columns: validated,
            outcomes,
        })
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&FeatureColumn> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn outcomes(&self) -> &[Option<Outcome>] {
        &self.outcomes
    }

    /// The complete feature row at `index`, or `None` if any predictor is missing.
    pub fn row(&self, index: usize) -> Option<FeatureRow> {
        let mut values = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = (*column.values.get(index)?)?;
            values.push((column.name, value));
        }
        Some(FeatureRow::from_values(values))
    }
}

fn validate_cell(spec: &FeatureSpec, row: usize, value: &FeatureValue) -> Result<(), DataError> {
    let valid = match (spec.kind, value) {
        (FeatureKind::Categorical { labels }, FeatureValue::Category(label)) => {
            labels.contains(label)
        }
        (FeatureKind::Continuous, FeatureValue::Number(number)) => {
            if !number.is_finite() {
                return Err(DataError::NonFiniteValuesFound(spec.name.to_string()));
            }
            true
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DataError::UnrecognizedValue {
            column: spec.name.to_string(),
            row: row + 1,
            value: value.to_string(),
        })
    }
}

/// Loads the labelled reference cohort from a delimited text file.
///
/// Files ending in `.tsv` are read tab-separated; everything else is read as CSV.
pub fn load_reference_dataset(
    path: &str,
    schema: &FeatureSchema,
    outcome_column: &str,
) -> Result<ReferenceDataset, DataError> {
    log::info!("Loading reference data from '{path}'");
    let df = internal::read_frame(path)?;

    if df.height() == 0 {
        return Err(DataError::EmptyDataset);
    }

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let require = |name: &str| {
        if columns_set.contains(name) {
            Ok(())
        } else {
            Err(DataError::ColumnNotFound(name.to_string()))
        }
    };
    for name in schema.names() {
        require(name)?;
    }
    require(outcome_column)?;

    let columns = internal::extract_feature_columns(&df, schema)?;
    let outcomes = internal::extract_text_column(&df, outcome_column, decode_outcome)?;

    let dataset = ReferenceDataset::new(schema, columns, outcomes)?;
    log::info!(
        "Loaded {} reference rows ({} with a ground-truth label).",
        dataset.len(),
        dataset.outcomes().iter().filter(|o| o.is_some()).count()
    );
    Ok(dataset)
}

/// Loads rows to be scored offline. No outcome column is needed; every outcome is
/// recorded as missing.
pub fn load_unlabelled_dataset(
    path: &str,
    schema: &FeatureSchema,
) -> Result<ReferenceDataset, DataError> {
    log::info!("Loading rows to score from '{path}'");
    let df = internal::read_frame(path)?;
    if df.height() == 0 {
        return Err(DataError::EmptyDataset);
    }
    for name in schema.names() {
        if df.column(name).is_err() {
            return Err(DataError::ColumnNotFound(name.to_string()));
        }
    }
    let columns = internal::extract_feature_columns(&df, schema)?;
    ReferenceDataset::new(schema, columns, vec![None; df.height()])
}

/// Resolves a raw categorical cell as either a canonical label or a level code.
pub fn decode_label(spec: &FeatureSpec, raw: &str) -> Option<&'static str> {
    spec.canonical_label(raw)
        .or_else(|| parse_level_code(raw).and_then(|code| spec.label_for_code(code)))
}

/// Resolves a raw outcome cell as either a label or a level code.
pub fn decode_outcome(raw: &str) -> Option<Outcome> {
    Outcome::from_label(raw).or_else(|| parse_level_code(raw).and_then(Outcome::from_code))
}

fn parse_level_code(raw: &str) -> Option<usize> {
    let value: f64 = raw.parse().ok()?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Some(value as usize)
    } else {
        None
    }
}

/// Internal module for the Polars-facing parts of loading.
mod internal {
    use super::*;

    pub(super) fn read_frame(path: &str) -> Result<DataFrame, DataError> {
        let separator = if Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tsv"))
        {
            b'\t'
        } else {
            b','
        };

        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(None)
                    .with_parse_options(
                        CsvParseOptions::default()
                            .with_separator(separator)
                            .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                    ),
            )
            .finish()?;
        Ok(df)
    }

    /// Decodes every schema feature column, in schema order.
    pub(super) fn extract_feature_columns(
        df: &DataFrame,
        schema: &FeatureSchema,
    ) -> Result<Vec<Vec<Option<FeatureValue>>>, DataError> {
        let mut columns = Vec::with_capacity(schema.len());
        for spec in schema.features() {
            let column = match spec.kind {
                FeatureKind::Categorical { .. } => {
                    extract_text_column(df, spec.name, |raw| {
                        decode_label(spec, raw).map(FeatureValue::Category)
                    })?
                }
                FeatureKind::Continuous => extract_numeric_column(df, spec.name)?
                    .into_iter()
                    .map(|cell| cell.map(FeatureValue::Number))
                    .collect(),
            };
            columns.push(column);
        }
        Ok(columns)
    }

    /// Reads a column as text and decodes each non-missing cell.
    pub(super) fn extract_text_column<T>(
        df: &DataFrame,
        column_name: &str,
        decode: impl Fn(&str) -> Option<T>,
    ) -> Result<Vec<Option<T>>, DataError> {
        let column = df.column(column_name)?;
        let as_text = column.cast(&DataType::String)?;
        let text = as_text.as_materialized_series().str()?;

        text.into_iter()
            .enumerate()
            .map(|(row, cell)| match cell {
                None => Ok(None),
                Some(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        return Ok(None);
                    }
                    decode(trimmed)
                        .map(Some)
                        .ok_or_else(|| DataError::UnrecognizedValue {
                            column: column_name.to_string(),
                            row: row + 1,
                            value: raw.to_string(),
                        })
                }
            })
            .collect()
    }

    /// Reads a numeric column, keeping missing cells as `None`.
    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<f64>>, DataError> {
        let column = df.column(column_name)?;
        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        };

        let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        // A non-strict cast turns unparseable text into nulls.
        if casted.null_count() > column.null_count() {
            return Err(wrong_type());
        }

        let values: Vec<Option<f64>> = casted
            .as_materialized_series()
            .f64()?
            .into_iter()
            .collect();
        if values.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }
}
