//! # Default Value Resolver
//!
//! Computed once from the reference dataset before the service accepts traffic:
//! the most frequent label of every categorical feature and the mean of every
//! continuous one. Requests that omit a feature receive these values.

use crate::model::data::{FeatureColumn, ReferenceDataset};
use crate::schema::{FeatureKind, FeatureRow, FeatureSchema, FeatureSpec, FeatureValue};
use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefaultsError {
    #[error("Feature '{0}' has no non-missing observations; no default value exists.")]
    EmptyColumn(String),
    #[error("No usable default value for feature '{0}'.")]
    Unresolved(String),
}

/// One default per schema feature, in schema order. Immutable once computed.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultValues {
    values: Vec<(&'static str, FeatureValue)>,
}

impl DefaultValues {
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values
            .iter()
            .find(|(feature, _)| *feature == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FeatureValue)> + '_ {
        self.values.iter().map(|(name, value)| (*name, value))
    }

    /// The default for `spec`, provided it exists and fits the feature's kind.
    pub fn resolve(&self, spec: &FeatureSpec) -> Result<FeatureValue, DefaultsError> {
        let fits = |value: &FeatureValue| match (spec.kind, value) {
            (FeatureKind::Categorical { labels }, FeatureValue::Category(label)) => labels.contains(label),
            (FeatureKind::Continuous, FeatureValue::Number(number)) => number.is_finite(),
            _ => false,
        };
        self.get(spec.name)
            .copied()
            .filter(fits)
            .ok_or_else(|| DefaultsError::Unresolved(spec.name.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn without(mut self, name: &str) -> Self {
        self.values.retain(|(feature, _)| *feature != name);
        self
    }

    /// The row a request with every feature omitted encodes to.
    pub fn as_row(&self) -> FeatureRow {
        FeatureRow::from_values(self.values.clone())
    }
}

impl Serialize for DefaultValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Computes the mode of each categorical feature and the mean of each continuous one.
///
/// Mode ties are broken towards the lexicographically smallest label so the result
/// never depends on iteration order.
pub fn compute_defaults(
    schema: &FeatureSchema,
    dataset: &ReferenceDataset,
) -> Result<DefaultValues, DefaultsError> {
    let mut values = Vec::with_capacity(schema.len());
    for spec in schema.features() {
        let column = dataset
            .column(spec.name)
            .ok_or_else(|| DefaultsError::EmptyColumn(spec.name.to_string()))?;
        let value = match spec.kind {
            FeatureKind::Categorical { labels } => mode(column, labels)?,
            FeatureKind::Continuous => mean(column)?,
        };
        log::info!("Default for '{}': {}", spec.name, value);
        values.push((spec.name, value));
    }
    Ok(DefaultValues { values })
}

fn mode(column: &FeatureColumn, labels: &'static [&'static str]) -> Result<FeatureValue, DefaultsError> {
    let mut counts = vec![0usize; labels.len()];
    for label in column.values.iter().flatten().filter_map(FeatureValue::as_category) {
        if let Some(index) = labels.iter().position(|l| *l == label) {
            counts[index] += 1;
        }
    }

    let mut best: Option<(&'static str, usize)> = None;
    for (label, &count) in labels.iter().zip(&counts) {
        if count == 0 {
            continue;
        }
        best = match best {
            Some((best_label, best_count))
                if best_count > count || (best_count == count && best_label < *label) =>
            {
                Some((best_label, best_count))
            }
            _ => Some((*label, count)),
        };
    }

    best.map(|(label, _)| FeatureValue::Category(label))
        .ok_or_else(|| DefaultsError::EmptyColumn(column.name.to_string()))
}

fn mean(column: &FeatureColumn) -> Result<FeatureValue, DefaultsError> {
    let (sum, count) = column
        .values
        .iter()
        .flatten()
        .filter_map(FeatureValue::as_number)
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return Err(DefaultsError::EmptyColumn(column.name.to_string()));
    }
    Ok(FeatureValue::Number(sum / count as f64))
}
