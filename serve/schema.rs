//! # Feature Schema
//!
//! The fixed, ordered set of predictor features the classifier was fit against,
//! together with the outcome domain. Everything downstream (imputation, request
//! encoding, design-matrix construction) walks this schema in order, so the order
//! declared here is the canonical training order.
//!
//! The label sets must match the trained artifact exactly. Drift is caught by
//! `TrainedModel::check_schema` at startup, not here.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use thiserror::Error;

/// Labels shared by the four yes/no health indicators.
pub const YES_NO_LABELS: &[&str] = &["No", "Yes"];

/// Labels for the `Sex` indicator.
pub const SEX_LABELS: &[&str] = &["Female", "Male"];

/// Errors raised when the schema is queried for something it does not declare.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Unknown feature '{0}'. Known features are: {1}")]
    UnknownFeature(String, String),
}

/// The semantic type of a predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// A finite, ordered label set. The order is the training-time level order.
    Categorical { labels: &'static [&'static str] },
    /// A real-valued measurement.
    Continuous,
}

/// One entry of the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub kind: FeatureKind,
}

impl FeatureSpec {
    /// The canonical label set, or `None` for continuous features.
    pub fn labels(&self) -> Option<&'static [&'static str]> {
        match self.kind {
            FeatureKind::Categorical { labels } => Some(labels),
            FeatureKind::Continuous => None,
        }
    }

    /// Case-sensitive lookup of a raw string in this feature's label set.
    pub fn canonical_label(&self, raw: &str) -> Option<&'static str> {
        self.labels()
            .and_then(|labels| labels.iter().copied().find(|label| *label == raw))
    }

    /// Maps an integer storage code (the level index) to its label.
    pub fn label_for_code(&self, code: usize) -> Option<&'static str> {
        self.labels().and_then(|labels| labels.get(code).copied())
    }
}

/// The process-wide, immutable feature schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    features: Vec<FeatureSpec>,
}

impl FeatureSchema {
    /// The six-feature schema the diabetes classifier is trained on.
    pub fn standard() -> Self {
        Self {
            features: vec![
                FeatureSpec {
                    name: "HighBP",
                    kind: FeatureKind::Categorical {
                        labels: YES_NO_LABELS,
                    },
                },
                FeatureSpec {
                    name: "BMI",
                    kind: FeatureKind::Continuous,
                },
                FeatureSpec {
                    name: "Smoker",
                    kind: FeatureKind::Categorical {
                        labels: YES_NO_LABELS,
                    },
                },
                FeatureSpec {
                    name: "HeartDiseaseorAttack",
                    kind: FeatureKind::Categorical {
                        labels: YES_NO_LABELS,
                    },
                },
                FeatureSpec {
                    name: "PhysActivity",
                    kind: FeatureKind::Categorical {
                        labels: YES_NO_LABELS,
                    },
                },
                FeatureSpec {
                    name: "Sex",
                    kind: FeatureKind::Categorical { labels: SEX_LABELS },
                },
            ],
        }
    }

    /// All features, in canonical training order.
    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Returns the kind and label set of `name`.
    pub fn feature(&self, name: &str) -> Result<&FeatureSpec, SchemaError> {
        self.features
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| self.unknown(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.features.iter().map(|spec| spec.name)
    }

    fn unknown(&self, name: &str) -> SchemaError {
        SchemaError::UnknownFeature(name.to_string(), self.names().collect::<Vec<_>>().join(", "))
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self::standard()
    }
}

/// The binary outcome the classifier predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    NoDiabetes,
    Diabetes,
}

impl Outcome {
    /// Both outcomes in level order. The second entry is the positive class.
    pub const ALL: [Outcome; 2] = [Outcome::NoDiabetes, Outcome::Diabetes];

    pub fn label(self) -> &'static str {
        match self {
            Outcome::NoDiabetes => "NoDiabetes",
            Outcome::Diabetes => "Diabetes",
        }
    }

    /// Level index, used both as the storage code and as the confusion-matrix axis.
    pub fn index(self) -> usize {
        match self {
            Outcome::NoDiabetes => 0,
            Outcome::Diabetes => 1,
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|outcome| outcome.label() == raw)
    }

    pub fn from_code(code: usize) -> Option<Self> {
        Self::ALL.get(code).copied()
    }

    pub fn is_positive(self) -> bool {
        self == Outcome::Diabetes
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// A concrete, validated value for one feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue {
    /// Always one of the owning feature's canonical labels.
    Category(&'static str),
    /// Always finite.
    Number(f64),
}

impl FeatureValue {
    pub fn as_category(&self) -> Option<&'static str> {
        match self {
            FeatureValue::Category(label) => Some(label),
            FeatureValue::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(value) => Some(*value),
            FeatureValue::Category(_) => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Category(label) => f.write_str(label),
            FeatureValue::Number(value) => write!(f, "{value}"),
        }
    }
}

impl Serialize for FeatureValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FeatureValue::Category(label) => serializer.serialize_str(label),
            FeatureValue::Number(value) => serializer.serialize_f64(*value),
        }
    }
}

/// One fully-populated model input, ordered as the schema.
///
/// Rows are only produced by the request encoder, the default resolver and the
/// reference dataset, each of which validates values against the schema first.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    values: Vec<(&'static str, FeatureValue)>,
}

impl FeatureRow {
    pub(crate) fn from_values(values: Vec<(&'static str, FeatureValue)>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values
            .iter()
            .find(|(feature, _)| *feature == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FeatureValue)> + '_ {
        self.values.iter().map(|(name, value)| (*name, value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for FeatureRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
