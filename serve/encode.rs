//! # Request Encoder
//!
//! Turns the loosely typed fields of a prediction request into a complete,
//! schema-conformant `FeatureRow`. Absent fields take their precomputed default;
//! supplied fields are validated against the schema and never silently coerced.

use crate::defaults::{DefaultValues, DefaultsError};
use crate::schema::{FeatureKind, FeatureRow, FeatureSchema, FeatureSpec, FeatureValue};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Client-facing validation failures. Each names the offending feature.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("Invalid value '{value}' for feature '{feature}'. Allowed values are: {}", allowed.join(", "))]
    InvalidCategory {
        feature: String,
        value: String,
        allowed: Vec<String>,
    },
    #[error("Invalid value '{value}' for feature '{feature}'. Expected a finite number.")]
    InvalidNumber { feature: String, value: String },
}

impl EncodeError {
    pub fn feature(&self) -> &str {
        match self {
            EncodeError::InvalidCategory { feature, .. } | EncodeError::InvalidNumber { feature, .. } => {
                feature.as_str()
            }
        }
    }

    /// The permitted domain, when the feature is categorical.
    pub fn allowed(&self) -> Option<&[String]> {
        match self {
            EncodeError::InvalidCategory { allowed, .. } => Some(allowed.as_slice()),
            EncodeError::InvalidNumber { .. } => None,
        }
    }
}

/// A raw request field as received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Number(f64),
}

impl RawValue {
    fn render(&self) -> String {
        match self {
            RawValue::Text(text) => text.clone(),
            RawValue::Number(number) => number.to_string(),
        }
    }
}

/// The fields supplied with one request. A feature not present here is absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawInput {
    fields: HashMap<String, RawValue>,
}

impl RawInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field. Empty or whitespace-only text counts as absent.
    pub fn insert(&mut self, name: impl Into<String>, value: RawValue) {
        let name = name.into();
        if matches!(&value, RawValue::Text(text) if text.trim().is_empty()) {
            self.fields.remove(&name);
            return;
        }
        self.fields.insert(name, value);
    }

    pub fn with(mut self, name: impl Into<String>, value: RawValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.fields.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.keys().map(String::as_str)
    }

    /// Builds an input from query-string parameters, which are always text.
    pub fn from_query(params: HashMap<String, String>) -> Self {
        let mut input = Self::new();
        for (name, value) in params {
            input.insert(name, RawValue::Text(value));
        }
        input
    }

    /// Builds an input from a JSON object. `null` means absent; anything that is
    /// neither a string nor a number is kept as its JSON text and will fail validation.
    pub fn from_json(object: serde_json::Map<String, Value>) -> Self {
        let mut input = Self::new();
        for (name, value) in object {
            let raw = match value {
                Value::Null => continue,
                Value::String(text) => RawValue::Text(text),
                Value::Number(number) => match number.as_f64() {
                    Some(n) => RawValue::Number(n),
                    None => RawValue::Text(number.to_string()),
                },
                other => RawValue::Text(other.to_string()),
            };
            input.insert(name, raw);
        }
        input
    }
}

/// Pure mapping from a `RawInput` to a `FeatureRow`. Built once per schema and
/// defaults pair; construction fails unless every feature has a usable default.
#[derive(Debug, Clone)]
pub struct RequestEncoder {
    schema: FeatureSchema,
    defaults: Vec<FeatureValue>,
}

impl RequestEncoder {
    pub fn new(schema: &FeatureSchema, defaults: &DefaultValues) -> Result<Self, DefaultsError> {
        let defaults = schema
            .features()
            .iter()
            .map(|spec| defaults.resolve(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema: schema.clone(),
            defaults,
        })
    }

    pub fn encode(&self, raw: &RawInput) -> Result<FeatureRow, EncodeError> {
        for name in raw.names() {
            if let Err(err) = self.schema.feature(name) {
                log::debug!("Ignoring request field: {err}");
            }
        }

        let mut values = Vec::with_capacity(self.schema.len());
        for (spec, default) in self.schema.features().iter().zip(&self.defaults) {
            let value = match raw.get(spec.name) {
                Some(supplied) => validate(spec, supplied)?,
                None => *default,
            };
            values.push((spec.name, value));
        }
        Ok(FeatureRow::from_values(values))
    }
}

fn validate(spec: &FeatureSpec, supplied: &RawValue) -> Result<FeatureValue, EncodeError> {
    match spec.kind {
        FeatureKind::Categorical { labels } => {
            let text = supplied.render();
            spec.canonical_label(&text)
                .map(FeatureValue::Category)
                .ok_or_else(|| EncodeError::InvalidCategory {
                    feature: spec.name.to_string(),
                    value: text,
                    allowed: labels.iter().map(|l| l.to_string()).collect(),
                })
        }
        FeatureKind::Continuous => {
            let number = match supplied {
                RawValue::Number(number) => Some(*number),
                RawValue::Text(text) => text.trim().parse::<f64>().ok(),
            };
            number
                .filter(|n| n.is_finite())
                .map(FeatureValue::Number)
                .ok_or_else(|| EncodeError::InvalidNumber {
                    feature: spec.name.to_string(),
                    value: supplied.render(),
                })
        }
    }
}
