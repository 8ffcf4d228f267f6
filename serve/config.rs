//! Service configuration, read from a TOML file.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//! prediction_timeout_secs = 5
//!
//! [data]
//! reference_data = "data/diabetes_binary_health_indicators.csv"
//! outcome_column = "Diabetes_binary"
//!
//! [model]
//! path = "model.toml"
//!
//! [info]
//! name = "Diabetes risk"
//! github_pages_url = "https://example.github.io/glyco"
//! ```

use crate::model::data::DEFAULT_OUTCOME_COLUMN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub data: DataConfig,
    pub model: ModelPathConfig,
    pub info: ServiceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upper bound on a single model invocation. Unset means no limit.
    #[serde(default)]
    pub prediction_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            prediction_timeout_secs: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub reference_data: String,
    #[serde(default = "default_outcome_column")]
    pub outcome_column: String,
}

fn default_outcome_column() -> String {
    DEFAULT_OUTCOME_COLUMN.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPathConfig {
    pub path: String,
}

/// Static metadata served by `/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub github_pages_url: String,
}

impl ServiceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
