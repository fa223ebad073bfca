use crate::core::similarity::{ScoringWeights, WeightsError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid scoring weights: {0}")]
    Weights(#[from] WeightsError),

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("No supported formats configured")]
    NoFormats,
}

/// Tunables for indexing and comparison runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub max_candidates: usize,
    pub weights: ScoringWeights,
    pub dimension_prefilter: bool,
    pub compute_histogram: bool,
    pub supported_formats: Vec<String>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            max_candidates: 50,
            weights: ScoringWeights::default(),
            dimension_prefilter: false,
            compute_histogram: true,
            supported_formats: ["jpg", "jpeg", "png", "webp", "bmp", "gif", "tiff", "tif"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl MatchConfig {
    /// Read a JSON config; absent fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        let config: MatchConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("workers", self.workers),
            ("batch_size", self.batch_size),
            ("max_candidates", self.max_candidates),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.supported_formats.is_empty() {
            return Err(ConfigError::NoFormats);
        }
        self.weights.validate()?;
        Ok(())
    }
}
