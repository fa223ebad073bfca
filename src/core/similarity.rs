use crate::core::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HASH_BITS: f64 = 64.0;
const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("Weights must be non-negative (phash {phash}, histogram {histogram})")]
    Negative { phash: f64, histogram: f64 },

    #[error("Weights must sum to 1.0, got {sum}")]
    BadSum { sum: f64 },
}

/// How much each signal contributes to the final score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub phash_weight: f64,
    pub histogram_weight: f64,
}

impl ScoringWeights {
    pub fn new(phash_weight: f64, histogram_weight: f64) -> Result<Self, WeightsError> {
        let weights = Self {
            phash_weight,
            histogram_weight,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), WeightsError> {
        if self.phash_weight < 0.0 || self.histogram_weight < 0.0 {
            return Err(WeightsError::Negative {
                phash: self.phash_weight,
                histogram: self.histogram_weight,
            });
        }

        let sum = self.phash_weight + self.histogram_weight;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(WeightsError::BadSum { sum });
        }
        Ok(())
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            phash_weight: 1.0,
            histogram_weight: 0.0,
        }
    }
}

/// Percentage of equal bits between two 64-bit hashes.
pub fn hamming_similarity(a: u64, b: u64) -> f64 {
    let distance = f64::from((a ^ b).count_ones());
    (1.0 - distance / HASH_BITS) * 100.0
}

/// Bhattacharyya coefficient of two histograms as a percentage.
/// Histograms of different lengths are not comparable and score 0.
pub fn histogram_similarity(h1: &[f64], h2: &[f64]) -> f64 {
    if h1.len() != h2.len() {
        return 0.0;
    }

    let coefficient: f64 = h1
        .iter()
        .zip(h2)
        .map(|(a, b)| (a * b).sqrt())
        .sum();
    coefficient * 100.0
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityScorer {
    weights: ScoringWeights,
}

impl SimilarityScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> ScoringWeights {
        self.weights
    }

    /// Weighted similarity in [0, 100].
    ///
    /// If either side has no histogram the hash similarity stands alone.
    pub fn score(&self, a: &Fingerprint, b: &Fingerprint) -> f64 {
        let hash = hamming_similarity(a.perceptual_hash, b.perceptual_hash);

        let combined = match (&a.color_histogram, &b.color_histogram) {
            (Some(h1), Some(h2)) if self.weights.histogram_weight > 0.0 => {
                hash * self.weights.phash_weight
                    + histogram_similarity(h1, h2) * self.weights.histogram_weight
            }
            _ => hash,
        };

        combined.clamp(0.0, 100.0)
    }
}
