pub mod filter;
pub mod fingerprint;
pub mod ranking;
pub mod similarity;

pub use filter::{AllTargets, CandidateFilter, DimensionFilter};
pub use fingerprint::{DecodeError, FeatureExtractor, Fingerprint};
pub use ranking::{select_candidates, Ranked, Shortlist};
pub use similarity::{ScoringWeights, SimilarityScorer, WeightsError};
