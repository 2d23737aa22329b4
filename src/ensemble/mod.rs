//! Ensemble scoring
//!
//! Fan-out to external scoring providers, partial-failure consensus,
//! the current-weights store, and the Bayesian recalibration loop that
//! feeds realised outcomes back into the weights.

pub mod bayesian;
pub mod provider;
pub mod scorer;
pub mod weights;

pub use bayesian::BayesianRecalibrator;
pub use provider::{EnsembleEngine, ParsedScore, ScoringProvider, ScoringRequest};
pub use scorer::{score_ensemble, ProviderScore};
pub use weights::WeightStore;
