//! Edge analytics
//!
//! Walk-forward validation over stored evaluations, rolling risk
//! metrics with seeded bootstrap confidence intervals, Monte-Carlo
//! drawdown simulation, and per-provider calibration drift detection.

pub mod drift;
pub mod edge;
pub mod walk_forward;

pub use drift::{detect_drift, DriftReport};
pub use edge::{
    bootstrap_cis, edge_metrics, feature_attribution, monte_carlo_drawdown, rolling_metrics,
    BootstrapReport, EdgeMetricsReport, MonteCarloReport, RollingMetrics,
};
pub use walk_forward::{run_walk_forward, WalkForwardConfig, WalkForwardReport};
