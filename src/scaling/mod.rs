//! Threshold-based scaling recommendations.
//!
//! Callers push metric samples; rules are evaluated synchronously against
//! each sample. Nothing here adds or removes instances.

mod evaluator;
mod metrics;

pub use evaluator::{ScalingEvaluator, ScalingEvent, METRICS_HISTORY};
pub use metrics::ScalingMetrics;
