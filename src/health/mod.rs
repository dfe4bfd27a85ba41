//! Active health checking for service instances.

mod checker;
mod probe;

pub use checker::{CheckSummary, HealthCheckHandle, HealthChecker};
pub use probe::{probe, ProbeError};
