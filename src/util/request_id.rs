//! Call identifiers.
//!
//! A [`RequestId`] travels with a [`RequestContext`](crate::balancer::RequestContext)
//! so selection, breaker and client logs for one call can be correlated.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of a single call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// A random, globally unique id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// A cheap id unique within this process: `call-{counter:08x}`.
    pub fn sequential() -> Self {
        let n = CALL_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("call-{n:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
