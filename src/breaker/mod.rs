//! Circuit breaking for calls to unreliable dependencies.

mod circuit;
mod error;
mod registry;
mod state;

pub use circuit::{CircuitBreaker, CircuitBreakerOptions, CircuitBreakerStats};
pub use error::BreakerError;
pub use registry::CircuitBreakerRegistry;
pub use state::CircuitState;
