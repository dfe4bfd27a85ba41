//! Utility functions and helpers.

mod logging;
mod request_id;
mod shutdown;
mod time;

pub use logging::init_logging;
pub use request_id::RequestId;
pub use shutdown::ShutdownSignal;
pub use time::unix_millis;
