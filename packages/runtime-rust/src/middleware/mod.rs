//! Tower middleware layers over the resilience components.
//!
//! - [`limit`]: Queues requests through a shared `ConcurrencyManager`
//! - [`retry`]: Replays failed requests with exponential backoff
//! - [`pipeline`]: Composes retry around the limit into one service stack

pub mod limit;
pub mod pipeline;
pub mod retry;

pub use limit::{ConcurrencyLimitLayer, ConcurrencyLimitService};
pub use pipeline::{build_resilient_service, resilient_service_from_registry, ResilientService};
pub use retry::{RetryLayer, RetryService};
