//! Compute rate limiter
//!
//! Every kernel launch takes a token from a process-local bucket; a refill
//! thread tops the bucket up at the rate the monitor publishes in the shared
//! token region.

pub mod bucket;
pub mod limiter;
pub mod refill;
pub mod sampler;

pub use bucket::TokenBucket;
pub use limiter::{ComputeLimiter, GOVERNOR_INTERNAL_ERROR};
pub use refill::Refill;
pub use sampler::LaunchSampler;
