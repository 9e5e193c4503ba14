//! Caller-side fetch policies for query functions.
//!
//! The cache never retries on its own. This crate provides:
//! - `RetryPolicy` - How many times, and on which failures, to retry
//! - `TimeoutConfig` - Per-attempt and total time bounds
//! - `FetchPolicy` - Both combined, wrapped around a `QueryFn`

mod policy;
mod retry;
mod timeout;

pub use policy::*;
pub use retry::*;
pub use timeout::*;
