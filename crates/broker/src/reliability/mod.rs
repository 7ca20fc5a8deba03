//! Reliability patterns for the broker
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with jitter, as a pure function
//! - [`RetryEngine`] - Per-queue policies plus a shared, seedable random source
//! - [`RetryDecider`] - The seam through which stores ask for retry decisions

mod engine;
mod retry;

pub use engine::{FailureCause, RetryDecider, RetryEngine};
pub use retry::{RetryDecision, RetryPolicy};
