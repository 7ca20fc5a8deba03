//! Retry policy engine shared by the facade and the lease reaper

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::retry::RetryDecision;
use crate::config::BrokerConfig;

/// Why an attempt is being counted as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The lease holder called `nack` with `retryable = true`
    Nack,

    /// The lease ran out and the reaper reclaimed the task
    LeaseExpired,
}

/// Decides whether a failed attempt is retried and after how long
///
/// Stores call this inside their per-task atomic step so the decision and
/// the resulting transition cannot interleave with another writer.
pub trait RetryDecider: Send + Sync {
    fn decide(
        &self,
        queue: &str,
        attempt: u32,
        max_attempts: u32,
        cause: FailureCause,
    ) -> RetryDecision;
}

/// Applies each queue's [`RetryPolicy`](super::RetryPolicy)
///
/// Jitter is drawn from a single [`StdRng`]; with `rng_seed` set the whole
/// sequence of decisions is reproducible.
pub struct RetryEngine {
    config: Arc<BrokerConfig>,
    rng: Mutex<StdRng>,
}

impl RetryEngine {
    /// Create an engine over the given configuration
    pub fn new(config: Arc<BrokerConfig>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// The configuration this engine reads policies from
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl RetryDecider for RetryEngine {
    fn decide(
        &self,
        queue: &str,
        attempt: u32,
        max_attempts: u32,
        cause: FailureCause,
    ) -> RetryDecision {
        let queue_config = self.config.queue(queue);
        let decision = {
            let mut rng = self.rng.lock();
            queue_config.retry.decide(attempt, max_attempts, &mut *rng)
        };

        match decision {
            // The lease timeout already served as the wait
            RetryDecision::Retry { .. }
                if cause == FailureCause::LeaseExpired && !queue_config.backoff_on_lease_expiry =>
            {
                RetryDecision::Retry {
                    delay: Duration::ZERO,
                }
            }
            other => other,
        }
    }
}
