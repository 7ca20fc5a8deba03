//! Broker and per-queue configuration
//!
//! Configuration is plain data: it can be built in code with the `with_*`
//! builders or loaded from TOML.
//!
//! ```toml
//! dedupe_scope = "queue"
//! requeue_history = "clear"
//!
//! [defaults]
//! default_lease_duration_ms = 30000
//! max_attempts = 5
//! base_delay_ms = 1000
//! backoff_multiplier = 2.0
//! max_delay_ms = 60000
//! jitter_fraction = 0.1
//! reaper_interval_ms = 5000
//!
//! [queues.emails]
//! max_attempts = 3
//! base_delay_ms = 1000
//! backoff_multiplier = 5.0
//! ```
//!
//! A `[queues.<name>]` table is a complete queue configuration: fields it
//! omits take the built-in defaults, not the values from `[defaults]`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;
use crate::serde_util::duration_millis;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field holds a value outside its legal range
    #[error("invalid configuration for queue '{queue}': {reason}")]
    Invalid { queue: String, reason: String },

    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Whether dedupe keys are unique per queue or across all queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeScope {
    /// The same key may be active once in every queue
    #[default]
    Queue,

    /// The same key may be active once in the whole broker
    Global,
}

/// What happens to a dead letter's failure history when it is requeued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueHistory {
    /// Start over with an empty history
    #[default]
    Clear,

    /// Keep the old failures as context; attempts still restart at zero
    Retain,
}

/// Settings for a single queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Lease length used when a worker does not ask for one
    #[serde(rename = "default_lease_duration_ms", with = "duration_millis")]
    pub default_lease_duration: Duration,

    /// Backoff and attempt ceiling
    #[serde(flatten)]
    pub retry: RetryPolicy,

    /// How often the lease reaper looks for abandoned leases
    #[serde(rename = "reaper_interval_ms", with = "duration_millis")]
    pub reaper_interval: Duration,

    /// Apply backoff to leases that expired instead of redelivering at once
    pub backoff_on_lease_expiry: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_lease_duration: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            reaper_interval: Duration::from_secs(5),
            backoff_on_lease_expiry: false,
        }
    }
}

impl QueueConfig {
    /// Create a queue configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default lease duration
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.default_lease_duration = duration;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the reaper interval
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Apply backoff after lease expiry
    pub fn with_backoff_on_lease_expiry(mut self, enabled: bool) -> Self {
        self.backoff_on_lease_expiry = enabled;
        self
    }

    fn validate(&self, queue: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            queue: queue.to_string(),
            reason,
        };

        if self.default_lease_duration.is_zero() {
            return Err(invalid("default_lease_duration must be positive".into()));
        }
        if self.reaper_interval.is_zero() {
            return Err(invalid("reaper_interval must be positive".into()));
        }
        self.retry.validate().map_err(invalid)
    }
}

/// Broker-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Configuration for queues without their own entry
    pub defaults: QueueConfig,

    /// Per-queue overrides
    pub queues: HashMap<String, QueueConfig>,

    /// Uniqueness scope of dedupe keys
    pub dedupe_scope: DedupeScope,

    /// Failure history handling on requeue
    pub requeue_history: RequeueHistory,

    /// Maximum expired leases handled per store round trip
    pub reaper_batch_size: usize,

    /// Seed for retry jitter; random when unset
    pub rng_seed: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            defaults: QueueConfig::default(),
            queues: HashMap::new(),
            dedupe_scope: DedupeScope::default(),
            requeue_history: RequeueHistory::default(),
            reaper_batch_size: 100,
            rng_seed: None,
        }
    }
}

impl BrokerConfig {
    /// Create a broker configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "Loaded broker config");
        Self::from_toml_str(&input)
    }

    /// Set the fallback queue configuration
    pub fn with_defaults(mut self, defaults: QueueConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Configure a named queue
    pub fn with_queue(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.insert(name.into(), config);
        self
    }

    /// Set the dedupe scope
    pub fn with_dedupe_scope(mut self, scope: DedupeScope) -> Self {
        self.dedupe_scope = scope;
        self
    }

    /// Set the requeue history policy
    pub fn with_requeue_history(mut self, history: RequeueHistory) -> Self {
        self.requeue_history = history;
        self
    }

    /// Set the reaper batch size
    pub fn with_reaper_batch_size(mut self, size: usize) -> Self {
        self.reaper_batch_size = size.max(1);
        self
    }

    /// Fix the jitter seed
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Configuration in effect for `queue`
    pub fn queue(&self, queue: &str) -> &QueueConfig {
        self.queues.get(queue).unwrap_or(&self.defaults)
    }

    /// The reaper cycle: the shortest interval any queue asks for
    pub fn reaper_interval(&self) -> Duration {
        self.queues
            .values()
            .map(|q| q.reaper_interval)
            .fold(self.defaults.reaper_interval, Duration::min)
    }

    /// Check every queue configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate("<defaults>")?;
        for (name, queue) in &self.queues {
            queue.validate(name)?;
        }
        if self.reaper_batch_size == 0 {
            return Err(ConfigError::Invalid {
                queue: "<broker>".to_string(),
                reason: "reaper_batch_size must be positive".to_string(),
            });
        }
        Ok(())
    }
}
