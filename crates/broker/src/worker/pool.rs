//! Worker pool for task execution
//!
//! Runs one poll loop per registered queue, executes handlers under a
//! shared concurrency limit and keeps leases alive while handlers run.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, TaskPoller};
use super::registry::{HandlerError, HandlerRegistry, HandlerResult, TaskHandler};
use crate::broker::{Broker, BrokerError, TaskHandle};
use crate::persistence::{LeaseStatus, LeaseToken, NackOutcome, TaskId};
use crate::serde_util::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent handler executions across all queues
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Lease to request; the queue's default when unset
    #[serde(default, with = "optional_duration_millis")]
    pub lease_duration: Option<Duration>,

    /// How often a running handler's lease is extended
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            lease_duration: None,
            heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set the requested lease duration
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    /// Set heartbeat interval (at least one millisecond)
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check values the builders clamp but deserialization does not
    pub fn validate(&self) -> Result<(), WorkerPoolError> {
        if self.max_concurrency == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WorkerPoolError::InvalidConfig(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Broker error
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Nothing to poll
    #[error("no handlers registered")]
    NoHandlers,

    /// Configuration rejected by [`WorkerPoolConfig::validate`]
    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(String),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool for executing task handlers
///
/// Handler errors never reach the broker as errors: success becomes `ack`,
/// a [`HandlerError`] becomes `nack` with its retryable flag, and a panic
/// becomes a permanent `nack`.
///
/// # Example
///
/// ```ignore
/// use deferq_broker::worker::{HandlerRegistry, WorkerPool, WorkerPoolConfig};
///
/// let registry = HandlerRegistry::new()
///     .with_handler("emails", |task| async move {
///         send_email(&task.payload).await.map_err(|e| HandlerError::retryable(e.to_string()))
///     });
///
/// let pool = WorkerPool::new(broker, registry, WorkerPoolConfig::new().with_max_concurrency(10));
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    broker: Broker,
    registry: Arc<HandlerRegistry>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(broker: Broker, registry: HandlerRegistry, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            broker,
            registry: Arc::new(registry),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handles: Mutex::new(Vec::new()),
        }
    }

    /// Start polling every registered queue
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        if self.registry.is_empty() {
            return Err(WorkerPoolError::NoHandlers);
        }
        self.config.validate()?;

        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.registry.queues(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        let mut handles = self.poll_handles.lock();
        for queue in self.registry.queues() {
            handles.push(self.start_poll_loop(queue));
        }

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops polling, then waits up to `shutdown_timeout` for running
    /// handlers. Handlers still running after that keep their tasks leased
    /// until the leases expire.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        let handles: Vec<_> = self.poll_handles.lock().drain(..).collect();
        for handle in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Poll loop failed: {}", e),
                Err(_) => warn!("Poll loop did not stop before the shutdown timeout"),
            }
        }

        // Wait for active tasks to complete (with timeout)
        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of handlers currently running
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn start_poll_loop(&self, queue: String) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let registry = Arc::clone(&self.registry);
        let active_tasks = Arc::clone(&self.active_tasks);
        let batch_size = self.config.poller.batch_size;
        let heartbeat = self.config.heartbeat_interval;
        let extend_by = self
            .config
            .lease_duration
            .unwrap_or(broker.config().queue(&queue).default_lease_duration);

        let mut poller = TaskPoller::new(
            broker.clone(),
            queue,
            self.config.lease_duration,
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!(queue = poller.queue(), "Poll loop: shutdown requested");
                    break;
                }

                // Slots are reserved before leasing so no leased task
                // waits for a free slot without a heartbeat
                let Some(mut slots) = reserve_slots(&active_tasks, batch_size) else {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                };

                match poller.poll(slots.num_permits()).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let Some(permit) = slots.split(1) else {
                                error!(
                                    queue = poller.queue(),
                                    "Leased more tasks than reserved slots"
                                );
                                break;
                            };

                            let handler = registry.get(&task.queue);
                            let broker = broker.clone();
                            tokio::spawn(async move {
                                execute(broker, handler, task, heartbeat, extend_by).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!(queue = poller.queue(), "Poll error: {}", e);
                    }
                }
                // Unused slots go back to the pool here
                drop(slots);

                if poller.wait().await {
                    break;
                }
            }

            debug!(queue = poller.queue(), "Poll loop exited");
        })
    }
}

/// Take up to `max` free slots at once, or `None` when all are busy
fn reserve_slots(active_tasks: &Arc<Semaphore>, max: usize) -> Option<OwnedSemaphorePermit> {
    let wanted = active_tasks.available_permits().min(max);
    if wanted == 0 {
        return None;
    }
    let wanted = u32::try_from(wanted).unwrap_or(u32::MAX);
    Arc::clone(active_tasks).try_acquire_many_owned(wanted).ok()
}

/// Run one handler, extending its lease until it finishes, then report
async fn execute(
    broker: Broker,
    handler: Option<TaskHandler>,
    task: TaskHandle,
    heartbeat: Duration,
    extend_by: Duration,
) {
    let task_id = task.id;
    let token = task.lease_token;

    let Some(handler) = handler else {
        warn!(queue = %task.queue, %task_id, "No handler registered");
        let result = Err(HandlerError::retryable(format!(
            "no handler registered for queue {}",
            task.queue
        )));
        report(&broker, task_id, token, result).await;
        return;
    };

    let mut run = tokio::spawn(handler(task));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    let joined = loop {
        tokio::select! {
            joined = &mut run => break joined,
            _ = ticker.tick() => {
                match broker.extend_lease(task_id, token, extend_by).await {
                    Ok(LeaseStatus::Applied) => {}
                    Ok(LeaseStatus::InvalidLease) => {
                        warn!(%task_id, "Lease lost while handler is running");
                    }
                    Err(e) => {
                        warn!(%task_id, "Lease extension failed: {}", e);
                    }
                }
            }
        }
    };

    let result = match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::permanent("handler panicked")),
        Err(e) => Err(HandlerError::retryable(format!("handler aborted: {}", e))),
    };

    report(&broker, task_id, token, result).await;
}

async fn report(broker: &Broker, task_id: TaskId, token: LeaseToken, result: HandlerResult) {
    match result {
        Ok(()) => match broker.ack(task_id, token).await {
            Ok(LeaseStatus::Applied) => debug!(%task_id, "Task completed"),
            Ok(LeaseStatus::InvalidLease) => {
                debug!(%task_id, "Task completed after its lease was reclaimed")
            }
            Err(e) => error!(%task_id, "Failed to ack task: {}", e),
        },
        Err(failure) => {
            match broker
                .nack(task_id, token, failure.retryable, failure.message)
                .await
            {
                Ok(NackOutcome::DeadLettered { dlq_id }) => {
                    warn!(%task_id, %dlq_id, "Task dead-lettered")
                }
                Ok(_) => {}
                Err(e) => error!(%task_id, "Failed to nack task: {}", e),
            }
        }
    }
}

/// Serde support for `Option<Duration>` as milliseconds
mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
