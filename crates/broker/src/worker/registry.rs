//! Handler registry
//!
//! Maps a queue name to the code that processes its tasks. The broker never
//! looks at payloads; handlers decode them and report success or a
//! classified failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::broker::TaskHandle;

/// Failure reported by a task handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Whether another attempt could succeed
    pub retryable: bool,

    /// Short description stored in the task's failure history
    pub message: String,
}

impl HandlerError {
    /// A transient failure; the task is retried with backoff
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// A failure no retry can fix; the task is dead-lettered
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Handler execution result
pub type HandlerResult = Result<(), HandlerError>;

/// Task handler function type
pub type TaskHandler = Arc<dyn Fn(TaskHandle) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Queue name to handler
///
/// # Example
///
/// ```
/// use deferq_broker::worker::{HandlerError, HandlerRegistry};
///
/// let registry = HandlerRegistry::new()
///     .with_handler("emails", |task| async move {
///         if task.payload.is_empty() {
///             return Err(HandlerError::permanent("empty payload"));
///         }
///         Ok(())
///     });
///
/// assert!(registry.contains("emails"));
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, TaskHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `queue`, replacing any previous one
    pub fn register<F, Fut>(&mut self, queue: impl Into<String>, handler: F)
    where
        F: Fn(TaskHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |task| Box::pin(handler(task)));
        self.handlers.insert(queue.into(), handler);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_handler<F, Fut>(mut self, queue: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(queue, handler);
        self
    }

    /// Handler for `queue`
    pub fn get(&self, queue: &str) -> Option<TaskHandler> {
        self.handlers.get(queue).cloned()
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    /// Registered queue names, sorted
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self.handlers.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.queues())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn handle(payload: &[u8]) -> TaskHandle {
        TaskHandle {
            id: Uuid::now_v7(),
            queue: "q".to_string(),
            payload: payload.to_vec(),
            attempt: 1,
            max_attempts: 3,
            lease_token: Uuid::new_v4(),
            lease_expiry: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_registered_handler_runs() {
        let registry = HandlerRegistry::new().with_handler("q", |task| async move {
            if task.payload == b"bad" {
                Err(HandlerError::permanent("bad payload"))
            } else {
                Ok(())
            }
        });

        let handler = registry.get("q").unwrap();
        assert!(handler(handle(b"good")).await.is_ok());
        assert_eq!(
            handler(handle(b"bad")).await,
            Err(HandlerError::permanent("bad payload"))
        );
    }

    #[test]
    fn test_unknown_queue() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_queues_sorted() {
        let registry = HandlerRegistry::new()
            .with_handler("b", |_| async { Ok(()) })
            .with_handler("a", |_| async { Ok(()) });

        assert_eq!(registry.queues(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }
}
