//! Handler registry and middleware chain
//!
//! Handlers are looked up by task type. Middleware wraps every handler and
//! is composed once, when a worker is built from the registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskId};

/// Per-attempt execution context handed to handlers
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub queue: String,
    pub retry_count: u32,
    pub max_retry: u32,
    /// Point after which the attempt is cancelled
    pub deadline: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        queue: String,
        retry_count: u32,
        max_retry: u32,
        deadline: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            queue,
            retry_count,
            max_retry,
            deadline,
            cancel,
        }
    }

    /// A context that is never cancelled by a worker
    pub fn detached(task_id: TaskId, queue: impl Into<String>) -> Self {
        Self::new(task_id, queue.into(), 0, 0, None, CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled (timeout, deadline, lease loss or shutdown)
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Processes tasks of one type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, task: Task) -> TaskResult<()>;
}

/// Adapter turning an async closure into a handler
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<()>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<()>> + Send,
{
    async fn handle(&self, ctx: TaskContext, task: Task) -> TaskResult<()> {
        (self.f)(ctx, task).await
    }
}

/// Decorates a handler with cross-cutting behavior
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler>;
}

impl<F> Middleware for F
where
    F: Fn(Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> + Send + Sync,
{
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        self(next)
    }
}

/// Logs the start of each task and how long it took
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

struct Logged {
    next: Arc<dyn TaskHandler>,
}

#[async_trait]
impl TaskHandler for Logged {
    async fn handle(&self, ctx: TaskContext, task: Task) -> TaskResult<()> {
        let start = Instant::now();
        let task_id = ctx.task_id;
        let task_type = task.task_type().to_string();
        info!("Start processing {:?} ({})", task_type, task_id);

        let result = self.next.handle(ctx, task).await;
        match &result {
            Ok(()) => info!(
                "Finished processing {:?} ({}): elapsed {:?}",
                task_type,
                task_id,
                start.elapsed()
            ),
            Err(e) => warn!(
                "Failed processing {:?} ({}) after {:?}: {}",
                task_type,
                task_id,
                start.elapsed(),
                e
            ),
        }
        result
    }
}

impl Middleware for LoggingMiddleware {
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        Arc::new(Logged { next })
    }
}

/// Registry for task handlers and middleware
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type.
    ///
    /// A pattern ending in `:` also serves every type it prefixes. Registering
    /// the same pattern twice fails with `DuplicateHandler`.
    pub fn register<S, H>(&mut self, task_type: S, handler: H) -> TaskResult<()>
    where
        S: Into<String>,
        H: TaskHandler + 'static,
    {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(TaskError::validation("task type must not be empty"));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(TaskError::DuplicateHandler { task_type });
        }
        self.handlers.insert(task_type, Arc::new(handler));
        Ok(())
    }

    /// Register an async closure for a task type
    pub fn register_fn<S, F, Fut>(&mut self, task_type: S, f: F) -> TaskResult<()>
    where
        S: Into<String>,
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        self.register(task_type, handler_fn(f))
    }

    /// Add a middleware layer. The first one added is the outermost.
    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middleware.push(Arc::new(middleware));
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Wrap every handler in the middleware chain
    pub fn compose(&self) -> HandlerTable {
        let handlers = self
            .handlers
            .iter()
            .map(|(task_type, handler)| {
                let chained = self
                    .middleware
                    .iter()
                    .rev()
                    .fold(handler.clone(), |next, layer| layer.wrap(next));
                (task_type.clone(), chained)
            })
            .collect();
        HandlerTable { handlers }
    }
}

/// Composed handlers, ready for dispatch
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerTable {
    /// Exact match first, then the longest registered `prefix:` pattern
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        if let Some(handler) = self.handlers.get(task_type) {
            return Some(handler.clone());
        }

        self.handlers
            .iter()
            .filter(|(pattern, _)| pattern.ends_with(':') && task_type.starts_with(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, handler)| handler.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ctx() -> TaskContext {
        TaskContext::detached(TaskId::new_v4(), "default")
    }

    struct Tag {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
        next: Arc<dyn TaskHandler>,
    }

    #[async_trait]
    impl TaskHandler for Tag {
        async fn handle(&self, ctx: TaskContext, task: Task) -> TaskResult<()> {
            self.trace.lock().unwrap().push(format!("{}:before", self.name));
            let result = self.next.handle(ctx, task).await;
            self.trace.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    fn tag(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> impl Middleware {
        move |next: Arc<dyn TaskHandler>| -> Arc<dyn TaskHandler> {
            Arc::new(Tag {
                name,
                trace: trace.clone(),
                next,
            })
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TaskHandlerRegistry::new();
        registry
            .register_fn("email:deliver", |_, _| async { Ok(()) })
            .unwrap();
        let err = registry
            .register_fn("email:deliver", |_, _| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, TaskError::DuplicateHandler { ref task_type } if task_type == "email:deliver"));
    }

    #[tokio::test]
    async fn middleware_runs_in_registration_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskHandlerRegistry::new();
        registry.use_middleware(tag("outer", trace.clone()));
        registry.use_middleware(tag("inner", trace.clone()));

        let handler_trace = trace.clone();
        registry
            .register_fn("system:heartbeat", move |_, _| {
                let trace = handler_trace.clone();
                async move {
                    trace.lock().unwrap().push("handler".to_string());
                    Ok(())
                }
            })
            .unwrap();

        let table = registry.compose();
        let handler = table.get("system:heartbeat").unwrap();
        handler
            .handle(ctx(), Task::new("system:heartbeat", Vec::new()))
            .await
            .unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:before", "inner:before", "handler", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let called = Arc::new(Mutex::new(false));
        let mut registry = TaskHandlerRegistry::new();
        registry.use_middleware(|_next: Arc<dyn TaskHandler>| -> Arc<dyn TaskHandler> {
            Arc::new(handler_fn(|_, _| async { Err(TaskError::skip_retry("rejected by policy")) }))
        });
        let flag = called.clone();
        registry
            .register_fn("email:deliver", move |_, _| {
                let flag = flag.clone();
                async move {
                    *flag.lock().unwrap() = true;
                    Ok(())
                }
            })
            .unwrap();

        let handler = registry.compose().get("email:deliver").unwrap();
        let err = handler
            .handle(ctx(), Task::new("email:deliver", Vec::new()))
            .await
            .unwrap_err();
        assert!(err.is_skip_retry());
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn logging_middleware_passes_results_through() {
        let mut registry = TaskHandlerRegistry::new();
        registry.use_middleware(LoggingMiddleware);
        registry
            .register_fn("email:deliver", |_, _| async { Err(TaskError::task_execution("smtp down")) })
            .unwrap();

        let handler = registry.compose().get("email:deliver").unwrap();
        let err = handler
            .handle(ctx(), Task::new("email:deliver", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::TaskExecution { .. }));
    }

    #[test]
    fn prefix_patterns_match_longest_first() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register_fn("email:", |_, _| async { Ok(()) }).unwrap();
        registry.register_fn("email:digest:", |_, _| async { Ok(()) }).unwrap();
        registry.register_fn("email:deliver", |_, _| async { Ok(()) }).unwrap();

        let table = registry.compose();
        assert_eq!(table.len(), 3);
        let exact = table.get("email:deliver").unwrap();
        let digest = table.get("email:digest:weekly").unwrap();
        let fallback = table.get("email:bounce").unwrap();
        assert!(!Arc::ptr_eq(&exact, &digest));
        assert!(!Arc::ptr_eq(&digest, &fallback));
        assert!(table.get("sms:send").is_none());
    }
}
