//! Request-scoped registration arena.
//!
//! Each logical request owns one [`RequestScope`]: an arena holding the
//! task registry, the batch orchestrator (with its result and error
//! stores), and the shared [`Context`]. The active scope is carried by a
//! tokio task-local, so it follows every asynchronous continuation of the
//! request and two concurrent requests interleaving on the same executor
//! never observe each other's registrations. There is no module-level
//! mutable registry anywhere; the arena is the only state.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::batch::{BatchOrchestrator, FnProducer, OrchestratorConfig, TaskProducer};
use crate::context::Context;
use crate::core::errors::Result;

tokio::task_local! {
    static ACTIVE_SCOPE: Arc<RequestScope>;
}

/// One request's task-id to producer mapping.
///
/// Cloning is cheap and shares the underlying map, the same handle the
/// orchestrator samples during collection. Insertion is insert-if-absent:
/// the first writer for an id wins and later writers are ignored.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    producers: Arc<DashMap<String, Arc<dyn TaskProducer>>>,
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Check if a producer is registered under `task_id`
    pub fn contains(&self, task_id: &str) -> bool {
        self.producers.contains_key(task_id)
    }

    /// Insert if absent. Returns `true` when the producer was inserted,
    /// `false` when the id was already taken (first writer wins).
    pub fn insert(&self, task_id: &str, producer: Arc<dyn TaskProducer>) -> bool {
        match self.producers.entry(task_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(task_id, "duplicate registration ignored, first writer wins");
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(producer);
                true
            }
        }
    }

    /// Get a producer by task id
    pub fn get(&self, task_id: &str) -> Option<Arc<dyn TaskProducer>> {
        self.producers.get(task_id).map(|entry| entry.value().clone())
    }

    /// List all registered task ids
    pub fn ids(&self) -> Vec<String> {
        self.producers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every (id, producer) pair at this instant
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn TaskProducer>)> {
        self.producers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Per-request arena: registry, orchestrator, context, and a scope id used
/// in diagnostics. Created at request start, discarded at request end.
pub struct RequestScope {
    id: String,
    registry: TaskRegistry,
    context: Arc<Context>,
    orchestrator: BatchOrchestrator,
}

impl RequestScope {
    pub fn new(context: Arc<Context>) -> Self {
        let registry = TaskRegistry::new();
        let orchestrator = BatchOrchestrator::new(Arc::clone(&context), registry.clone());
        Self {
            id: cuid2::create_id(),
            registry,
            context,
            orchestrator,
        }
    }

    pub fn with_config(context: Arc<Context>, config: OrchestratorConfig) -> Result<Self> {
        let registry = TaskRegistry::new();
        let orchestrator =
            BatchOrchestrator::with_config(Arc::clone(&context), registry.clone(), config)?;
        Ok(Self {
            id: cuid2::create_id(),
            registry,
            context,
            orchestrator,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn orchestrator(&self) -> &BatchOrchestrator {
        &self.orchestrator
    }
}

/// Run `f` inside a fresh request scope built around `context`.
///
/// Every registration and `get_data` call in the dynamic extent of `f`
/// sees this scope and no other. The scope follows `f`'s own async
/// continuations; tasks detached with `tokio::spawn` leave it.
pub async fn run_scoped<F>(context: Context, f: F) -> F::Output
where
    F: Future,
{
    enter(Arc::new(RequestScope::new(Arc::new(context))), f).await
}

/// Run `f` inside an explicitly constructed scope, e.g. one carrying a
/// non-default [`OrchestratorConfig`].
pub async fn enter<F>(scope: Arc<RequestScope>, f: F) -> F::Output
where
    F: Future,
{
    debug!(scope_id = %scope.id, url = %scope.context.url, "request scope opened");
    ACTIVE_SCOPE.scope(scope, f).await
}

/// The active scope, if any
pub fn current_scope() -> Option<Arc<RequestScope>> {
    ACTIVE_SCOPE.try_with(Arc::clone).ok()
}

/// The active scope's registry, or a fresh empty one when no scope is
/// active.
pub fn current_registry() -> TaskRegistry {
    match current_scope() {
        Some(scope) => scope.registry.clone(),
        None => TaskRegistry::new(),
    }
}

/// Register `producer` under `task_id` in the active scope.
///
/// Outside any scope this is a silent no-op: registrations issued during
/// speculative module evaluation, before any request exists, are dropped.
/// Returns `true` only when the producer was actually inserted.
pub fn register(task_id: &str, producer: Arc<dyn TaskProducer>) -> bool {
    match current_scope() {
        Some(scope) => scope.registry.insert(task_id, producer),
        None => {
            trace!(task_id, "register outside any request scope, dropped");
            false
        }
    }
}

/// [`register`] for plain async closures
pub fn register_fn<F, Fut>(task_id: &str, producer: F) -> bool
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    register(task_id, Arc::new(FnProducer::new(producer)))
}

/// Resolve `task_id` through the active scope's orchestrator.
///
/// This is the whole consumer contract surfaced to rendering units.
/// Resolves `Ok(None)` when no scope is active or the id never
/// materializes.
pub async fn get_data(task_id: &str) -> Result<Option<Arc<Value>>> {
    match current_scope() {
        Some(scope) => scope.orchestrator.get_data(task_id).await,
        None => {
            warn!(task_id, "get_data outside any request scope");
            Ok(None)
        }
    }
}
