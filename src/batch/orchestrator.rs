use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::yield_now;
use tracing::{debug, trace, warn};

use crate::batch::config::OrchestratorConfig;
use crate::batch::producer::TaskProducer;
use crate::context::Context;
use crate::core::errors::{BatchError, Result};
use crate::scope::TaskRegistry;

/// Lifecycle of one collection cycle. Late arrivals after `Settled` start
/// a fresh cycle back at `Collecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Collecting,
    Stable,
    Executing,
    Settled,
}

type CycleFuture = Shared<BoxFuture<'static, ()>>;

struct CycleState {
    phase: Phase,
    inflight: Option<CycleFuture>,
}

struct Inner {
    context: Arc<Context>,
    registry: TaskRegistry,
    config: OrchestratorConfig,
    results: DashMap<String, Arc<Value>>,
    errors: DashMap<String, BatchError>,
    requested: DashSet<String>,
    state: Mutex<CycleState>,
}

/// Request-scoped orchestrator that discovers the task set for one request
/// by waiting for registration silence, executes the discovered producers
/// concurrently exactly once, and serves cached, isolated-failure results
/// back to every caller.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl BatchOrchestrator {
    pub fn new(context: Arc<Context>, registry: TaskRegistry) -> Self {
        Self::build(context, registry, OrchestratorConfig::default())
    }

    pub fn with_config(
        context: Arc<Context>,
        registry: TaskRegistry,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(context, registry, config))
    }

    fn build(context: Arc<Context>, registry: TaskRegistry, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                registry,
                config,
                results: DashMap::new(),
                errors: DashMap::new(),
                requested: DashSet::new(),
                state: Mutex::new(CycleState {
                    phase: Phase::Idle,
                    inflight: None,
                }),
            }),
        }
    }

    /// Current phase of the active (or last) cycle
    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }

    /// Whether `task_id` has a permanent entry in the result or error store
    pub fn is_settled(&self, task_id: &str) -> bool {
        self.inner.results.contains_key(task_id) || self.inner.errors.contains_key(task_id)
    }

    /// Every task id that has been asked for so far, in no particular order
    pub fn requested_ids(&self) -> Vec<String> {
        self.inner
            .requested
            .iter()
            .map(|id| id.key().clone())
            .collect()
    }

    /// Resolve the result for `task_id`, driving batch discovery as needed.
    ///
    /// Joins the in-progress cycle when one exists; otherwise starts a new
    /// collection cycle. When the last cycle settled without this id ever
    /// being registered, resolves `Ok(None)` instead of erroring. A cached
    /// failure for this id is returned to this caller only; unrelated ids
    /// are unaffected.
    pub async fn get_data(&self, task_id: &str) -> Result<Option<Arc<Value>>> {
        self.inner.requested.insert(task_id.to_string());
        trace!(task_id, "task result requested");
        loop {
            if let Some(value) = self.inner.results.get(task_id) {
                return Ok(Some(Arc::clone(value.value())));
            }
            if let Some(err) = self.inner.errors.get(task_id) {
                return Err(err.value().clone());
            }

            let cycle = {
                let mut state = self.inner.state.lock().await;
                let joinable = match state.phase {
                    Phase::Collecting | Phase::Stable | Phase::Executing => {
                        state.inflight.clone()
                    }
                    Phase::Idle => None,
                    Phase::Settled => {
                        if !self.inner.registry.contains(task_id) {
                            // Never registered and nothing left to discover.
                            return Ok(None);
                        }
                        // Registered after the prior batch froze: collect
                        // again, restricted to unresolved ids.
                        debug!(task_id, "late registration, starting a new cycle");
                        None
                    }
                };
                match joinable {
                    Some(fut) => fut,
                    None => {
                        let fut = run_cycle(Arc::clone(&self.inner)).boxed().shared();
                        state.phase = Phase::Collecting;
                        state.inflight = Some(fut.clone());
                        // Driver task: producers run to completion and their
                        // results stay cached even if every caller awaiting
                        // them is dropped.
                        tokio::spawn(fut.clone());
                        fut
                    }
                }
            };
            cycle.await;
        }
    }
}

/// One full collection cycle: wait for registration silence, freeze the
/// batch, fan out every unresolved producer, settle the stores.
async fn run_cycle(inner: Arc<Inner>) {
    set_phase(&inner, Phase::Collecting).await;

    let mut last_seen = inner.registry.len();
    let mut quiet_ticks = 0usize;
    let mut total_ticks = 0u64;
    debug!(registered = last_seen, "collection cycle started");
    loop {
        yield_now().await;
        total_ticks += 1;
        let len = inner.registry.len();
        if len == last_seen {
            quiet_ticks += 1;
        } else {
            trace!(registered = len, "registry grew, stability counter reset");
            quiet_ticks = 0;
            last_seen = len;
        }
        if quiet_ticks >= inner.config.stable_ticks {
            break;
        }
        if let Some(max) = inner.config.max_collect_ticks {
            if total_ticks >= max {
                warn!(
                    ticks = total_ticks,
                    "registrations never converged, freezing the current set"
                );
                break;
            }
        }
    }

    set_phase(&inner, Phase::Stable).await;
    let pending: Vec<(String, Arc<dyn TaskProducer>)> = inner
        .registry
        .snapshot()
        .into_iter()
        .filter(|(id, _)| !inner.results.contains_key(id) && !inner.errors.contains_key(id))
        .collect();
    debug!(batch = pending.len(), "batch frozen");

    set_phase(&inner, Phase::Executing).await;
    let mut executing = FuturesUnordered::new();
    for (task_id, producer) in pending {
        let ctx = Arc::clone(&inner.context);
        executing.push(async move {
            let outcome = AssertUnwindSafe(producer.produce(ctx)).catch_unwind().await;
            (task_id, outcome)
        });
    }
    while let Some((task_id, outcome)) = executing.next().await {
        match outcome {
            Ok(Ok(value)) => {
                trace!(task_id = %task_id, "producer resolved");
                inner.results.insert(task_id, Arc::new(value));
            }
            Ok(Err(err)) => {
                warn!(task_id = %task_id, error = %err, "producer failed");
                let stored = BatchError::producer_failed(task_id.as_str(), &err);
                inner.errors.insert(task_id, stored);
            }
            Err(payload) => {
                let message = panic_message(payload);
                warn!(task_id = %task_id, message = %message, "producer panicked");
                let stored = BatchError::producer_panicked(task_id.as_str(), message);
                inner.errors.insert(task_id, stored);
            }
        }
    }

    {
        let mut state = inner.state.lock().await;
        state.phase = Phase::Settled;
        state.inflight = None;
    }
    debug!(
        results = inner.results.len(),
        errors = inner.errors.len(),
        requested = inner.requested.len(),
        "batch settled"
    );
}

async fn set_phase(inner: &Inner, phase: Phase) {
    let mut state = inner.state.lock().await;
    trace!(?phase, "phase transition");
    state.phase = phase;
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "producer panicked".to_string()
    }
}
