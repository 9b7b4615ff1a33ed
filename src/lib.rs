//! Lazybatch - request-scoped lazy parallel task orchestration.
//!
//! A tree of rendering units is discovered incrementally as rendering
//! proceeds, and each unit may need the result of an asynchronous task.
//! Awaiting each unit's task before rendering its children serializes all
//! the work. This crate instead collects registrations until they go
//! quiet, executes the discovered batch concurrently exactly once, and
//! serves cached per-task results (with isolated failures) to every
//! caller, all inside an arena isolated per logical request.

// Core infrastructure modules
pub mod core;

// The three layers of one request
pub mod batch; // discovery, concurrent execution, result caching
pub mod context; // immutable per-request argument bundle + dedupe
pub mod scope; // task-local arena isolating concurrent requests

// Re-exports for convenience
pub use core::errors::{BatchError, Result};
pub use batch::{BatchOrchestrator, FnProducer, OrchestratorConfig, Phase, TaskProducer};
pub use context::{Context, ContextExtender, DedupeCache, RequestHandle};
pub use scope::{
    current_registry, current_scope, get_data, register, register_fn, run_scoped, RequestScope,
    TaskRegistry,
};
