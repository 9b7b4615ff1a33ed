//! Batch discovery and execution.
//!
//! The orchestrator cannot know the full task set of a request up front:
//! producers are registered incrementally as a tree of rendering units
//! unfolds, and a child unit only registers once its parent's render
//! reaches it. Discovery therefore waits for a window of registration
//! silence before freezing the batch, then fans out every frozen producer
//! concurrently and caches each outcome for the rest of the request.

pub mod config;
pub mod orchestrator;
pub mod producer;

pub use config::OrchestratorConfig;
pub use orchestrator::{BatchOrchestrator, Phase};
pub use producer::{FnProducer, TaskProducer};

/// Define an ad-hoc [`TaskProducer`] from a free async function and
/// register it in the active request scope.
#[macro_export]
macro_rules! register_task {
    ($task_id:expr, $producer_fn:path) => {{
        struct Producer;
        #[async_trait::async_trait]
        impl $crate::batch::TaskProducer for Producer {
            async fn produce(
                &self,
                ctx: std::sync::Arc<$crate::context::Context>,
            ) -> anyhow::Result<serde_json::Value> {
                $producer_fn(ctx).await
            }
        }
        $crate::scope::register($task_id, std::sync::Arc::new(Producer))
    }};
}
