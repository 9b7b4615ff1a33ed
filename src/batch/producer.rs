use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;

/// An asynchronous unit of work registered under a task id.
///
/// Producers are owned by the rendering unit that registers them; the
/// registry only holds a shared reference. A producer is invoked at most
/// once per request, no matter how many callers ask for its result.
#[async_trait]
pub trait TaskProducer: Send + Sync {
    async fn produce(&self, ctx: Arc<Context>) -> Result<Value>;
}

/// Adapter lifting a plain async closure into a [`TaskProducer`].
pub struct FnProducer<F> {
    f: F,
}

impl<F> FnProducer<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskProducer for FnProducer<F>
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn produce(&self, ctx: Arc<Context>) -> Result<Value> {
        (self.f)(ctx).await
    }
}
