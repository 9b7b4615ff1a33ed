//! Per-request context passed to every task producer.
//!
//! A [`Context`] is built once per logical request by the request-lifecycle
//! hook and shared by reference across every producer in that request. It
//! carries the route parameters, the URL derived from the inbound request,
//! the opaque request handle, a [`DedupeCache`], and any caller-supplied
//! extension fields.

pub mod dedupe;

pub use dedupe::DedupeCache;

use std::collections::HashMap;
use std::future::Future;

use serde_json::{json, Value};

use crate::core::errors::BatchError;

/// Opaque description of the inbound request, sufficient to derive a URL.
///
/// Transport concerns (parsing, routing) live outside this crate; the
/// lifecycle hook fills this in from whatever server framework it wraps.
#[derive(Debug, Clone, Default)]
pub struct RequestHandle {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
}

impl RequestHandle {
    pub fn new<S: Into<String>>(scheme: S, host: S, path: S) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path: path.into(),
            query: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_query<S: Into<String>>(mut self, query: S) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_header<S: Into<String>>(mut self, name: S, value: S) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The full URL this handle describes
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}://{}{}?{}", self.scheme, self.host, self.path, query),
            None => format!("{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}

/// Caller-supplied hook that derives extra context fields from the base
/// fields. Returned fields are merged over the base fields and may shadow
/// them when read through [`Context::field`] (override, not protected
/// merge).
pub type ContextExtender =
    Box<dyn FnOnce(&HashMap<String, Value>) -> HashMap<String, Value> + Send>;

/// Immutable argument bundle handed to every task producer of one request.
#[derive(Debug)]
pub struct Context {
    /// Route parameters extracted by the router in front of us
    pub params: HashMap<String, String>,
    /// URL derived from the request handle at construction time
    pub url: String,
    /// The opaque inbound request description
    pub request: RequestHandle,
    dedupe_cache: DedupeCache,
    extensions: HashMap<String, Value>,
}

impl Context {
    /// Build a context for one request.
    ///
    /// Derives the URL from `request`, constructs a fresh [`DedupeCache`],
    /// and, when `extend` is supplied, merges its returned fields onto the
    /// base fields. Extension fields shadow base fields of the same name;
    /// callers pick colliding names intentionally.
    pub fn create(
        params: HashMap<String, String>,
        request: RequestHandle,
        extend: Option<ContextExtender>,
    ) -> Self {
        let url = request.url();
        let mut base = HashMap::new();
        base.insert("url".to_string(), Value::String(url.clone()));
        base.insert("params".to_string(), json!(params));
        let extensions = match extend {
            Some(extender) => extender(&base),
            None => HashMap::new(),
        };
        Self {
            params,
            url,
            request,
            dedupe_cache: DedupeCache::new(),
            extensions,
        }
    }

    /// Collapse concurrent identical-key calls into one execution, scoped
    /// to this context. See [`DedupeCache::dedupe`].
    pub async fn dedupe<F, Fut>(&self, key: &str, producer: F) -> Result<Value, BatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.dedupe_cache.dedupe(key, producer).await
    }

    /// The per-context dedupe cache
    pub fn dedupe_cache(&self) -> &DedupeCache {
        &self.dedupe_cache
    }

    /// A single route parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// A caller-supplied extension field
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }

    /// Look up a field by name, extensions first. Extension fields shadow
    /// the base fields `"url"` and `"params"`.
    pub fn field(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.extensions.get(name) {
            return Some(value.clone());
        }
        match name {
            "url" => Some(Value::String(self.url.clone())),
            "params" => Some(json!(self.params)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_derivation() {
        let handle = RequestHandle::new("https", "example.org", "/posts/42").with_query("draft=1");
        assert_eq!(handle.url(), "https://example.org/posts/42?draft=1");

        let bare = RequestHandle::new("http", "localhost", "/");
        assert_eq!(bare.url(), "http://localhost/");
    }

    #[test]
    fn test_extensions_shadow_base_fields() {
        let extend: ContextExtender = Box::new(|base| {
            let mut fields = HashMap::new();
            fields.insert("url".to_string(), json!("overridden"));
            fields.insert(
                "echo".to_string(),
                base.get("url").cloned().unwrap_or(Value::Null),
            );
            fields
        });
        let ctx = Context::create(
            HashMap::new(),
            RequestHandle::new("http", "localhost", "/page"),
            Some(extend),
        );
        assert_eq!(ctx.field("url"), Some(json!("overridden")));
        // The typed accessor still sees the derived URL.
        assert_eq!(ctx.url, "http://localhost/page");
        assert_eq!(ctx.field("echo"), Some(json!("http://localhost/page")));
        assert_eq!(ctx.field("nope"), None);
    }
}
