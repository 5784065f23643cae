//! Method registry: the callable surface of a served object.
//!
//! Methods are registered once, ahead of time, under their wire name and
//! tagged as synchronous or suspendable. Lookups never resolve names any
//! other way.

use crate::protocol::Params;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Outcome of a handler. Any error type convertible into `anyhow::Error`
/// can be propagated with `?`.
pub type HandlerResult = anyhow::Result<Value>;

type SyncFn = dyn Fn(Params) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Params) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Whether a method runs to completion inline or is awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Sync,
    Async,
}

/// A registered callable.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Handler {
    pub fn kind(&self) -> MethodKind {
        match self {
            Handler::Sync(_) => MethodKind::Sync,
            Handler::Async(_) => MethodKind::Async,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// An object whose public operations can be served.
///
/// Implementors list each operation once; the registry is built from that
/// list when a server is constructed.
pub trait RpcService: Send + Sync + 'static {
    fn register(self: Arc<Self>, builder: RegistryBuilder) -> RegistryBuilder;
}

/// Immutable name-to-handler table. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<HashMap<String, Handler>>,
}

impl MethodRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build a registry from every operation a service exposes.
    pub fn from_service<S: RpcService>(service: Arc<S>) -> Self {
        service.register(Self::builder()).build()
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.methods.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn kind(&self, method: &str) -> Option<MethodKind> {
        self.get(method).map(Handler::kind)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Collects handlers before freezing them into a [`MethodRegistry`].
///
/// Registering a name twice keeps the last handler.
#[derive(Default)]
pub struct RegistryBuilder {
    methods: HashMap<String, Handler>,
}

impl RegistryBuilder {
    /// Register a synchronous method.
    pub fn sync<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Params) -> HandlerResult + Send + Sync + 'static,
    {
        self.methods
            .insert(name.into(), Handler::Sync(Arc::new(handler)));
        self
    }

    /// Register a suspendable method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = move |params: Params| -> BoxFuture<'static, HandlerResult> {
            Box::pin(handler(params))
        };
        self.methods
            .insert(name.into(), Handler::Async(Arc::new(handler)));
        self
    }

    pub fn build(self) -> MethodRegistry {
        MethodRegistry {
            methods: Arc::new(self.methods),
        }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}
