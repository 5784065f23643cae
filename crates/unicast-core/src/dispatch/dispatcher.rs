//! Turns one request envelope into one response envelope.

use super::registry::{Handler, MethodRegistry};
use crate::config::DispatchConfig;
use crate::dedup::{Completion, CompletionHandle, Registration, RequestStore};
use crate::error::RpcError;
use crate::protocol::{is_integer_id, Params, Request, Response};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

/// Transport-level outcome of a dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// The method ran and returned a result.
    Success,
    /// The id was already registered; the original call has finished.
    Duplicate,
    /// No such method.
    NotFound,
    /// The method failed, or the request could not be decoded.
    Internal,
}

impl CallStatus {
    pub fn code(self) -> u16 {
        match self {
            CallStatus::Success => 200,
            CallStatus::Duplicate => 202,
            CallStatus::NotFound => 405,
            CallStatus::Internal => 500,
        }
    }

    fn of(error: &RpcError) -> Self {
        match error.status_code() {
            202 => CallStatus::Duplicate,
            405 => CallStatus::NotFound,
            _ => CallStatus::Internal,
        }
    }
}

/// Request dispatcher backed by a dedup store.
///
/// For every non-exempt correlation id at most one call ever reaches its
/// handler while the id is cached; later deliveries wait for that call and
/// are then rejected as duplicates.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: MethodRegistry,
    store: Arc<RequestStore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: MethodRegistry, config: DispatchConfig) -> Self {
        let store = Arc::new(RequestStore::from_config(&config));
        Self::with_store(registry, store, config)
    }

    /// Use an existing store, possibly shared with other dispatchers.
    pub fn with_store(
        registry: MethodRegistry,
        store: Arc<RequestStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    /// Decode a request body and dispatch it.
    pub async fn dispatch_bytes(&self, body: &[u8]) -> (CallStatus, Response) {
        match Request::from_slice(body) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                debug!("Rejecting undecodable request: {}", e);
                (CallStatus::of(&e), Response::failure(None, e.to_string()))
            }
        }
    }

    /// Dispatch a decoded request.
    pub async fn dispatch(&self, request: Request) -> (CallStatus, Response) {
        let Request {
            method, params, id, ..
        } = request;

        self.store.try_clear().await;

        let exempt = self.config.exempt_numeric_ids && is_integer_id(&id);
        let handle = match self.store.register(&id).await {
            Registration::First(handle) => Some(handle),
            Registration::Duplicate(_) if exempt => None,
            Registration::Duplicate(waiter) => {
                debug!("Duplicate call {} for id {}, waiting for original", method, id);
                let original = waiter.wait().await;
                debug!(
                    "Original call {} for id {} finished (ok: {:?})",
                    method,
                    id,
                    original.map(|o| o.is_ok())
                );
                let error = RpcError::DuplicateCall { method };
                return (CallStatus::of(&error), Response::failure(Some(id), error.to_string()));
            }
        };

        let Some(handler) = self.registry.get(&method) else {
            let error = RpcError::MethodNotFound { method };
            debug!("{} (id {})", error, id);
            complete(handle, Err(error.to_string()));
            return (CallStatus::of(&error), Response::failure(Some(id), error.to_string()));
        };

        debug!("RPC call: {}({} params) id={}", method, params.len(), id);
        let outcome = invoke(handler, params).await;
        complete(handle, outcome.clone());

        match outcome {
            Ok(result) => (CallStatus::Success, Response::success(id, result)),
            Err(message) => {
                let error = RpcError::Internal { message };
                error!("RPC error for {} (id {}): {}", method, id, error);
                (CallStatus::of(&error), Response::failure(Some(id), error.to_string()))
            }
        }
    }
}

fn complete(handle: Option<CompletionHandle>, outcome: Completion) {
    if let Some(handle) = handle {
        handle.complete(outcome);
    }
}

/// Run a handler, converting errors and panics into diagnostic text.
async fn invoke(handler: &Handler, params: Params) -> Completion {
    let result = match handler {
        Handler::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(params))),
        // Building the future runs closure code too, so it stays inside the guard.
        Handler::Async(f) => AssertUnwindSafe(async move { f(params).await })
            .catch_unwind()
            .await,
    };

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:?}", e)),
        Err(panic) => Err(format!("Handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
