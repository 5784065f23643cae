//! Server-side request dispatch.
//!
//! A [`Dispatcher`] resolves each request against a [`MethodRegistry`] and
//! consults the shared [`RequestStore`](crate::dedup::RequestStore) so a
//! correlation id is executed at most once.

mod dispatcher;
mod registry;

pub use dispatcher::{CallStatus, Dispatcher};
pub use registry::{Handler, HandlerResult, MethodKind, MethodRegistry, RegistryBuilder, RpcService};
