//! Demo service served by `unicast-node serve`.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use unicast_core::{Params, RegistryBuilder, RpcService};

/// A counter plus a few methods for checking a deployment end to end.
#[derive(Debug, Default)]
pub struct DemoService {
    count: AtomicU64,
}

impl DemoService {
    async fn echo(&self, params: Params) -> anyhow::Result<Value> {
        params.arg(0, "msg").map_err(Into::into)
    }

    async fn add(&self) -> anyhow::Result<Value> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    }

    async fn get_count(&self) -> anyhow::Result<Value> {
        Ok(self.count.load(Ordering::SeqCst).into())
    }

    async fn error(&self) -> anyhow::Result<Value> {
        anyhow::bail!("Internal Error")
    }

    fn func(&self, params: Params) -> anyhow::Result<Value> {
        params.arg(0, "msg").map_err(Into::into)
    }
}

impl RpcService for DemoService {
    fn register(self: Arc<Self>, builder: RegistryBuilder) -> RegistryBuilder {
        let echo = self.clone();
        let add = self.clone();
        let get_count = self.clone();
        let error = self.clone();
        builder
            .method("echo", move |params| {
                let service = echo.clone();
                async move { service.echo(params).await }
            })
            .method("add", move |_| {
                let service = add.clone();
                async move { service.add().await }
            })
            .method("get_count", move |_| {
                let service = get_count.clone();
                async move { service.get_count().await }
            })
            .method("error", move |_| {
                let service = error.clone();
                async move { service.error().await }
            })
            .sync("func", move |params| self.func(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use unicast_core::{CallStatus, DispatchConfig, Dispatcher, MethodKind, MethodRegistry, Request};

    fn dispatcher() -> Dispatcher {
        let registry = MethodRegistry::from_service(Arc::new(DemoService::default()));
        Dispatcher::new(registry, DispatchConfig::default())
    }

    #[test]
    fn test_registered_methods() {
        let registry = MethodRegistry::from_service(Arc::new(DemoService::default()));
        assert_eq!(
            registry.names(),
            vec!["add", "echo", "error", "func", "get_count"]
        );
        assert_eq!(registry.kind("func"), Some(MethodKind::Sync));
        assert_eq!(registry.kind("echo"), Some(MethodKind::Async));
    }

    #[tokio::test]
    async fn test_add_counts_once_per_id() {
        let dispatcher = dispatcher();
        let add = Request::with_id("add", Params::none(), "a1");

        assert_eq!(dispatcher.dispatch(add.clone()).await.0, CallStatus::Success);
        assert_eq!(dispatcher.dispatch(add).await.0, CallStatus::Duplicate);

        let (_, response) = dispatcher
            .dispatch(Request::new("get_count", Params::none()))
            .await;
        assert_eq!(response.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_echo_and_func() {
        let dispatcher = dispatcher();

        let (_, response) = dispatcher
            .dispatch(Request::new("echo", Params::named([("msg", "hello")])))
            .await;
        assert_eq!(response.result, Some(json!("hello")));

        let (_, response) = dispatcher
            .dispatch(Request::new("func", Params::positional(["hi"])))
            .await;
        assert_eq!(response.result, Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_error_method() {
        let (status, response) = dispatcher()
            .dispatch(Request::new("error", Params::none()))
            .await;
        assert_eq!(status, CallStatus::Internal);
        assert!(response.error.unwrap().contains("Internal Error"));
    }
}
