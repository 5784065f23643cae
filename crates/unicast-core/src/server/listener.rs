//! One bound listen socket and the HTTP routes it serves.

use crate::cancel::CancellationToken;
use crate::config::{InterfaceAddr, RpcDefaults};
use crate::dispatch::Dispatcher;
use crate::error::{Result, RpcError};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// A live listener, keyed by the address it actually bound.
#[derive(Debug)]
pub(crate) struct Listener {
    pub(crate) key: String,
    pub(crate) local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn new(key: String, local_addr: SocketAddr, task: JoinHandle<()>) -> Self {
        Self {
            key,
            local_addr,
            task,
        }
    }

    /// Wait until the serving task has released the socket.
    pub(crate) async fn closed(self) {
        if let Err(e) = self.task.await {
            warn!("Listener {} ended abnormally: {}", self.key, e);
        }
        info!("Listener {} closed", self.key);
    }
}

/// Bind a listen socket for one interface.
pub(crate) async fn bind(addr: &InterfaceAddr) -> Result<TcpListener> {
    TcpListener::bind((addr.host.as_str(), addr.port))
        .await
        .map_err(|source| RpcError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Routes served on every listener.
pub(crate) fn router(dispatcher: Arc<Dispatcher>, path: &str) -> Router {
    let mut router = Router::new().route(path, post(handle_rpc));
    if path != RpcDefaults::HEALTH_PATH {
        router = router.route(RpcDefaults::HEALTH_PATH, get(handle_health));
    }
    router
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_rpc(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> impl IntoResponse {
    let (status, response) = dispatcher.dispatch_bytes(&body).await;
    let code = StatusCode::from_u16(status.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(response))
}

/// Serve `router` on `listener` until `cancel` fires, then drain open
/// connections.
pub(crate) async fn serve(
    listener: TcpListener,
    router: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) {
    match tls {
        Some(acceptor) => serve_tls(listener, router, acceptor, cancel).await,
        None => {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("Server error: {}", e);
            }
        }
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    acceptor: TlsAcceptor,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        while connections.try_join_next().is_some() {}

        let acceptor = acceptor.clone();
        let router = router.clone();
        let cancel = cancel.clone();
        connections.spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };

            let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                router.clone().call(request)
            });
            let connection = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(connection);

            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        debug!("Connection from {} ended: {}", peer, e);
                    }
                }
                _ = cancel.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    if let Err(e) = connection.await {
                        debug!("Connection from {} ended during shutdown: {}", peer, e);
                    }
                }
            }
        });
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::MethodRegistry;
    use serde_json::Value;

    fn test_router() -> Router {
        let registry = MethodRegistry::builder()
            .sync("echo", |params| Ok(params.arg::<Value>(0, "msg")?))
            .build();
        router(
            Arc::new(Dispatcher::new(registry, DispatchConfig::default())),
            RpcDefaults::RPC_PATH,
        )
    }

    async fn spawn_plain() -> (SocketAddr, CancellationToken, JoinHandle<()>) {
        let listener = bind(&InterfaceAddr::new("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(listener, test_router(), None, cancel.clone()));
        (addr, cancel, task)
    }

    #[tokio::test]
    async fn test_routes_and_status_codes() {
        let (addr, cancel, task) = spawn_plain().await;
        let http = reqwest::Client::new();

        let health: Value = http
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let url = format!("http://{}/post", addr);
        let body = r#"{"jsonrpc":"2.0","method":"echo","params":{"msg":"hi"},"id":"a"}"#;
        let first = http.post(&url).body(body).send().await.unwrap();
        assert_eq!(first.status(), 200);
        let second = http.post(&url).body(body).send().await.unwrap();
        assert_eq!(second.status(), 202);

        let missing = r#"{"jsonrpc":"2.0","method":"nope","params":{},"id":"b"}"#;
        let response = http.post(&url).body(missing).send().await.unwrap();
        assert_eq!(response.status(), 405);

        let response = http.post(&url).body("garbage").send().await.unwrap();
        assert_eq!(response.status(), 500);
        let envelope: Value = response.json().await.unwrap();
        assert_eq!(envelope["id"], Value::Null);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_socket() {
        let (addr, cancel, task) = spawn_plain().await;

        cancel.cancel();
        task.await.unwrap();

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok(), "port should be free after shutdown");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_retryable() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind(&InterfaceAddr::new("127.0.0.1", port)).await.unwrap_err();
        assert!(matches!(err, RpcError::Bind { .. }));
        assert!(err.is_retryable());
    }
}
