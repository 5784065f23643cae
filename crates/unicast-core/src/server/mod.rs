//! Multi-interface RPC server.
//!
//! A [`UniCastServer`] keeps one listener per desired interface. The desired
//! set lives in an [`InterfaceSet`] that can be changed while the server runs;
//! a control loop notices new entries every poll delay and binds them in the
//! background, retrying transient bind failures.
//!
//! Removing an interface from the set does not close its listener.

mod listener;

use crate::cancel::CancellationToken;
use crate::config::{validate_path, InterfaceAddr, ServerConfig};
use crate::dedup::RequestStore;
use crate::dispatch::{Dispatcher, MethodRegistry, RpcService};
use crate::error::{Result, RpcError};
use crate::network::{retry_async, server_tls_config, RetryConfig, RetryError};
use axum::Router;
use listener::Listener;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Shared, mutable set of addresses the server should listen on.
///
/// Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct InterfaceSet {
    inner: Arc<RwLock<BTreeSet<InterfaceAddr>>>,
}

impl InterfaceSet {
    pub fn new<I>(interfaces: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<InterfaceAddr>,
    {
        Self {
            inner: Arc::new(RwLock::new(
                interfaces.into_iter().map(Into::into).collect(),
            )),
        }
    }

    /// Add an interface. Returns `false` if it was already present.
    pub async fn add(&self, interface: impl Into<InterfaceAddr>) -> bool {
        self.inner.write().await.insert(interface.into())
    }

    /// Remove an interface from the desired set. A listener already bound for
    /// it keeps running.
    pub async fn remove(&self, interface: &InterfaceAddr) -> bool {
        self.inner.write().await.remove(interface)
    }

    pub async fn contains(&self, interface: &InterfaceAddr) -> bool {
        self.inner.read().await.contains(interface)
    }

    /// Current desired interfaces, sorted.
    pub async fn snapshot(&self) -> Vec<InterfaceAddr> {
        self.inner.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[derive(Debug)]
enum ServerState {
    NotStarted,
    Running {
        cancel: CancellationToken,
        control: JoinHandle<()>,
    },
    Stopping,
    Stopped,
}

/// State shared between the server handle, the control loop and bind tasks.
#[derive(Debug, Default)]
struct Shared {
    /// Live listeners keyed by `host:bound_port`.
    listeners: Mutex<HashMap<String, Listener>>,
    /// Interfaces a bind attempt was started for.
    attempted: Mutex<HashSet<InterfaceAddr>>,
    binds: Mutex<JoinSet<()>>,
    bound: Notify,
}

struct LoopContext {
    interfaces: InterfaceSet,
    shared: Arc<Shared>,
    router: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
    poll_delay: Duration,
    bind_retry: RetryConfig,
}

/// JSON-RPC server listening on a dynamic set of interfaces.
#[derive(Debug)]
pub struct UniCastServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    interfaces: InterfaceSet,
    shared: Arc<Shared>,
    state: Mutex<ServerState>,
}

impl UniCastServer {
    /// Create a server with its own request store.
    pub fn new(config: ServerConfig, registry: MethodRegistry) -> Self {
        let store = Arc::new(RequestStore::from_config(&config.dispatch));
        Self::with_store(config, registry, store)
    }

    /// Create a server serving every operation of `service`.
    pub fn for_service<S: RpcService>(config: ServerConfig, service: Arc<S>) -> Self {
        Self::new(config, MethodRegistry::from_service(service))
    }

    /// Create a server that shares `store` with other servers.
    pub fn with_store(
        config: ServerConfig,
        registry: MethodRegistry,
        store: Arc<RequestStore>,
    ) -> Self {
        let dispatcher = Dispatcher::with_store(registry, store, config.dispatch.clone());
        let interfaces = InterfaceSet::new(config.interfaces.iter().cloned());
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            interfaces,
            shared: Arc::new(Shared::default()),
            state: Mutex::new(ServerState::NotStarted),
        }
    }

    /// Handle to the desired interface set.
    pub fn interfaces(&self) -> InterfaceSet {
        self.interfaces.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start the control loop. Listeners are bound in the background.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, ServerState::NotStarted) {
            return Err(RpcError::InvalidState {
                message: "server can only be started once".to_string(),
            });
        }

        validate_path(&self.config.path)?;
        let tls = server_tls_config(&self.config.tls)?.map(TlsAcceptor::from);
        let cancel = CancellationToken::new();
        let context = Arc::new(LoopContext {
            interfaces: self.interfaces.clone(),
            shared: self.shared.clone(),
            router: listener::router(self.dispatcher.clone(), &self.config.path),
            tls,
            cancel: cancel.clone(),
            poll_delay: self.config.poll_delay,
            bind_retry: self.config.bind_retry.clone(),
        });

        let control = tokio::spawn(control_loop(context));
        *state = ServerState::Running { cancel, control };

        info!(
            "Server started ({} interfaces, poll every {:?})",
            self.interfaces.len().await,
            self.config.poll_delay
        );
        Ok(())
    }

    /// Stop the server: close every listener, wait for each to release its
    /// socket, then give the control loop one poll delay to exit.
    pub async fn stop(&self) -> Result<()> {
        let (cancel, mut control) = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, ServerState::Stopping) {
                ServerState::Running { cancel, control } => (cancel, control),
                other => {
                    *state = other;
                    return Err(RpcError::InvalidState {
                        message: "server is not running".to_string(),
                    });
                }
            }
        };

        info!("Stopping server");
        cancel.cancel();

        {
            let mut binds = self.shared.binds.lock().await;
            while let Some(result) = binds.join_next().await {
                if let Err(e) = result {
                    warn!("Bind task ended abnormally: {}", e);
                }
            }
        }

        let listeners: Vec<Listener> = self
            .shared
            .listeners
            .lock()
            .await
            .drain()
            .map(|(_, listener)| listener)
            .collect();
        for listener in listeners {
            listener.closed().await;
        }

        match tokio::time::timeout(self.config.poll_delay, &mut control).await {
            Ok(Ok(())) => debug!("Control loop exited"),
            Ok(Err(e)) => warn!("Control loop ended abnormally: {}", e),
            Err(_) => {
                warn!("Control loop did not exit within {:?}; aborting", self.config.poll_delay);
                control.abort();
            }
        }

        *self.state.lock().await = ServerState::Stopped;
        info!("Server stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ServerState::Running { .. })
    }

    /// Addresses currently being listened on, with ephemeral ports resolved.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .shared
            .listeners
            .lock()
            .await
            .values()
            .map(|listener| listener.local_addr)
            .collect();
        addrs.sort();
        addrs
    }

    /// Wait until at least `count` listeners are bound.
    pub async fn wait_for_listeners(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<SocketAddr>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.bound.notified();
            let addrs = self.local_addrs().await;
            if addrs.len() >= count {
                return Ok(addrs);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RpcError::InvalidState {
                    message: format!(
                        "only {} of {} listeners bound after {:?}",
                        addrs.len(),
                        count,
                        timeout
                    ),
                });
            }
        }
    }
}

impl Drop for UniCastServer {
    fn drop(&mut self) {
        if let ServerState::Running { cancel, control } = self.state.get_mut() {
            cancel.cancel();
            control.abort();
        }
    }
}

async fn control_loop(context: Arc<LoopContext>) {
    debug!("Interface control loop started");
    loop {
        bind_new_interfaces(&context).await;
        if !context.cancel.sleep(context.poll_delay).await {
            break;
        }
    }
    debug!("Interface control loop exiting");
}

/// Start a bind attempt for every desired interface not tried yet.
async fn bind_new_interfaces(context: &Arc<LoopContext>) {
    let desired = context.interfaces.snapshot().await;
    let mut attempted = context.shared.attempted.lock().await;
    let fresh: Vec<InterfaceAddr> = desired
        .into_iter()
        .filter(|interface| !attempted.contains(interface))
        .collect();

    let mut binds = context.shared.binds.lock().await;
    while binds.try_join_next().is_some() {}
    if fresh.is_empty() || context.cancel.is_cancelled() {
        return;
    }

    for interface in fresh {
        debug!("New interface {}", interface);
        attempted.insert(interface.clone());
        binds.spawn(bind_interface(context.clone(), interface));
    }
}

async fn bind_interface(context: Arc<LoopContext>, interface: InterfaceAddr) {
    let (result, stats) = retry_async(
        &context.bind_retry,
        &context.cancel,
        || listener::bind(&interface),
        RpcError::is_retryable,
    )
    .await;

    let tcp = match result {
        Ok(tcp) => tcp,
        Err(RetryError::Cancelled) => {
            debug!("Bind of {} cancelled after {} attempts", interface, stats.attempts);
            return;
        }
        Err(RetryError::Failed(e)) => {
            error!("Giving up on {} after {} attempts: {}", interface, stats.attempts, e);
            return;
        }
    };

    let local_addr = match tcp.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Bound {} but could not read its address: {}", interface, e);
            return;
        }
    };

    let key = InterfaceAddr::new(interface.host.clone(), local_addr.port()).to_string();
    let task = tokio::spawn(listener::serve(
        tcp,
        context.router.clone(),
        context.tls.clone(),
        context.cancel.clone(),
    ));

    let mut listeners = context.shared.listeners.lock().await;
    let listener = Listener::new(key.clone(), local_addr, task);
    if let Some(previous) = listeners.insert(key.clone(), listener) {
        warn!("Replaced listener {} bound at {}", previous.key, previous.local_addr);
    }
    drop(listeners);

    let scheme = if context.tls.is_some() { "https" } else { "http" };
    info!("Listening on {}://{} ({})", scheme, local_addr, key);
    context.shared.bound.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const POLL: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_secs(5);

    fn registry() -> MethodRegistry {
        MethodRegistry::builder()
            .sync("ping", |_| Ok(json!("pong")))
            .build()
    }

    fn config() -> ServerConfig {
        ServerConfig::new()
            .with_interface(("127.0.0.1", 0))
            .with_poll_delay(POLL)
    }

    #[tokio::test]
    async fn test_start_binds_and_stop_releases() {
        let server = UniCastServer::new(config(), registry());
        assert!(!server.is_running().await);

        server.start().await.unwrap();
        assert!(server.is_running().await);
        let addrs = server.wait_for_listeners(1, WAIT).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert!(server.local_addrs().await.is_empty());

        let rebound = tokio::net::TcpListener::bind(addrs[0]).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let server = UniCastServer::new(config(), registry());
        assert!(matches!(server.stop().await, Err(RpcError::InvalidState { .. })));

        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(RpcError::InvalidState { .. })));
        server.stop().await.unwrap();

        assert!(matches!(server.start().await, Err(RpcError::InvalidState { .. })));
        assert!(matches!(server.stop().await, Err(RpcError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_relative_path_from_file_serves() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"interfaces":[{"host":"127.0.0.1","port":0}],"path":"rpc","poll_delay":50}"#,
        )
        .unwrap();
        let config = ServerConfig::from_json_file(file.path()).unwrap();

        let server = UniCastServer::new(config, registry());
        server.start().await.unwrap();
        let addrs = server.wait_for_listeners(1, WAIT).await.unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://{}/rpc", addrs[0]))
            .json(&json!({"jsonrpc": "2.0", "method": "ping", "params": [], "id": "path-1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unroutable_path_rejected_at_start() {
        let mut config = config();
        config.path = "rpc".to_string();
        let server = UniCastServer::new(config, registry());

        assert!(matches!(server.start().await, Err(RpcError::Config { .. })));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_interfaces_added_while_running() {
        let server = UniCastServer::new(config(), registry());
        server.start().await.unwrap();
        server.wait_for_listeners(1, WAIT).await.unwrap();

        let extra = InterfaceAddr::new("localhost", 0);
        assert!(server.interfaces().add(extra.clone()).await);
        let addrs = server.wait_for_listeners(2, WAIT).await.unwrap();
        assert_eq!(addrs.len(), 2);

        // Removal only changes the desired set.
        assert!(server.interfaces().remove(&extra).await);
        tokio::time::sleep(POLL * 3).await;
        assert_eq!(server.local_addrs().await.len(), 2);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_port_bound_once_freed() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let server = UniCastServer::new(
            ServerConfig::new()
                .with_interface(("127.0.0.1", port))
                .with_poll_delay(POLL),
            registry(),
        );
        server.start().await.unwrap();

        tokio::time::sleep(POLL * 3).await;
        assert!(server.local_addrs().await.is_empty());

        drop(blocker);
        let addrs = server.wait_for_listeners(1, WAIT).await.unwrap();
        assert_eq!(addrs[0].port(), port);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_retry_ceiling() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let server = UniCastServer::new(
            ServerConfig::new()
                .with_interface(("127.0.0.1", port))
                .with_poll_delay(POLL)
                .with_bind_retry(RetryConfig::fixed(Duration::from_millis(10)).with_max_attempts(2)),
            registry(),
        );
        server.start().await.unwrap();
        tokio::time::sleep(POLL * 2).await;
        drop(blocker);
        tokio::time::sleep(POLL * 3).await;

        // The attempt gave up before the port was released and is not retried.
        assert!(server.local_addrs().await.is_empty());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_binds() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let server = UniCastServer::new(
            ServerConfig::new()
                .with_interface(("127.0.0.1", port))
                .with_poll_delay(Duration::from_secs(30)),
            registry(),
        );
        server.start().await.unwrap();
        tokio::time::sleep(POLL).await;

        let started = tokio::time::Instant::now();
        server.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
