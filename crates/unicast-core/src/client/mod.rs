//! Multi-interface RPC client.
//!
//! Every call is sent to all configured endpoints at once with the same
//! correlation id; the first successful answer wins and the rest are
//! cancelled. Servers deduplicate by id, so a method runs once even when
//! several of the endpoints reach the same server.

mod counter;
mod pool;
mod race;

use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{Params, Request, Response};
use bytes::Bytes;
use counter::InFlight;
use pool::SessionPool;
use race::{first_success, Reply, Windows};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use url::Url;

/// Client issuing each call to several peer endpoints concurrently.
#[derive(Debug)]
pub struct UniCastClient {
    config: ClientConfig,
    urls: Vec<Url>,
    pool: SessionPool,
    in_flight: InFlight,
    closing: AtomicBool,
}

impl UniCastClient {
    /// Create a client for the endpoints in `config`.
    ///
    /// Sessions are opened lazily, so this only validates the endpoint URLs.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(RpcError::Config {
                message: "client needs at least one endpoint".to_string(),
            });
        }

        let scheme = config.tls.scheme();
        let urls = config
            .endpoints
            .iter()
            .map(|endpoint| {
                let raw = format!("{}://{}{}", scheme, endpoint, config.path);
                Url::parse(&raw).map_err(|e| RpcError::Config {
                    message: format!("invalid endpoint URL {}: {}", raw, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pool: SessionPool::new(&config),
            config,
            urls,
            in_flight: InFlight::new(),
            closing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Endpoint URLs every call is sent to.
    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    /// Call `method` on the peers and return its result.
    pub async fn invoke(&self, method: &str, params: Params) -> Result<Value> {
        let _call = self.in_flight.acquire();
        if self.closing.load(Ordering::SeqCst) {
            return Err(RpcError::Closing);
        }

        let request = Request::new(method, params);
        debug!("Calling {} (id {}) on {} endpoints", method, request.id, self.urls.len());
        let body = request.to_bytes()?;

        let session = self.pool.session().await?;
        let windows = Windows {
            first: self.config.first_wait,
            next: self.config.next_wait,
        };
        let attempts = self
            .urls
            .iter()
            .map(|url| self.post(&session, url, body.clone()));

        let reply = match first_success(attempts, windows).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Call {} (id {}) failed: {}", method, request.id, e);
                self.pool.reset().await;
                return Err(e);
            }
        };

        Response::from_slice(&reply)?.into_result()
    }

    /// Call `method` and deserialize its result into `T`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Params) -> Result<T> {
        let value = self.invoke(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST one request body to one endpoint.
    async fn post(&self, session: &reqwest::Client, url: &Url, body: Bytes) -> Result<Reply> {
        let _guard = self.in_flight.acquire();
        let response = session
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body))
    }

    /// Reject new calls, wait for running ones, then drop every session.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let running = self.in_flight.count();
        if running > 0 {
            debug!("Waiting for {} in-flight requests", running);
        }
        self.in_flight.drained().await;
        self.pool.reset().await;
        info!("Client closed");
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Calls and endpoint requests currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Number of pooled sessions.
    pub async fn session_count(&self) -> usize {
        self.pool.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceAddr, TlsConfig};

    #[test]
    fn test_endpoint_urls() {
        let client = UniCastClient::new(
            ClientConfig::new()
                .with_endpoint(("127.0.0.1", 8080))
                .with_endpoint(InterfaceAddr::new("::1", 9090))
                .with_path("rpc"),
        )
        .unwrap();

        let urls: Vec<&str> = client.urls().iter().map(Url::as_str).collect();
        assert_eq!(urls, vec!["http://127.0.0.1:8080/rpc", "http://[::1]:9090/rpc"]);
    }

    #[test]
    fn test_tls_switches_scheme() {
        let client = UniCastClient::new(
            ClientConfig::new()
                .with_endpoint(("localhost", 8443))
                .with_tls(TlsConfig::default().with_ca_file("/tmp/ca.pem")),
        )
        .unwrap();
        assert_eq!(client.urls()[0].scheme(), "https");
    }

    #[test]
    fn test_no_endpoints_rejected() {
        let err = UniCastClient::new(ClientConfig::new()).unwrap_err();
        assert!(matches!(err, RpcError::Config { .. }));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = UniCastClient::new(ClientConfig::new().with_endpoint(("127.0.0.1", 1))).unwrap();
        client.close().await;
        assert!(client.is_closing());

        let err = client.invoke("echo", Params::none()).await.unwrap_err();
        assert!(matches!(err, RpcError::Closing));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_resets_pool() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = UniCastClient::new(ClientConfig::new().with_endpoint(("127.0.0.1", port))).unwrap();

        let err = client.invoke("echo", Params::none()).await.unwrap_err();
        assert!(err.is_transport_failure(), "{:?}", err);
        assert_eq!(client.session_count().await, 0);
        assert_eq!(client.in_flight(), 0);
    }
}
