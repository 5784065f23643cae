//! Unicast Core - exactly-once JSON-RPC over several network interfaces.
//!
//! A [`UniCastServer`] listens on a changing set of interfaces and executes
//! each correlation id at most once, however many times and over however many
//! interfaces it is delivered. A [`UniCastClient`] sends every call to all of
//! its peer endpoints at once and returns the first successful answer.
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use unicast_core::{
//!     ClientConfig, MethodRegistry, Params, ServerConfig, UniCastClient, UniCastServer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> unicast_core::Result<()> {
//!     let registry = MethodRegistry::builder()
//!         .sync("echo", |params| Ok(params.arg(0, "msg")?))
//!         .build();
//!
//!     let server = UniCastServer::new(
//!         ServerConfig::new()
//!             .with_interface(("127.0.0.1", 8001))
//!             .with_interface(("127.0.0.2", 8001)),
//!         registry,
//!     );
//!     server.start().await?;
//!
//!     let client = UniCastClient::new(
//!         ClientConfig::new()
//!             .with_endpoint(("127.0.0.1", 8001))
//!             .with_endpoint(("127.0.0.2", 8001)),
//!     )?;
//!     let reply: String = client.call("echo", Params::named([("msg", "abc")])).await?;
//!     assert_eq!(reply, "abc");
//!
//!     client.close().await;
//!     server.stop().await
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod network;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use client::UniCastClient;
pub use config::{ClientConfig, DispatchConfig, InterfaceAddr, RpcDefaults, ServerConfig, TlsConfig};
pub use dedup::{Cleaner, Registration, RequestStore};
pub use dispatch::{CallStatus, Dispatcher, MethodKind, MethodRegistry, RegistryBuilder, RpcService};
pub use error::{Result, RpcError};
pub use network::RetryConfig;
pub use protocol::{Params, Request, Response};
pub use server::{InterfaceSet, UniCastServer};
