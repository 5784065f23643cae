//! Network plumbing shared by servers and clients.
//!
//! This module provides:
//! - Retry with a configurable ceiling and backoff for listener binds
//! - Loading of TLS material for listeners and client sessions

mod retry;
mod tls;

pub use retry::{retry_async, RetryConfig, RetryError, RetryStats};
pub use tls::{apply_client_tls, server_tls_config};
