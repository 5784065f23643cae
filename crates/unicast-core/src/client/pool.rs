//! Rotating pool of HTTP sessions.
//!
//! Every call ticks the rotation cycle. The first phase only arms it, the
//! second opens a fresh session that new calls will use, and the third drops
//! the oldest session once more than one exists. Calls that already hold a
//! dropped session finish on it normally.

use crate::config::{ClientConfig, TlsConfig};
use crate::dedup::{Cleaner, CleanerStep};
use crate::error::Result;
use crate::network::apply_client_tls;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct PoolInner {
    /// Oldest first; calls use the newest.
    sessions: VecDeque<reqwest::Client>,
    cleaner: Cleaner,
}

#[derive(Debug)]
pub(crate) struct SessionPool {
    pool_limit: usize,
    tls: TlsConfig,
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            pool_limit: config.pool_limit,
            tls: config.tls.clone(),
            inner: Mutex::new(PoolInner {
                sessions: VecDeque::new(),
                cleaner: Cleaner::with_phase_length(config.monitoring_timeout),
            }),
        }
    }

    /// Build one session with the configured limits and TLS material.
    pub(crate) fn open_session(&self) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder().pool_max_idle_per_host(self.pool_limit);
        Ok(apply_client_tls(builder, &self.tls)?.build()?)
    }

    /// Advance the rotation and return the session new calls should use.
    pub(crate) async fn session(&self) -> Result<reqwest::Client> {
        let mut inner = self.inner.lock().await;
        let len = inner.sessions.len();
        match inner.cleaner.tick(len) {
            CleanerStep::Snapshot(_) => {
                inner.sessions.push_back(self.open_session()?);
                debug!("Opened fresh session ({} pooled)", inner.sessions.len());
            }
            CleanerStep::Evict(_) if inner.sessions.len() > 1 => {
                inner.sessions.pop_front();
                debug!("Retired oldest session ({} pooled)", inner.sessions.len());
            }
            _ => {}
        }

        if let Some(session) = inner.sessions.back() {
            return Ok(session.clone());
        }
        let session = self.open_session()?;
        inner.sessions.push_back(session.clone());
        Ok(session)
    }

    /// Drop every pooled session and restart the rotation.
    pub(crate) async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.sessions.clear();
        inner.cleaner.reset();
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}
