//! Racing one call across every endpoint.

use crate::error::{Result, RpcError};
use crate::protocol::Response;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Status and body of one endpoint's answer.
pub(crate) type Reply = (StatusCode, Bytes);

/// Wait windows for [`first_success`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Windows {
    pub(crate) first: Duration,
    pub(crate) next: Duration,
}

/// Drive `attempts` concurrently and return the body of the first 200 reply.
///
/// A 500 reply is kept as the best-known failure while other endpoints may
/// still succeed. Other statuses count only when nothing better arrives, and
/// transport errors only when no endpoint answered at all. Each wait is
/// bounded by `windows.first` before the first completion and `windows.next`
/// after it. Returning drops the remaining attempts, which cancels them.
pub(crate) async fn first_success<I, F>(attempts: I, windows: Windows) -> Result<Bytes>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<Reply>>,
{
    let mut pending: FuturesUnordered<F> = attempts.into_iter().collect();
    let mut window = windows.first;
    let mut server_error: Option<Bytes> = None;
    let mut other_reply: Option<Bytes> = None;
    let mut last_error: Option<RpcError> = None;

    loop {
        let next = match tokio::time::timeout(window, pending.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!("No endpoint completed within {:?}, cancelling {} requests", window, pending.len());
                return Err(RpcError::RequestTimeout(window));
            }
        };

        match next {
            None => break,
            Some(Ok((status, body))) if status == StatusCode::OK => return Ok(body),
            Some(Ok((status, body))) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                debug!("Endpoint reported an error, waiting for {} others", pending.len());
                server_error = Some(body);
            }
            Some(Ok((status, body))) => {
                debug!("Endpoint answered {}", status);
                other_reply = Some(body);
            }
            Some(Err(e)) => {
                debug!("Endpoint request failed: {}", e);
                last_error = Some(e);
            }
        }

        window = windows.next;
    }

    if let Some(body) = server_error.or(other_reply) {
        return Err(remote_error(&body));
    }
    Err(last_error.unwrap_or_else(|| RpcError::Request {
        message: "no endpoints to call".to_string(),
    }))
}

/// Extract the server-reported error from a failed reply.
fn remote_error(body: &[u8]) -> RpcError {
    match Response::from_slice(body) {
        Ok(Response {
            error: Some(error), ..
        }) => RpcError::RemoteMethod(error),
        Ok(_) => RpcError::RemoteMethod("remote call failed without an error message".to_string()),
        Err(_) => RpcError::RemoteMethod(String::from_utf8_lossy(body).into_owned()),
    }
}
