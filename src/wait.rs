//! Polling helpers for callers that need to block on a request's status.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{ObjectKey, WorkRequest};
use crate::storage::RequestClient;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Poll `key` until `predicate` holds, returning the matching request.
///
/// A request that does not exist yet is waited for like any other unmet
/// predicate. Fails with [`Error::Timeout`] once `timeout` elapses.
pub async fn wait_for_condition<F>(
    client: &dyn RequestClient,
    key: &ObjectKey,
    timeout: Duration,
    predicate: F,
) -> Result<WorkRequest>
where
    F: Fn(&WorkRequest) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = None;
    loop {
        match client.get_request(key).await {
            Ok(request) if predicate(&request) => return Ok(request),
            Ok(request) => last = Some(request),
            Err(Error::NotFound(_)) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }
        if tokio::time::Instant::now() >= deadline {
            let seen = match last {
                Some(r) => format!("last status {:?}", r.succeeded().map(|c| c.status)),
                None => "never seen".to_string(),
            };
            return Err(Error::Timeout(format!(
                "waiting for {key} after {timeout:?}, {seen}"
            )));
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Wait until the request's `Succeeded` condition is `True` or `False`.
pub async fn wait_until_done(
    client: &dyn RequestClient,
    key: &ObjectKey,
    timeout: Duration,
) -> Result<WorkRequest> {
    wait_for_condition(client, key, timeout, WorkRequest::is_done).await
}
