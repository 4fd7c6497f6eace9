use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::{EaselError, Result};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Automatic retry behavior for one outbound provider call. Retries are
/// transparent to the scheduler: it only ever observes retry-exhausted or
/// non-retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No retries at all; used by tests that script exact call counts.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }

    let mut body = String::from_utf8_lossy(&out).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
        return Err(EaselError::Api { status, body });
    }
    Ok(response)
}

/// `send_checked` wrapped in bounded exponential backoff. Retries statuses
/// 408/429/500/502/503/504 and transport-level failures; everything else is
/// surfaced on the first attempt.
pub(crate) async fn send_checked_with_retry(
    req: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response> {
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;
    loop {
        let Some(this_attempt) = req.try_clone() else {
            // Non-cloneable bodies (streams) get a single attempt.
            return send_checked(req).await;
        };
        match send_checked(this_attempt).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                if !err.is_retryable() || attempt >= policy.max_retries {
                    return Err(err);
                }
                attempt += 1;
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying provider call"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }
}

pub(crate) async fn send_checked_json_with_retry<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<T> {
    let response = send_checked_with_retry(req, policy).await?;
    Ok(response.json::<T>().await?)
}

#[cfg(test)]
mod tests {
    use httpmock::{Method::POST, MockServer};
    use serde_json::Value;

    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_retryable_status_until_exhausted() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(503).body("overloaded");
            })
            .await;

        let client = reqwest::Client::new();
        let result = send_checked_with_retry(
            client
                .post(server.url("/v1/images/generations"))
                .json(&Value::Null),
            &fast_policy(2),
        )
        .await;

        // 1 initial attempt + 2 retries.
        mock.assert_hits_async(3).await;
        match result {
            Err(EaselError::Api { status, body }) => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn does_not_retry_request_shape_errors() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(400).body("bad prompt");
            })
            .await;

        let client = reqwest::Client::new();
        let result = send_checked_with_retry(
            client
                .post(server.url("/v1/images/generations"))
                .json(&Value::Null),
            &fast_policy(3),
        )
        .await;

        mock.assert_hits_async(1).await;
        assert!(matches!(result, Err(EaselError::Api { status, .. }) if status.as_u16() == 400));
    }
}
