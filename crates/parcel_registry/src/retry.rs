//! Retry behavior shared by registry calls and object transfers.
//!
//! Idempotent requests with replayable bodies are retried by
//! [`reqwest_retry::RetryTransientMiddleware`] configured with
//! [`TransientStrategy`]. Requests with streaming bodies cannot be replayed
//! by middleware; callers drive those with [`wait_for_retry`] instead.

use std::time::{Duration, SystemTime};

pub use retry_policies::{policies::ExponentialBackoff, Jitter, RetryDecision, RetryPolicy};
use reqwest::StatusCode;
use reqwest_retry::{default_on_request_failure, Retryable, RetryableStrategy};

use crate::RegistryConfig;

/// Returns the backoff policy described by `config`: `max_retries` retries,
/// starting at `backoff_base` and doubling after every attempt.
pub fn retry_policy(config: &RegistryConfig) -> ExponentialBackoff {
    let min = config.backoff_base;
    let max = min.saturating_mul(1u32 << config.max_retries.min(16));
    ExponentialBackoff::builder()
        .retry_bounds(min, max.max(min))
        .build_with_max_retries(config.max_retries)
}

/// Server errors that are worth retrying.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Connection failures, timeouts and interrupted bodies are transient. A
/// request error means the connection broke after it was established but
/// before a response arrived (a reset or a half-sent response).
pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

/// A [`RetryableStrategy`] that retries [`is_retryable_status`] responses and
/// [`is_transient_error`] failures and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransientStrategy;

impl RetryableStrategy for TransientStrategy {
    fn handle(
        &self,
        res: &Result<reqwest::Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match res {
            Ok(response) if is_retryable_status(response.status()) => Some(Retryable::Transient),
            Ok(_) => None,
            Err(reqwest_middleware::Error::Reqwest(err)) if is_transient_error(err) => {
                Some(Retryable::Transient)
            }
            Err(err) => default_on_request_failure(err).or(Some(Retryable::Fatal)),
        }
    }
}

/// Asks `policy` whether attempt number `n_past_retries + 1` should happen and
/// sleeps until it may. Returns `false` when the retry budget is exhausted.
pub async fn wait_for_retry(
    policy: &impl RetryPolicy,
    request_start: SystemTime,
    n_past_retries: u32,
) -> bool {
    match policy.should_retry(request_start, n_past_retries) {
        RetryDecision::DoNotRetry => false,
        RetryDecision::Retry { execute_after } => {
            let sleep_for = execute_after
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            tracing::debug!("retrying in {} ms", sleep_for.as_millis());
            tokio::time::sleep(sleep_for).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(500, true)]
    #[case(502, true)]
    #[case(503, true)]
    #[case(504, true)]
    #[case(404, false)]
    #[case(403, false)]
    #[case(501, false)]
    fn test_retryable_status(#[case] status: u16, #[case] retryable: bool) {
        assert_eq!(
            is_retryable_status(StatusCode::from_u16(status).unwrap()),
            retryable
        );
    }

    #[test]
    fn test_policy_respects_max_retries() {
        let config = RegistryConfig {
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            ..RegistryConfig::default()
        };
        let policy = retry_policy(&config);
        let start = SystemTime::now();
        assert!(matches!(
            policy.should_retry(start, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(start, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(start, 2),
            RetryDecision::DoNotRetry
        ));
    }

    /// Accepts connections, reads the request headers and hangs up without
    /// answering.
    async fn hang_up_server() -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_dropped_connection_is_transient() {
        let url = hang_up_server().await;
        let err = reqwest::Client::new().get(url).send().await.unwrap_err();
        assert!(err.is_request());
        assert!(is_transient_error(&err));

        let err = reqwest_middleware::Error::Reqwest(err);
        assert!(matches!(
            TransientStrategy.handle(&Err(err)),
            Some(Retryable::Transient)
        ));
    }

    #[test]
    fn test_middleware_errors_are_fatal() {
        let err = reqwest_middleware::Error::Middleware(anyhow::anyhow!("broken"));
        assert!(matches!(
            TransientStrategy.handle(&Err(err)),
            Some(Retryable::Fatal)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_retry_without_budget() {
        let config = RegistryConfig {
            max_retries: 0,
            ..RegistryConfig::default()
        };
        assert!(!wait_for_retry(&retry_policy(&config), SystemTime::now(), 0).await);
    }
}
