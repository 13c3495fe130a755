//! Rate-limited retrying HTTP client
//!
//! Every external dependency (call provider, transcription, analysis, CRM)
//! goes through a [`RetryingClient`]. Each attempt takes a token from the
//! shared pool, runs under an in-flight semaphore, and is classified by
//! [`Error::kind`] to decide whether another attempt is worth making.

use super::rate_limit::TokenPool;
use crate::error::{Error, ErrorKind, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff schedule and attempt ceilings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Ceiling for transient failures (total attempts)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fixed wait between not-yet-available attempts
    pub unavailable_delay: Duration,
    /// Ceiling for not-yet-available failures (total attempts)
    pub unavailable_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::RetryConfig::default().policy()
    }
}

impl RetryPolicy {
    /// Delay before the attempt following the `failures`-th transient failure
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Cancellation and deadline shared by every wait in one unit of work
#[derive(Debug, Clone)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Run `fut` unless cancellation or the deadline comes first
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep, cut short by cancellation or the deadline
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

/// HTTP client wrapper enforcing a token budget and retry policy
pub struct RetryingClient {
    name: String,
    http: Client,
    pool: Arc<dyn TokenPool>,
    in_flight: Semaphore,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(
        name: impl Into<String>,
        http: Client,
        pool: Arc<dyn TokenPool>,
        max_in_flight: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            http,
            pool,
            in_flight: Semaphore::new(max_in_flight.max(1)),
            policy,
        }
    }

    /// Build a plain reqwest client with the given timeout
    pub fn build_http(timeout_secs: u64) -> Result<Client> {
        Ok(Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("leadline/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails non-retryably, or a ceiling is hit
    pub async fn execute<T, F, Fut>(&self, ctx: &CallContext, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut transient_failures = 0u32;
        let mut unavailable_failures = 0u32;

        loop {
            attempt += 1;

            ctx.guard(self.pool.acquire(&ctx.cancel)).await??;
            let permit = ctx
                .guard(self.in_flight.acquire())
                .await?
                .map_err(|_| Error::Cancelled)?;

            debug!(client = %self.name, label, attempt, "Sending request");
            let result = ctx.guard(op()).await?;
            drop(permit);

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let delay = match err.kind() {
                ErrorKind::Transient => {
                    transient_failures += 1;
                    if transient_failures >= self.policy.max_attempts {
                        return Err(self.exhausted(label, attempt, err));
                    }
                    self.policy.backoff(transient_failures)
                }
                ErrorKind::NotYetAvailable => {
                    unavailable_failures += 1;
                    if unavailable_failures >= self.policy.unavailable_max_attempts {
                        return Err(self.exhausted(label, attempt, err));
                    }
                    self.policy.unavailable_delay
                }
                ErrorKind::Authentication => {
                    warn!(
                        target: "audit",
                        client = %self.name,
                        label,
                        error = %err,
                        "Upstream rejected credentials"
                    );
                    return Err(err);
                }
                _ => return Err(err),
            };

            warn!(
                client = %self.name,
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            ctx.sleep(delay).await?;
        }
    }

    fn exhausted(&self, label: &str, attempts: u32, last: Error) -> Error {
        warn!(client = %self.name, label, attempts, error = %last, "Retries exhausted");
        Error::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }

    /// Send a request built fresh for every attempt and decode a JSON body
    pub async fn send_json<T, B>(&self, ctx: &CallContext, label: &str, build: B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Fn() -> RequestBuilder,
    {
        self.execute(ctx, label, || {
            let request = build();
            async move {
                let response = check_status(request.send().await?).await?;
                Ok(response.json::<T>().await?)
            }
        })
        .await
    }
}

/// Map a non-success response to an error
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} {}", url, truncate(&body, 200));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized(message)),
        _ => Err(Error::Upstream {
            status: status.as_u16(),
            message,
        }),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
