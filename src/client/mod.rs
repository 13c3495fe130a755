//! Outbound HTTP plumbing
//!
//! Two token buckets bound outbound traffic: one for the call-provider API
//! and one shared by transcription, analysis and CRM calls. Each dependency
//! gets its own [`RetryingClient`] with its own timeout and in-flight limit.

pub mod provider;
pub mod rate_limit;
pub mod retry;

pub use provider::{CallDetail, CallProviderClient, RecordingBytes};
pub use rate_limit::{TokenBucket, TokenPool};
pub use retry::{check_status, CallContext, RetryPolicy, RetryingClient};

use crate::config::Config;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Join `path` onto `base`, keeping any path prefix `base` already has
pub fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {}", path, e)))
}

/// Every outbound client the pipeline needs
#[derive(Clone)]
pub struct ClientSet {
    pub provider: Arc<RetryingClient>,
    pub transcription: Arc<RetryingClient>,
    pub analysis: Arc<RetryingClient>,
    pub crm: Arc<RetryingClient>,
}

impl ClientSet {
    /// Build clients and start one refill task per bucket; the tasks stop when `cancel` fires
    pub fn from_config(config: &Config, cancel: &CancellationToken) -> Result<Self> {
        let outbound = &config.outbound;
        let window = Duration::from_secs(outbound.window_secs);
        let policy = outbound.retry.policy();

        let provider_bucket = Arc::new(TokenBucket::new(
            "provider",
            outbound.provider_requests_per_window as usize,
        ));
        let services_bucket = Arc::new(TokenBucket::new(
            "services",
            outbound.services_requests_per_window as usize,
        ));
        provider_bucket.spawn_refill(window, cancel.clone());
        services_bucket.spawn_refill(window, cancel.clone());

        let build = |name: &str, pool: Arc<TokenBucket>, timeout: u64| -> Result<Arc<RetryingClient>> {
            Ok(Arc::new(RetryingClient::new(
                name,
                RetryingClient::build_http(timeout)?,
                pool,
                outbound.max_in_flight,
                policy.clone(),
            )))
        };

        Ok(Self {
            provider: build("provider", provider_bucket, config.provider.timeout_secs)?,
            transcription: build(
                "transcription",
                services_bucket.clone(),
                config.transcription.timeout_secs,
            )?,
            analysis: build("analysis", services_bucket.clone(), config.analysis.timeout_secs)?,
            crm: build("crm", services_bucket, config.crm.timeout_secs)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let base = Url::parse("https://api.example.com/v2").unwrap();
        assert_eq!(
            endpoint(&base, "/calls/C1").unwrap().as_str(),
            "https://api.example.com/v2/calls/C1"
        );

        let base = Url::parse("http://127.0.0.1:7998").unwrap();
        assert_eq!(
            endpoint(&base, "v1/transcribe").unwrap().as_str(),
            "http://127.0.0.1:7998/v1/transcribe"
        );
    }
}
