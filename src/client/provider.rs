//! Call-provider API client

use super::retry::{check_status, CallContext, RetryingClient};
use super::endpoint;
use crate::error::{Error, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Call detail as returned by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallDetail {
    #[serde(default, alias = "call_id")]
    pub id: String,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default, alias = "customer_phone_number")]
    pub caller_number: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Downloaded recording
#[derive(Debug, Clone)]
pub struct RecordingBytes {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Bearer-authenticated client for the call-provider API
#[derive(Clone)]
pub struct CallProviderClient {
    client: Arc<RetryingClient>,
    base_url: Url,
}

impl CallProviderClient {
    pub fn new(client: Arc<RetryingClient>, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid provider URL: {}", e)))?;
        Ok(Self { client, base_url })
    }

    /// Fetch call detail.
    ///
    /// With `need_recording_url`, a detail without a recording URL counts as
    /// `NotYetAvailable` and is polled on the longer schedule.
    pub async fn get_call(
        &self,
        ctx: &CallContext,
        token: &str,
        call_id: &str,
        need_recording_url: bool,
    ) -> Result<CallDetail> {
        let url = endpoint(&self.base_url, &format!("calls/{}", call_id))?;
        debug!(call_id, need_recording_url, "Fetching call detail");
        self.client
            .execute(ctx, "provider.get_call", || {
                let request = self.client.http().get(url.clone()).bearer_auth(token);
                async move {
                    let response = check_status(request.send().await?).await?;
                    let detail: CallDetail = response.json().await?;
                    if need_recording_url && detail.recording_url.is_none() {
                        return Err(Error::NotYetAvailable(format!(
                            "call {} has no recording yet",
                            call_id
                        )));
                    }
                    Ok(detail)
                }
            })
            .await
    }

    /// Download recording bytes. A missing recording is `NotYetAvailable`.
    pub async fn download_recording(
        &self,
        ctx: &CallContext,
        token: &str,
        recording_url: &str,
    ) -> Result<RecordingBytes> {
        let url = Url::parse(recording_url)?;
        self.client
            .execute(ctx, "provider.download_recording", || {
                let request = self.client.http().get(url.clone()).bearer_auth(token);
                async move {
                    let response = request.send().await?;
                    if response.status() == StatusCode::NOT_FOUND
                        || response.status() == StatusCode::NO_CONTENT
                    {
                        return Err(Error::NotYetAvailable(format!(
                            "recording at {} returned {}",
                            response.url().path(),
                            response.status().as_u16()
                        )));
                    }
                    let response = check_status(response).await?;
                    let content_type = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
                    let bytes = response.bytes().await?.to_vec();
                    if bytes.is_empty() {
                        return Err(Error::NotYetAvailable("recording body is empty".to_string()));
                    }
                    Ok(RecordingBytes {
                        bytes,
                        content_type,
                    })
                }
            })
            .await
    }
}
