use super::transcript::TranscriptionResponse;
use crate::client::{endpoint, CallContext, RetryingClient};
use crate::config::TranscriptionConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use std::sync::Arc;
use url::Url;

/// Audio handed to a transcriber
#[derive(Debug, Clone)]
pub struct TranscriptionInput<'a> {
    pub audio_uri: &'a str,
    pub content_type: &'a str,
    pub bytes: &'a [u8],
}

/// Speech-to-text capability
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        ctx: &CallContext,
        input: &TranscriptionInput<'_>,
    ) -> Result<TranscriptionResponse>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionConfig {
    pub sample_rate_hertz: u32,
    pub encoding: String,
    pub language_code: String,
    pub enable_speaker_diarization: bool,
    pub min_speaker_count: u32,
    pub max_speaker_count: u32,
    pub enable_word_confidence: bool,
    pub enable_word_time_offsets: bool,
}

impl From<&TranscriptionConfig> for RecognitionConfig {
    fn from(config: &TranscriptionConfig) -> Self {
        Self {
            sample_rate_hertz: config.sample_rate_hertz,
            encoding: config.encoding.clone(),
            language_code: config.language_code.clone(),
            enable_speaker_diarization: true,
            min_speaker_count: config.min_speakers,
            max_speaker_count: config.max_speakers,
            enable_word_confidence: true,
            enable_word_time_offsets: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    audio_uri: &'a str,
    content_type: &'a str,
    audio_content: String,
    config: &'a RecognitionConfig,
}

/// Transcription backend reached over HTTP (`POST /v1/transcribe`)
pub struct HttpTranscriber {
    client: Arc<RetryingClient>,
    url: Url,
    api_key: Option<String>,
    recognition: RecognitionConfig,
}

impl HttpTranscriber {
    pub fn new(
        client: Arc<RetryingClient>,
        config: &TranscriptionConfig,
        api_key: Option<String>,
    ) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid transcription URL: {}", e)))?;
        Ok(Self {
            client,
            url: endpoint(&base, "v1/transcribe")?,
            api_key,
            recognition: RecognitionConfig::from(config),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        ctx: &CallContext,
        input: &TranscriptionInput<'_>,
    ) -> Result<TranscriptionResponse> {
        let body = TranscribeRequest {
            audio_uri: input.audio_uri,
            content_type: input.content_type,
            audio_content: STANDARD.encode(input.bytes),
            config: &self.recognition,
        };

        self.client
            .send_json(ctx, "transcription.transcribe", || {
                let request = self.client.http().post(self.url.clone()).json(&body);
                match &self.api_key {
                    Some(key) => request.bearer_auth(key),
                    None => request,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RetryPolicy, TokenBucket};
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_requests_diarization_and_word_timing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transcribe"))
            .and(body_partial_json(serde_json::json!({
                "audio_uri": "file:///audio/t1/recordings/C1.mp3",
                "config": {
                    "enable_speaker_diarization": true,
                    "min_speaker_count": 2,
                    "max_speaker_count": 4,
                    "enable_word_confidence": true,
                    "enable_word_time_offsets": true
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"alternatives": [{"transcript": "hello", "confidence": 0.9, "words": []}]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = TranscriptionConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        let client = Arc::new(RetryingClient::new(
            "transcription",
            reqwest::Client::new(),
            Arc::new(TokenBucket::new("services", 5)),
            2,
            RetryPolicy::default(),
        ));
        let transcriber = HttpTranscriber::new(client, &config, None).unwrap();
        let ctx = CallContext::new(CancellationToken::new());

        let response = transcriber
            .transcribe(
                &ctx,
                &TranscriptionInput {
                    audio_uri: "file:///audio/t1/recordings/C1.mp3",
                    content_type: "audio/mpeg",
                    bytes: b"ID3",
                },
            )
            .await
            .unwrap();
        assert_eq!(response.results[0].alternatives[0].transcript, "hello");
    }
}
