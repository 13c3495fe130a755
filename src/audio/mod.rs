//! Audio enrichment
//!
//! Fetches the call's recording from the provider, keeps a durable copy,
//! transcribes it with diarization, and normalizes the result into a
//! speaker-segmented transcript.

mod store;
mod transcriber;
mod transcript;

pub use store::*;
pub use transcriber::*;
pub use transcript::*;

use crate::client::{CallContext, CallDetail, CallProviderClient};
use crate::db::{CallRecording, LeadRequest, Repository, TranscriptionStatus};
use crate::error::{Error, Result, Stage};
use std::sync::Arc;
use tracing::{info, warn};

/// Output of the audio stage
#[derive(Debug, Clone)]
pub struct EnrichedAudio {
    pub call: CallDetail,
    pub recording: CallRecording,
    pub transcript: Transcript,
}

/// Drives fetch -> store -> transcribe -> normalize for one request
pub struct AudioEnricher {
    db: Repository,
    provider: CallProviderClient,
    store: Arc<dyn AudioStore>,
    transcriber: Arc<dyn Transcriber>,
}

impl AudioEnricher {
    pub fn new(
        db: Repository,
        provider: CallProviderClient,
        store: Arc<dyn AudioStore>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            db,
            provider,
            store,
            transcriber,
        }
    }

    /// Enrich `request` using the office's provider credential `token`
    pub async fn enrich(
        &self,
        ctx: &CallContext,
        request: &LeadRequest,
        token: &str,
    ) -> Result<EnrichedAudio> {
        let tenant_id = request.tenant_id.as_str();
        let call_id = request.call_id.as_str();

        let call = self
            .provider
            .get_call(ctx, token, call_id, request.recording_url.is_none())
            .await?;

        // A URL delivered with the webhook wins over the one in call detail
        let recording_url = match request.recording_url.as_deref().or(call.recording_url.as_deref()) {
            Some(url) => url.to_string(),
            None => {
                return Err(Error::NotYetAvailable(format!(
                    "call {} has no recording",
                    call_id
                )))
            }
        };

        let downloaded = self
            .provider
            .download_recording(ctx, token, &recording_url)
            .await?;
        let content_type = downloaded
            .content_type
            .clone()
            .filter(|ct| ct.starts_with("audio/"))
            .unwrap_or_else(|| guess_content_type(&recording_url));

        let stored = self
            .store
            .put(tenant_id, call_id, &content_type, &downloaded.bytes)
            .await?;
        let mut recording = self
            .db
            .upsert_recording(&CallRecording::new(
                tenant_id.to_string(),
                request.id.clone(),
                call_id.to_string(),
                stored.locator.clone(),
                Some(stored.content_type.clone()),
                &downloaded.bytes,
            ))
            .await?;

        let input = TranscriptionInput {
            audio_uri: &stored.locator,
            content_type: &stored.content_type,
            bytes: &downloaded.bytes,
        };
        let response = match self.transcriber.transcribe(ctx, &input).await {
            Ok(response) => response,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(tenant_id, call_id, error = %e, "Transcription failed");
                self.db
                    .set_transcription_status(tenant_id, &recording.id, TranscriptionStatus::Failed)
                    .await?;
                return Err(e.in_stage(Stage::Transcription, tenant_id, &request.id));
            }
        };

        let transcript = normalize(&response);
        self.db
            .set_transcription_status(tenant_id, &recording.id, TranscriptionStatus::Completed)
            .await?;
        recording.transcription_status = TranscriptionStatus::Completed.to_string();
        self.db
            .save_transcription(
                tenant_id,
                &request.id,
                &transcript.text,
                &serde_json::to_string(&transcript)?,
            )
            .await?;

        info!(
            tenant_id,
            call_id,
            bytes = recording.byte_size,
            speakers = transcript.speaker_count,
            segments = transcript.segments.len(),
            "Audio enriched"
        );

        Ok(EnrichedAudio {
            call,
            recording,
            transcript,
        })
    }
}
