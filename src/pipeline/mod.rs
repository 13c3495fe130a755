//! Request pipeline
//!
//! A persisted state machine over `requests.status`:
//! `received -> enriching -> analyzed -> synced`, with `failed` reachable
//! from any non-terminal state. [`Pipeline::run`] re-reads the row on every
//! call, so a redelivery or an operator reprocess resumes wherever the
//! request stopped.
//!
//! Every stage shares one [`CallContext`]: the shutdown token plus a
//! deadline of `window_started_at + pipeline.max_retry_window_secs`.

use crate::analysis::{CallContextInfo, ContentAnalyzer, HttpLanguageModel};
use crate::audio::{AudioEnricher, HttpTranscriber, LocalAudioStore};
use crate::client::{CallContext, CallProviderClient, ClientSet};
use crate::config::Config;
use crate::crm::CrmDispatcher;
use crate::db::{LeadRequest, Repository, RequestStatus, WebhookEventStatus};
use crate::error::{Error, ErrorKind, Result, Stage};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Requests per tenant and status picked up by one startup sweep
const RESUME_BATCH: i64 = 500;

/// Drives requests through enrichment, analysis and CRM sync
pub struct Pipeline {
    db: Repository,
    config: Arc<Config>,
    audio: AudioEnricher,
    analyzer: ContentAnalyzer,
    crm: CrmDispatcher,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        db: Repository,
        config: Arc<Config>,
        audio: AudioEnricher,
        analyzer: ContentAnalyzer,
        crm: CrmDispatcher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            config,
            audio,
            analyzer,
            crm,
            cancel,
        }
    }

    /// Wire the HTTP-backed stages described by `config`
    pub fn from_config(
        config: Arc<Config>,
        db: Repository,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let clients = ClientSet::from_config(&config, &cancel)?;

        let provider = CallProviderClient::new(clients.provider.clone(), &config.provider.base_url)?;
        let transcriber = HttpTranscriber::new(
            clients.transcription.clone(),
            &config.transcription,
            config.transcription_api_key(),
        )?;
        let audio = AudioEnricher::new(
            db.clone(),
            provider,
            Arc::new(LocalAudioStore::new(&config.paths.audio_dir)),
            Arc::new(transcriber),
        );

        let model = HttpLanguageModel::new(
            clients.analysis.clone(),
            &config.analysis,
            config.analysis_api_key(),
        )?;
        let analyzer = ContentAnalyzer::new(db.clone(), Arc::new(model), config.analysis.clone());

        let crm = CrmDispatcher::with_default_connectors(db.clone(), config.clone(), clients.crm);

        Ok(Self::new(db, config, audio, analyzer, crm, cancel))
    }

    pub fn crm(&self) -> &CrmDispatcher {
        &self.crm
    }

    /// Process the request behind one webhook delivery, tracking the delivery's status
    pub async fn run_event(
        &self,
        tenant_id: &str,
        request_id: &str,
        event_id: &str,
    ) -> Result<RequestStatus> {
        self.db
            .advance_webhook_event(tenant_id, event_id, WebhookEventStatus::Processing, None)
            .await?;

        let outcome = self.run(tenant_id, request_id).await;
        let event_status = match &outcome {
            Ok(RequestStatus::Failed) => WebhookEventStatus::Failed,
            Ok(_) => WebhookEventStatus::Completed,
            Err(Error::Cancelled) => return outcome,
            Err(_) => WebhookEventStatus::Failed,
        };
        self.db
            .advance_webhook_event(tenant_id, event_id, event_status, None)
            .await?;
        outcome
    }

    /// Advance one request as far as it can go and return where it ended up.
    ///
    /// Enrichment and CRM sync each run under a lease (`claimed_at`). A
    /// request another worker holds is left alone until its lease goes stale;
    /// an interrupted run hands its lease back so the next run resumes.
    pub async fn run(&self, tenant_id: &str, request_id: &str) -> Result<RequestStatus> {
        let request = self
            .db
            .get_request(tenant_id, request_id)
            .await?
            .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
        let status = request.get_status()?;

        if status.is_terminal() {
            debug!(tenant_id, request_id, status = %status, "Nothing to do for request");
            return Ok(status);
        }

        let Some(ctx) = self.context_for(&request) else {
            warn!(
                tenant_id,
                call_id = %request.call_id,
                status = %status,
                "Retry window elapsed before processing finished"
            );
            let stage = match status {
                RequestStatus::Analyzed => Stage::CrmSync,
                _ => Stage::Intake,
            };
            return self
                .mark_failed(&request, stage, &Error::DeadlineExceeded.to_string(), true)
                .await;
        };

        let request = if status == RequestStatus::Analyzed {
            request
        } else {
            let Some(lease) = self
                .claim(&request, RequestStatus::Received, RequestStatus::Enriching)
                .await?
            else {
                debug!(tenant_id, request_id, "Request claimed by another worker");
                return self.current_status(tenant_id, request_id).await;
            };
            if status == RequestStatus::Enriching {
                warn!(tenant_id, call_id = %request.call_id, "Took over an abandoned enrichment claim");
            }

            if let Err(e) = self.enrich_and_analyze(&ctx, &request).await {
                return self
                    .fail(&request, &lease, RequestStatus::Received, e)
                    .await;
            }

            match self.db.get_request(tenant_id, request_id).await? {
                Some(r) if r.get_status()? == RequestStatus::Analyzed => r,
                Some(r) => return r.get_status(),
                None => return Err(Error::RequestNotFound(request_id.to_string())),
            }
        };

        self.sync(&ctx, &request).await
    }

    /// Requeue every unfinished request of every active tenant on `tracker`.
    ///
    /// Runs at startup so work interrupted by a shutdown or crash resumes
    /// without waiting for a redelivery. Returns how many runs were queued.
    pub async fn resume_unfinished(self: &Arc<Self>, tracker: &TaskTracker) -> Result<usize> {
        let mut queued = 0;
        for tenant in self.db.list_tenants().await? {
            if !tenant.is_active() {
                continue;
            }
            for status in [
                RequestStatus::Received,
                RequestStatus::Enriching,
                RequestStatus::Analyzed,
            ] {
                let requests = self
                    .db
                    .list_requests(&tenant.id, Some(status), RESUME_BATCH)
                    .await?;
                for request in requests {
                    let pipeline = Arc::clone(self);
                    let tenant_id = tenant.id.clone();
                    tracker.spawn(async move {
                        if let Err(e) = pipeline.run(&tenant_id, &request.id).await {
                            warn!(%tenant_id, request_id = %request.id, error = %e, "Resumed run failed");
                        }
                    });
                    queued += 1;
                }
            }
        }
        if queued > 0 {
            info!(queued, "Resuming unfinished requests");
        }
        Ok(queued)
    }

    async fn claim(
        &self,
        request: &LeadRequest,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<Option<String>> {
        let stale_after = chrono::Duration::seconds(self.config.pipeline.claim_timeout_secs as i64);
        self.db
            .claim_request(&request.tenant_id, &request.id, from, to, stale_after)
            .await
    }

    async fn enrich_and_analyze(&self, ctx: &CallContext, request: &LeadRequest) -> Result<()> {
        let tenant_id = request.tenant_id.as_str();
        let request_id = request.id.as_str();

        let office = self
            .db
            .get_office(tenant_id, &request.office_id)
            .await?
            .ok_or_else(|| Error::OfficeInactive(request.office_id.clone()))
            .map_err(|e| e.in_stage(Stage::Audio, tenant_id, request_id))?;
        let token = self
            .config
            .resolve_credential(&office.credential_ref)
            .map_err(|e| e.in_stage(Stage::Audio, tenant_id, request_id))?;

        let audio = self
            .audio
            .enrich(ctx, request, &token)
            .await
            .map_err(|e| staged(e, Stage::Audio, tenant_id, request_id))?;
        if audio.transcript.is_empty() {
            warn!(tenant_id, call_id = %request.call_id, "Recording produced an empty transcript");
        }

        let info = CallContextInfo::from_request(request, audio.call.duration);
        let workflow = office.workflow();
        let guidance = workflow.get("scoring_guidance").and_then(|v| v.as_str());
        let outcome = self
            .analyzer
            .analyze(ctx, tenant_id, request_id, &info, &audio.transcript, guidance)
            .await
            .map_err(|e| staged(e, Stage::Analysis, tenant_id, request_id))?;

        let stored = self
            .db
            .complete_analysis(
                tenant_id,
                request_id,
                &serde_json::to_string(&outcome.analysis)?,
                outcome.analysis.lead_score,
                outcome.spam_likelihood,
            )
            .await?;
        if !stored {
            warn!(tenant_id, request_id, "Request left enriching before analysis was stored");
        }
        Ok(())
    }

    async fn sync(&self, ctx: &CallContext, request: &LeadRequest) -> Result<RequestStatus> {
        let tenant_id = request.tenant_id.as_str();

        let Some(lease) = self
            .claim(request, RequestStatus::Analyzed, RequestStatus::Analyzed)
            .await?
        else {
            debug!(tenant_id, request_id = %request.id, "CRM sync already in progress elsewhere");
            return self.current_status(tenant_id, &request.id).await;
        };

        // Re-read under the lease so record ids pushed by an earlier holder are seen
        let request = self
            .db
            .get_request(tenant_id, &request.id)
            .await?
            .ok_or_else(|| Error::RequestNotFound(request.id.clone()))?;

        let report = match self.crm.sync(ctx, &request).await {
            Ok(report) => report,
            Err(e) => {
                return self
                    .fail(
                        &request,
                        &lease,
                        RequestStatus::Analyzed,
                        e.in_stage(Stage::CrmSync, tenant_id, &request.id),
                    )
                    .await
            }
        };

        if report.eligible == 0 {
            self.db
                .release_claim(tenant_id, &request.id, &lease, RequestStatus::Analyzed)
                .await?;
            info!(
                tenant_id,
                call_id = %request.call_id,
                "No active CRM integrations; request stays analyzed"
            );
            return Ok(RequestStatus::Analyzed);
        }

        if report.is_complete() {
            if self
                .db
                .transition_request(tenant_id, &request.id, RequestStatus::Synced)
                .await?
            {
                info!(
                    tenant_id,
                    call_id = %request.call_id,
                    pushed = report.pushed.len(),
                    "Request synced"
                );
                return Ok(RequestStatus::Synced);
            }
            return self.current_status(tenant_id, &request.id).await;
        }

        let message = report
            .failures
            .iter()
            .map(|(provider, e)| format!("{}: {}", provider, e))
            .collect::<Vec<_>>()
            .join("; ");
        self.mark_failed(&request, Stage::CrmSync, &message, true).await
    }

    /// Record a stage failure. Cancellation hands the lease back and leaves
    /// the request at `resume_at` for the next run.
    async fn fail(
        &self,
        request: &LeadRequest,
        lease: &str,
        resume_at: RequestStatus,
        err: Error,
    ) -> Result<RequestStatus> {
        if matches!(err.root(), Error::Cancelled) {
            let released = self
                .db
                .release_claim(&request.tenant_id, &request.id, lease, resume_at)
                .await?;
            warn!(
                tenant_id = %request.tenant_id,
                call_id = %request.call_id,
                resume_at = %resume_at,
                released,
                "Processing interrupted by shutdown"
            );
            return Err(Error::Cancelled);
        }

        let stage = match &err {
            Error::Stage { stage, .. } => *stage,
            _ => Stage::Intake,
        };
        let message = match &err {
            Error::Stage { source, .. } => source.to_string(),
            other => other.to_string(),
        };
        self.mark_failed(request, stage, &message, needs_review(&err))
            .await
    }

    async fn mark_failed(
        &self,
        request: &LeadRequest,
        stage: Stage,
        message: &str,
        needs_review: bool,
    ) -> Result<RequestStatus> {
        let tenant_id = request.tenant_id.as_str();
        if self
            .db
            .mark_request_failed(tenant_id, &request.id, stage.as_str(), message, needs_review)
            .await?
        {
            error!(
                tenant_id,
                call_id = %request.call_id,
                stage = %stage,
                needs_review,
                error = %message,
                "Request failed"
            );
            return Ok(RequestStatus::Failed);
        }
        self.current_status(tenant_id, &request.id).await
    }

    async fn current_status(&self, tenant_id: &str, request_id: &str) -> Result<RequestStatus> {
        self.db
            .get_request(tenant_id, request_id)
            .await?
            .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?
            .get_status()
    }

    /// Context bounded by the request's retry window, or None once it has elapsed
    fn context_for(&self, request: &LeadRequest) -> Option<CallContext> {
        let window = chrono::Duration::seconds(self.config.pipeline.max_retry_window_secs as i64);
        let started = request.window_started_at_utc().unwrap_or_else(Utc::now);
        let remaining = (started + window - Utc::now()).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        Some(CallContext::new(self.cancel.child_token()).with_deadline(Instant::now() + remaining))
    }
}

/// Attach `stage` unless a deeper layer already did
fn staged(err: Error, stage: Stage, tenant_id: &str, request_id: &str) -> Error {
    match err {
        Error::Stage { .. } => err,
        other => other.in_stage(stage, tenant_id, request_id),
    }
}

/// Failures a redelivery will not fix on its own
fn needs_review(err: &Error) -> bool {
    let mut current = err;
    loop {
        match current {
            Error::Stage { source, .. } => current = source,
            Error::RetriesExhausted { .. } | Error::DeadlineExceeded => return true,
            other => {
                return matches!(
                    other.kind(),
                    ErrorKind::Parse | ErrorKind::Authentication | ErrorKind::Fatal
                )
            }
        }
    }
}
