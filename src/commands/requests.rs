//! Request inspection and reprocessing

use crate::db::{AiProcessingLog, LeadRequest, Repository, RequestStats, RequestStatus, WebhookEvent};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use serde::Serialize;
use tracing::{info, warn};

/// Requests for a tenant plus per-status counts
#[derive(Debug, Clone, Serialize)]
pub struct RequestList {
    pub tenant_id: String,
    pub stats: RequestStats,
    pub requests: Vec<LeadRequest>,
}

pub async fn cmd_list_requests(
    db: &Repository,
    tenant_id: &str,
    status: Option<RequestStatus>,
    limit: i64,
) -> Result<RequestList> {
    Ok(RequestList {
        tenant_id: tenant_id.to_string(),
        stats: db.request_stats(tenant_id).await?,
        requests: db.list_requests(tenant_id, status, limit).await?,
    })
}

/// Everything recorded about one call
#[derive(Debug, Clone, Serialize)]
pub struct RequestDetail {
    pub request: LeadRequest,
    pub events: Vec<WebhookEvent>,
    pub ai_logs: Vec<AiProcessingLog>,
}

pub async fn cmd_show_request(db: &Repository, tenant_id: &str, call_id: &str) -> Result<RequestDetail> {
    let request = db
        .get_request_by_call(tenant_id, call_id)
        .await?
        .ok_or_else(|| Error::RequestNotFound(call_id.to_string()))?;
    let events = db.list_webhook_events(tenant_id, call_id).await?;
    let ai_logs = db.list_ai_logs(tenant_id, &request.id).await?;
    Ok(RequestDetail {
        request,
        events,
        ai_logs,
    })
}

/// Result of an operator reprocess
#[derive(Debug, Clone, Serialize)]
pub struct ReprocessResult {
    pub call_id: String,
    pub previous_status: String,
    pub status: String,
    pub reopened: bool,
}

/// Run a request through the pipeline again.
///
/// Failed requests are reopened first; `force` also releases a request stuck
/// in `enriching` (for example after a crash) by failing and reopening it.
pub async fn cmd_reprocess(
    db: &Repository,
    pipeline: &Pipeline,
    tenant_id: &str,
    call_id: &str,
    force: bool,
) -> Result<ReprocessResult> {
    let request = db
        .get_request_by_call(tenant_id, call_id)
        .await?
        .ok_or_else(|| Error::RequestNotFound(call_id.to_string()))?;
    let previous = request.get_status()?;

    let mut reopened = false;
    match previous {
        RequestStatus::Failed => {
            reopened = db.reopen_failed_request(tenant_id, &request.id).await?;
        }
        RequestStatus::Enriching if force => {
            warn!(tenant_id, call_id, "Releasing request stuck in enriching");
            db.mark_request_failed(tenant_id, &request.id, "intake", "released by operator", false)
                .await?;
            reopened = db.reopen_failed_request(tenant_id, &request.id).await?;
        }
        RequestStatus::Enriching => {
            return Err(Error::InvalidTransition {
                request_id: request.id,
                from: previous.to_string(),
                to: RequestStatus::Received.to_string(),
            });
        }
        _ => {}
    }

    let status = pipeline.run(tenant_id, &request.id).await?;
    info!(tenant_id, call_id, from = %previous, to = %status, "Reprocessed request");

    Ok(ReprocessResult {
        call_id: call_id.to_string(),
        previous_status: previous.to_string(),
        status: status.to_string(),
        reopened,
    })
}

/// Print a request listing to console
pub fn print_request_list(list: &RequestList) {
    let s = &list.stats;
    println!("\n📞 Requests for {}\n", list.tenant_id);
    println!(
        "received {} · enriching {} · analyzed {} · synced {} · failed {} (needs review {})\n",
        s.received, s.enriching, s.analyzed, s.synced, s.failed, s.needs_review
    );

    if list.requests.is_empty() {
        println!("No requests.");
        return;
    }

    for request in &list.requests {
        let score = request
            .lead_score
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        let review = if request.needs_review { " ⚠ review" } else { "" };
        println!(
            "• {} [{}] score {}{}",
            request.call_id, request.status, score, review
        );
        println!(
            "  Caller: {}",
            request.caller_number.as_deref().unwrap_or("unknown")
        );
        println!("  Received: {}", request.created_at);
    }
}

/// Print one request's detail to console
pub fn print_request_detail(detail: &RequestDetail) {
    let r = &detail.request;
    println!("\n📞 Call {}\n", r.call_id);
    println!("Request: {}", r.id);
    println!("Status: {}", r.status);
    if let Some(stage) = &r.failure_stage {
        println!(
            "Failed at: {} ({})",
            stage,
            r.last_error.as_deref().unwrap_or("no detail")
        );
    }
    if r.needs_review {
        println!("⚠ Needs review");
    }
    println!("Deliveries: {}", r.delivery_count);
    if let Some(score) = r.lead_score {
        println!("Lead score: {}", score);
    }
    if let Some(spam) = r.spam_likelihood {
        println!("Spam likelihood: {}", spam);
    }
    for (provider, record_id) in r.crm_records() {
        println!("CRM {}: {}", provider, record_id);
    }
    if let Some(text) = &r.transcript_text {
        println!("\nTranscript:\n  {}", text);
    }

    println!("\nDeliveries:");
    for event in &detail.events {
        println!(
            "  {} {} [{}] correlation {}",
            event.received_at, event.event_id, event.status, event.correlation_id
        );
    }

    println!("\nAnalysis log:");
    for log in &detail.ai_logs {
        println!(
            "  {} {} attempt {} [{}]",
            log.created_at, log.processing_type, log.attempt, log.status
        );
    }
}
