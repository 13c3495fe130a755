//! Request lookup
//!
//! Callers authenticate with the tenant's webhook secret: `X-Webhook-Timestamp`
//! is required, and `X-Signature` is the HMAC of `"{timestamp}\n{path}"`.

use super::{header_str, AppState};
use crate::db::LeadRequest;
use crate::error::{Error, ErrorKind, Result};
use crate::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

/// Public view of a request; the raw payload stays internal
#[derive(Debug, Serialize)]
pub struct RequestView {
    pub id: String,
    pub call_id: String,
    pub status: String,
    pub lead_score: Option<i64>,
    pub spam_likelihood: Option<i64>,
    pub analysis: Option<Value>,
    pub transcript: Option<String>,
    pub crm_records: std::collections::BTreeMap<String, String>,
    pub failure_stage: Option<String>,
    pub needs_review: bool,
    pub delivery_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<LeadRequest> for RequestView {
    fn from(request: LeadRequest) -> Self {
        let crm_records = request.crm_records();
        Self {
            analysis: request
                .analysis_json
                .as_deref()
                .and_then(|j| serde_json::from_str(j).ok()),
            id: request.id,
            call_id: request.call_id,
            status: request.status,
            lead_score: request.lead_score,
            spam_likelihood: request.spam_likelihood,
            transcript: request.transcript_text,
            crm_records,
            failure_stage: request.failure_stage,
            needs_review: request.needs_review,
            delivery_count: request.delivery_count,
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}

/// GET /tenants/{tenant_id}/requests/{call_id}
pub async fn lookup_request(
    State(state): State<AppState>,
    Path((tenant_id, call_id)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> std::result::Result<Json<RequestView>, StatusCode> {
    if let Err(e) = authenticate(&state, &tenant_id, uri.path(), &headers).await {
        if e.kind() == ErrorKind::Authentication {
            warn!(target: "audit", %tenant_id, reason = %e, "Request lookup rejected");
            return Err(StatusCode::UNAUTHORIZED);
        }
        error!(%tenant_id, error = %e, "Request lookup authentication failed");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    match state.db.get_request_by_call(&tenant_id, &call_id).await {
        Ok(Some(request)) => Ok(Json(request.into())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(%tenant_id, %call_id, error = %e, "Request lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn authenticate(
    state: &AppState,
    tenant_id: &str,
    path: &str,
    headers: &HeaderMap,
) -> Result<()> {
    let tenant = state
        .db
        .get_tenant(tenant_id)
        .await?
        .ok_or_else(|| Error::UnknownTenant(tenant_id.to_string()))?;
    if !tenant.is_active() {
        return Err(Error::TenantInactive(tenant_id.to_string()));
    }

    let sent = header_str(headers, TIMESTAMP_HEADER).ok_or(Error::StaleTimestamp)?;
    signature::check_timestamp(sent, state.config.server.timestamp_tolerance_secs)?;

    let provided = header_str(headers, SIGNATURE_HEADER).ok_or(Error::InvalidSignature)?;
    if !signature::verify_lookup(sent, path, provided, &tenant.webhook_secret) {
        return Err(Error::InvalidSignature);
    }
    Ok(())
}
