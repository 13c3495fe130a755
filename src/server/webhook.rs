//! Call webhook intake

use super::{header_str, AppState};
use crate::db::{NewRequest, WebhookEvent};
use crate::error::{Error, ErrorKind, Result};
use crate::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Call-completed delivery from the call provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallWebhook {
    #[serde(deserialize_with = "id_string", alias = "callId")]
    pub call_id: String,
    #[serde(deserialize_with = "id_string")]
    pub tenant_id: String,
    #[serde(deserialize_with = "id_string", alias = "company_resource_id")]
    pub company_id: String,
    #[serde(default, alias = "customer_phone_number", alias = "caller_number")]
    pub caller_phone: Option<String>,
    #[serde(default, alias = "customer_name")]
    pub caller_name: Option<String>,
    #[serde(default, alias = "customer_city")]
    pub city: Option<String>,
    #[serde(default, alias = "customer_state")]
    pub state: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub lead_status: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Providers send ids as strings or bare numbers
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

impl CallWebhook {
    fn parse(body: &[u8]) -> Result<Self> {
        let payload: CallWebhook = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidPayload(e.to_string()))?;
        for (field, value) in [
            ("call_id", &payload.call_id),
            ("tenant_id", &payload.tenant_id),
            ("company_id", &payload.company_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidPayload(format!("{} is empty", field)));
            }
        }
        if payload.duration.is_some_and(|d| d < 0) {
            return Err(Error::InvalidPayload("duration is negative".to_string()));
        }
        Ok(payload)
    }

    fn to_new_request(&self, tenant_id: &str, office_id: &str, raw: &[u8]) -> NewRequest {
        NewRequest {
            tenant_id: tenant_id.to_string(),
            office_id: office_id.to_string(),
            call_id: self.call_id.clone(),
            raw_payload: String::from_utf8_lossy(raw).into_owned(),
            caller_number: self.caller_phone.clone(),
            caller_name: self.caller_name.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            duration_seconds: self.duration,
            source: self.source.clone(),
            recording_url: self.recording_url.clone().filter(|u| !u.trim().is_empty()),
            tags: self.tags.clone(),
            lead_status_hint: self.lead_status.clone(),
        }
    }
}

/// POST /webhooks/calls
pub async fn receive_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = Uuid::new_v4().to_string();

    match accept(&state, &headers, &body, &correlation_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "correlation_id": correlation_id })),
        )
            .into_response(),
        Err(e) => reject(&e, &correlation_id),
    }
}

async fn accept(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    correlation_id: &str,
) -> Result<()> {
    let payload = CallWebhook::parse(body)?;
    let tenant_id = payload.tenant_id.as_str();

    let tenant = state
        .db
        .get_tenant(tenant_id)
        .await?
        .ok_or_else(|| Error::UnknownTenant(tenant_id.to_string()))?;

    if let Some(sent) = header_str(headers, TIMESTAMP_HEADER) {
        signature::check_timestamp(sent, state.config.server.timestamp_tolerance_secs)?;
    }
    let provided = header_str(headers, SIGNATURE_HEADER).ok_or(Error::InvalidSignature)?;
    if !signature::verify(body, provided, &tenant.webhook_secret) {
        return Err(Error::InvalidSignature);
    }

    let office = state.resolver.resolve(&payload.company_id, tenant_id).await?;

    let (request, created) = state
        .db
        .upsert_request(&payload.to_new_request(tenant_id, &office.id, body))
        .await?;

    let mut event = WebhookEvent::new(
        tenant_id.to_string(),
        payload
            .event_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", payload.call_id, request.delivery_count)),
        payload.source.clone().unwrap_or_else(|| "call_provider".to_string()),
        payload.call_id.clone(),
        correlation_id.to_string(),
    );
    event.request_id = Some(request.id.clone());
    state.db.insert_webhook_event(&event).await?;

    info!(
        tenant_id,
        call_id = %payload.call_id,
        correlation_id,
        created,
        delivery_count = request.delivery_count,
        status = %request.status,
        "Webhook accepted"
    );

    let pipeline = state.pipeline.clone();
    let tenant_id = tenant_id.to_string();
    let request_id = request.id.clone();
    let event_id = event.id.clone();
    let correlation_id = correlation_id.to_string();
    state.tracker.spawn(async move {
        match pipeline.run_event(&tenant_id, &request_id, &event_id).await {
            Ok(status) => {
                debug!(%tenant_id, %request_id, %correlation_id, status = %status, "Pipeline finished")
            }
            Err(e) => {
                error!(%tenant_id, %request_id, %correlation_id, error = %e, "Pipeline error")
            }
        }
    });

    Ok(())
}

/// Map an intake failure to a bare status; details stay in the logs
fn reject(err: &Error, correlation_id: &str) -> Response {
    let status = match err.kind() {
        ErrorKind::Authentication => {
            warn!(target: "audit", correlation_id, reason = %err, "Webhook rejected");
            StatusCode::UNAUTHORIZED
        }
        ErrorKind::Parse => {
            warn!(correlation_id, error = %err, "Malformed webhook payload");
            StatusCode::BAD_REQUEST
        }
        _ => {
            error!(correlation_id, error = %err, "Webhook intake failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({ "status": "rejected", "correlation_id": correlation_id })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ids_accepted() {
        let payload = CallWebhook::parse(
            br#"{"call_id": 12345, "tenant_id": "t-1", "company_id": 987,
                 "customer_phone_number": "+15550100", "duration": 61}"#,
        )
        .unwrap();
        assert_eq!(payload.call_id, "12345");
        assert_eq!(payload.company_id, "987");
        assert_eq!(payload.caller_phone.as_deref(), Some("+15550100"));
    }

    #[test]
    fn test_malformed_payloads_are_parse_errors() {
        for body in [
            &b"not json"[..],
            br#"{"tenant_id": "t", "company_id": "c"}"#,
            br#"{"call_id": "", "tenant_id": "t", "company_id": "c"}"#,
            br#"{"call_id": "c1", "tenant_id": "t", "company_id": "c", "duration": -3}"#,
        ] {
            let err = CallWebhook::parse(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse);
        }
    }

    #[test]
    fn test_blank_recording_url_dropped() {
        let payload = CallWebhook::parse(
            br#"{"call_id": "c1", "tenant_id": "t", "company_id": "c", "recording_url": " "}"#,
        )
        .unwrap();
        assert!(payload.to_new_request("t", "o", b"{}").recording_url.is_none());
    }
}
