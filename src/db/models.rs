//! Row types and status enums for the repository

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            _ => Err(Error::Config(format!("Unknown tenant status: {}", s))),
        }
    }
}

/// Request processing status.
///
/// Progression is strictly forward: received -> enriching -> analyzed -> synced,
/// with `failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Received,
    Enriching,
    Analyzed,
    Synced,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Received => "received",
            RequestStatus::Enriching => "enriching",
            RequestStatus::Analyzed => "analyzed",
            RequestStatus::Synced => "synced",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Synced | RequestStatus::Failed)
    }

    /// Whether `next` is a legal forward step from this status
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (Received, Enriching) | (Enriching, Analyzed) | (Analyzed, Synced) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Statuses from which `self` can be reached in one step
    pub fn predecessors(&self) -> &'static [RequestStatus] {
        use RequestStatus::*;
        match self {
            Received => &[],
            Enriching => &[Received],
            Analyzed => &[Enriching],
            Synced => &[Analyzed],
            Failed => &[Received, Enriching, Analyzed],
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "received" => Ok(RequestStatus::Received),
            "enriching" => Ok(RequestStatus::Enriching),
            "analyzed" => Ok(RequestStatus::Analyzed),
            "synced" => Ok(RequestStatus::Synced),
            "failed" => Ok(RequestStatus::Failed),
            _ => Err(Error::Config(format!("Unknown request status: {}", s))),
        }
    }
}

/// Webhook delivery processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Received,
    Processing,
    Completed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Received => "received",
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Completed => "completed",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn predecessors(&self) -> &'static [WebhookEventStatus] {
        use WebhookEventStatus::*;
        match self {
            Received => &[],
            Processing => &[Received],
            Completed | Failed => &[Received, Processing],
        }
    }
}

impl std::fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transcription status of a stored recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionStatus {
    Pending,
    Completed,
    Failed,
}

impl TranscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionStatus::Pending => "pending",
            TranscriptionStatus::Completed => "completed",
            TranscriptionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TranscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CRM integration health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Active,
    Degraded,
    Disabled,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Active => "active",
            IntegrationStatus::Degraded => "degraded",
            IntegrationStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(IntegrationStatus::Active),
            "degraded" => Ok(IntegrationStatus::Degraded),
            "disabled" => Ok(IntegrationStatus::Disabled),
            _ => Err(Error::Config(format!("Unknown integration status: {}", s))),
        }
    }
}

/// An isolated customer account
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub config_json: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Tenant {
    pub fn new(name: String, webhook_secret: String) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            status: TenantStatus::Active.to_string(),
            webhook_secret,
            config_json: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active.as_str()
    }
}

/// A tenant's business location, linked to one call-provider account
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Office {
    pub id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub external_company_id: String,
    pub credential_ref: String,
    pub active: bool,
    pub workflow_json: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Office {
    pub fn new(tenant_id: String, external_company_id: String, credential_ref: String) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            name: None,
            external_company_id,
            credential_ref,
            active: true,
            workflow_json: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Parsed workflow configuration (empty object when unset or malformed)
    pub fn workflow(&self) -> serde_json::Value {
        self.workflow_json
            .as_ref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

/// One inbound webhook delivery
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub tenant_id: String,
    pub event_id: String,
    pub source: String,
    pub call_id: String,
    pub request_id: Option<String>,
    pub status: String,
    pub correlation_id: String,
    pub received_at: String,
    pub updated_at: String,
}

impl WebhookEvent {
    pub fn new(
        tenant_id: String,
        event_id: String,
        source: String,
        call_id: String,
        correlation_id: String,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            event_id,
            source,
            call_id,
            request_id: None,
            status: WebhookEventStatus::Received.to_string(),
            correlation_id,
            received_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Normalized fields extracted from a webhook, used to create or refresh a request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRequest {
    pub tenant_id: String,
    pub office_id: String,
    pub call_id: String,
    pub raw_payload: String,
    pub caller_number: Option<String>,
    pub caller_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub duration_seconds: Option<i64>,
    pub source: Option<String>,
    pub recording_url: Option<String>,
    pub tags: Vec<String>,
    pub lead_status_hint: Option<String>,
}

/// The lead-processing unit for one call
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadRequest {
    pub id: String,
    pub tenant_id: String,
    pub office_id: String,
    pub call_id: String,
    pub status: String,
    pub raw_payload: String,
    pub caller_number: Option<String>,
    pub caller_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub duration_seconds: Option<i64>,
    pub source: Option<String>,
    pub recording_url: Option<String>,
    pub tags_json: Option<String>,
    pub lead_status_hint: Option<String>,
    pub transcript_text: Option<String>,
    pub transcription_json: Option<String>,
    pub analysis_json: Option<String>,
    pub lead_score: Option<i64>,
    pub spam_likelihood: Option<i64>,
    pub crm_records_json: Option<String>,
    pub failure_stage: Option<String>,
    pub last_error: Option<String>,
    pub needs_review: bool,
    pub delivery_count: i64,
    /// Set while a worker holds the request in `enriching`, or is syncing it from `analyzed`
    pub claimed_at: Option<String>,
    /// Start of the current retry window; reset when an operator reopens the request
    pub window_started_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl LeadRequest {
    pub fn get_status(&self) -> Result<RequestStatus> {
        self.status.parse()
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags_json
            .as_ref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }

    /// CRM provider -> external record id for pushes that already succeeded
    pub fn crm_records(&self) -> BTreeMap<String, String> {
        self.crm_records_json
            .as_ref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }

    pub fn window_started_at_utc(&self) -> Option<chrono::DateTime<Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.window_started_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Pointer to a stored recording
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CallRecording {
    pub id: String,
    pub tenant_id: String,
    pub request_id: String,
    pub call_id: String,
    pub storage_locator: String,
    pub content_type: Option<String>,
    pub byte_size: i64,
    pub content_hash: String,
    pub transcription_status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl CallRecording {
    pub fn new(
        tenant_id: String,
        request_id: String,
        call_id: String,
        storage_locator: String,
        content_type: Option<String>,
        bytes: &[u8],
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            request_id,
            call_id,
            storage_locator,
            content_type,
            byte_size: bytes.len() as i64,
            content_hash: blake3::hash(bytes).to_hex().to_string(),
            transcription_status: TranscriptionStatus::Pending.to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// One analysis invocation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AiProcessingLog {
    pub id: String,
    pub tenant_id: String,
    pub request_id: String,
    pub processing_type: String,
    pub status: String,
    pub attempt: i64,
    pub payload_json: Option<String>,
    pub created_at: String,
}

impl AiProcessingLog {
    pub fn new(
        tenant_id: &str,
        request_id: &str,
        processing_type: &str,
        status: &str,
        attempt: u32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            request_id: request_id.to_string(),
            processing_type: processing_type.to_string(),
            status: status.to_string(),
            attempt: attempt as i64,
            payload_json: Some(payload.to_string()),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// A tenant's CRM connector configuration and sync health
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CrmIntegration {
    pub id: String,
    pub tenant_id: String,
    pub provider: String,
    pub status: String,
    pub config_json: String,
    pub attempt_count: i64,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub last_synced_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CrmIntegration {
    pub fn new(tenant_id: String, provider: String, config: serde_json::Value) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            provider,
            status: IntegrationStatus::Active.to_string(),
            config_json: config.to_string(),
            attempt_count: 0,
            consecutive_failures: 0,
            last_error: None,
            last_synced_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn get_status(&self) -> Result<IntegrationStatus> {
        self.status.parse()
    }

    pub fn config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.config_json)?)
    }
}
