//! Custom error types for leadline

use std::fmt;
use thiserror::Error;

/// Pipeline stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Intake,
    Audio,
    Transcription,
    Analysis,
    CrmSync,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Audio => "audio",
            Stage::Transcription => "transcription",
            Stage::Analysis => "analysis",
            Stage::CrmSync => "crm_sync",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry classification for every failure that crosses an outbound boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad signature, inactive or mismatched tenant, upstream 401/403
    Authentication,
    /// Network failures, 5xx, 429
    Transient,
    /// Upstream resource exists but is not ready yet (e.g. recording)
    NotYetAvailable,
    /// Malformed model output or webhook payload
    Parse,
    /// Shutdown or deadline
    Cancelled,
    /// Anything retrying cannot fix
    Fatal,
}

/// Main error type for leadline operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Webhook timestamp outside the replay window")]
    StaleTimestamp,

    #[error("Tenant not found for company {0}")]
    TenantNotFound(String),

    #[error("Unknown tenant {0}")]
    UnknownTenant(String),

    #[error("Company {company_id} is not mapped to tenant {tenant_id}")]
    InvalidTenantMapping {
        company_id: String,
        tenant_id: String,
    },

    #[error("Office for company {0} is inactive")]
    OfficeInactive(String),

    #[error("Tenant {0} is inactive")]
    TenantInactive(String),

    #[error("Upstream rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error("Not yet available: {0}")]
    NotYetAvailable(String),

    #[error("Analysis parse error: {0}")]
    AnalysisParse(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid status transition for request {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: String,
        to: String,
    },

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Unknown CRM provider: {0}")]
    UnknownCrmProvider(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("{stage} stage failed for tenant {tenant_id}, request {request_id}: {source}")]
    Stage {
        stage: Stage,
        tenant_id: String,
        request_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Retry window exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl Error {
    /// Classify this error for retry purposes.
    ///
    /// This is the only place transient-vs-fatal is decided; the retrying
    /// client and the pipeline both consult it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSignature
            | Error::StaleTimestamp
            | Error::TenantNotFound(_)
            | Error::UnknownTenant(_)
            | Error::InvalidTenantMapping { .. }
            | Error::OfficeInactive(_)
            | Error::TenantInactive(_)
            | Error::Unauthorized(_) => ErrorKind::Authentication,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    ErrorKind::Transient
                } else if let Some(status) = e.status() {
                    classify_status(status.as_u16())
                } else {
                    ErrorKind::Fatal
                }
            }
            Error::Upstream { status, .. } => classify_status(*status),
            Error::NotYetAvailable(_) => ErrorKind::NotYetAvailable,
            Error::AnalysisParse(_) | Error::InvalidPayload(_) | Error::Json(_) => {
                ErrorKind::Parse
            }
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
            Error::RetriesExhausted { last, .. } => match last.kind() {
                ErrorKind::Authentication => ErrorKind::Authentication,
                _ => ErrorKind::Fatal,
            },
            Error::Stage { source, .. } => source.kind(),
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::NotYetAvailable
        )
    }

    /// Wrap this error with pipeline stage context
    pub fn in_stage(self, stage: Stage, tenant_id: &str, request_id: &str) -> Self {
        Error::Stage {
            stage,
            tenant_id: tenant_id.to_string(),
            request_id: request_id.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping stage and retry wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            Error::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Map an upstream HTTP status code to a retry class
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Authentication,
        408 | 425 | 429 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

/// Result type alias for leadline
pub type Result<T> = std::result::Result<T, Error>;
