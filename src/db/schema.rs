//! SQLite schema definition

/// SQL schema for the system of record
pub const SCHEMA_SQL: &str = r#"
-- Tenants: isolated customer accounts (soft-deactivated, never deleted)
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    webhook_secret TEXT NOT NULL,
    config_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Offices: one call-provider account per office
CREATE TABLE IF NOT EXISTS offices (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    name TEXT,
    external_company_id TEXT NOT NULL,
    credential_ref TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    workflow_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(external_company_id, tenant_id)
);

-- Webhook events: one row per delivery, status only moves forward
CREATE TABLE IF NOT EXISTS webhook_events (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    event_id TEXT NOT NULL,
    source TEXT NOT NULL,
    call_id TEXT NOT NULL,
    request_id TEXT,
    status TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    received_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Requests: one lead-processing unit per (tenant, call)
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    office_id TEXT NOT NULL REFERENCES offices(id),
    call_id TEXT NOT NULL,
    status TEXT NOT NULL,
    raw_payload TEXT NOT NULL,
    caller_number TEXT,
    caller_name TEXT,
    city TEXT,
    state TEXT,
    duration_seconds INTEGER,
    source TEXT,
    recording_url TEXT,
    tags_json TEXT,
    lead_status_hint TEXT,
    transcript_text TEXT,
    transcription_json TEXT,
    analysis_json TEXT,
    lead_score INTEGER,
    spam_likelihood INTEGER,
    crm_records_json TEXT,
    failure_stage TEXT,
    last_error TEXT,
    needs_review INTEGER NOT NULL DEFAULT 0,
    delivery_count INTEGER NOT NULL DEFAULT 1,
    claimed_at TEXT,
    window_started_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(tenant_id, call_id)
);

-- Call recordings: pointer to durable audio plus transcription status
CREATE TABLE IF NOT EXISTS call_recordings (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    request_id TEXT NOT NULL REFERENCES requests(id),
    call_id TEXT NOT NULL,
    storage_locator TEXT NOT NULL,
    content_type TEXT,
    byte_size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    transcription_status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(tenant_id, call_id)
);

-- AI processing logs: append-only audit of every analysis invocation
CREATE TABLE IF NOT EXISTS ai_processing_logs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    request_id TEXT NOT NULL REFERENCES requests(id),
    processing_type TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    payload_json TEXT,
    created_at TEXT NOT NULL
);

-- CRM integrations: per-tenant connector configuration and sync health
CREATE TABLE IF NOT EXISTS crm_integrations (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    status TEXT NOT NULL,
    config_json TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_synced_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(tenant_id, provider)
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_offices_company ON offices(external_company_id);
CREATE INDEX IF NOT EXISTS idx_requests_tenant_status ON requests(tenant_id, status);
CREATE INDEX IF NOT EXISTS idx_events_tenant_call ON webhook_events(tenant_id, call_id);
CREATE INDEX IF NOT EXISTS idx_ai_logs_request ON ai_processing_logs(tenant_id, request_id);
"#;
