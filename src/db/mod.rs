//! System of record using SQLite
//!
//! This module handles all persistent state:
//! - Tenants and offices (the authorization gate for inbound webhooks)
//! - Webhook events (append-only, forward-only status)
//! - Requests (one per tenant + call, forward-only status)
//! - Call recordings, AI processing logs and CRM integrations
//!
//! Every tenant-owned table is read and written with the tenant id as a filter.

mod models;
mod schema;

pub use models::*;
pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ownership facts about a company id, used only to classify resolution failures
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OfficeOwnership {
    pub tenant_id: String,
    pub office_active: bool,
    pub tenant_active: bool,
}

/// Per-status request counts for one tenant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestStats {
    pub received: i64,
    pub enriching: i64,
    pub analyzed: i64,
    pub synced: i64,
    pub failed: i64,
    pub needs_review: i64,
}

/// Outcome of a single CRM sync attempt
#[derive(Debug, Clone)]
pub enum SyncAttempt<'a> {
    Succeeded,
    Failed(&'a str),
}

/// Repository handle
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Connect to the database configured in `config`
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file, config.database.max_connections).await
    }

    /// Open a database file directly, creating the schema if needed
    pub async fn new(db_path: &Path) -> Result<Self> {
        let db = Self::open(db_path, 5).await?;
        if !db.is_initialized().await? {
            db.init_schema().await?;
        }
        Ok(db)
    }

    async fn open(db_path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='requests'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    // ===== Tenant Operations =====

    /// Insert a new tenant
    pub async fn insert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, status, webhook_secret, config_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.status)
        .bind(&tenant.webhook_secret)
        .bind(&tenant.config_json)
        .bind(&tenant.created_at)
        .bind(&tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get tenant by ID
    pub async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }

    /// List all tenants
    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(tenants)
    }

    /// Soft status change; tenants are never deleted
    pub async fn set_tenant_status(&self, id: &str, status: TenantStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE tenants SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ===== Office Operations =====

    /// Insert a new office
    pub async fn insert_office(&self, office: &Office) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO offices (id, tenant_id, name, external_company_id, credential_ref, active, workflow_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&office.id)
        .bind(&office.tenant_id)
        .bind(&office.name)
        .bind(&office.external_company_id)
        .bind(&office.credential_ref)
        .bind(office.active)
        .bind(&office.workflow_json)
        .bind(&office.created_at)
        .bind(&office.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The authorization gate: the active office of an active tenant for a company id
    pub async fn find_active_office(
        &self,
        external_company_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Office>> {
        let office = sqlx::query_as::<_, Office>(
            r#"
            SELECT o.* FROM offices o
            JOIN tenants t ON t.id = o.tenant_id
            WHERE o.external_company_id = ? AND o.tenant_id = ?
              AND o.active = 1 AND t.status = 'active'
            "#,
        )
        .bind(external_company_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(office)
    }

    /// Who owns a company id, without exposing office data
    pub async fn office_ownership(&self, external_company_id: &str) -> Result<Vec<OfficeOwnership>> {
        let rows = sqlx::query_as::<_, OfficeOwnership>(
            r#"
            SELECT o.tenant_id AS tenant_id,
                   o.active AS office_active,
                   (t.status = 'active') AS tenant_active
            FROM offices o
            JOIN tenants t ON t.id = o.tenant_id
            WHERE o.external_company_id = ?
            "#,
        )
        .bind(external_company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Get an office within a tenant
    pub async fn get_office(&self, tenant_id: &str, office_id: &str) -> Result<Option<Office>> {
        let office =
            sqlx::query_as::<_, Office>("SELECT * FROM offices WHERE tenant_id = ? AND id = ?")
                .bind(tenant_id)
                .bind(office_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(office)
    }

    /// Toggle an office's active flag
    pub async fn set_office_active(
        &self,
        tenant_id: &str,
        office_id: &str,
        active: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE offices SET active = ?, updated_at = ? WHERE tenant_id = ? AND id = ?",
        )
        .bind(active)
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .bind(office_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ===== Webhook Event Operations =====

    /// Append a webhook delivery record
    pub async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (id, tenant_id, event_id, source, call_id, request_id, status, correlation_id, received_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.tenant_id)
        .bind(&event.event_id)
        .bind(&event.source)
        .bind(&event.call_id)
        .bind(&event.request_id)
        .bind(&event.status)
        .bind(&event.correlation_id)
        .bind(&event.received_at)
        .bind(&event.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a webhook event's status forward; returns false if it was not eligible
    pub async fn advance_webhook_event(
        &self,
        tenant_id: &str,
        id: &str,
        to: WebhookEventStatus,
        request_id: Option<&str>,
    ) -> Result<bool> {
        if to.predecessors().is_empty() {
            return Ok(false);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE webhook_events SET status = ");
        qb.push_bind(to.as_str())
            .push(", updated_at = ")
            .push_bind(Utc::now().to_rfc3339())
            .push(", request_id = COALESCE(")
            .push_bind(request_id)
            .push(", request_id) WHERE tenant_id = ")
            .push_bind(tenant_id)
            .push(" AND id = ")
            .push_bind(id)
            .push(" AND status IN (");
        let mut sep = qb.separated(", ");
        for from in to.predecessors() {
            sep.push_bind(from.as_str());
        }
        sep.push_unseparated(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Webhook deliveries for a call
    pub async fn list_webhook_events(
        &self,
        tenant_id: &str,
        call_id: &str,
    ) -> Result<Vec<WebhookEvent>> {
        let events = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM webhook_events WHERE tenant_id = ? AND call_id = ? ORDER BY received_at",
        )
        .bind(tenant_id)
        .bind(call_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    // ===== Request Operations =====

    /// Create the request for (tenant, call) or refresh it on redelivery.
    ///
    /// Returns the stored row and whether this call created it. Status and
    /// enrichment columns are never touched by a redelivery.
    pub async fn upsert_request(&self, new: &NewRequest) -> Result<(LeadRequest, bool)> {
        let now = Utc::now().to_rfc3339();
        let tags_json = serde_json::to_string(&new.tags)?;

        sqlx::query(
            r#"
            INSERT INTO requests (id, tenant_id, office_id, call_id, status, raw_payload, caller_number, caller_name,
                                  city, state, duration_seconds, source, recording_url, tags_json, lead_status_hint,
                                  needs_review, delivery_count, window_started_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 1, ?, ?, ?)
            ON CONFLICT(tenant_id, call_id) DO UPDATE SET
                raw_payload = excluded.raw_payload,
                caller_number = COALESCE(excluded.caller_number, requests.caller_number),
                caller_name = COALESCE(excluded.caller_name, requests.caller_name),
                city = COALESCE(excluded.city, requests.city),
                state = COALESCE(excluded.state, requests.state),
                duration_seconds = COALESCE(excluded.duration_seconds, requests.duration_seconds),
                recording_url = COALESCE(excluded.recording_url, requests.recording_url),
                delivery_count = requests.delivery_count + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&new.tenant_id)
        .bind(&new.office_id)
        .bind(&new.call_id)
        .bind(RequestStatus::Received.as_str())
        .bind(&new.raw_payload)
        .bind(&new.caller_number)
        .bind(&new.caller_name)
        .bind(&new.city)
        .bind(&new.state)
        .bind(new.duration_seconds)
        .bind(&new.source)
        .bind(&new.recording_url)
        .bind(tags_json)
        .bind(&new.lead_status_hint)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let request = self
            .get_request_by_call(&new.tenant_id, &new.call_id)
            .await?
            .ok_or_else(|| Error::RequestNotFound(new.call_id.clone()))?;
        let created = request.delivery_count == 1;
        Ok((request, created))
    }

    /// Get request by ID within a tenant
    pub async fn get_request(&self, tenant_id: &str, id: &str) -> Result<Option<LeadRequest>> {
        let request =
            sqlx::query_as::<_, LeadRequest>("SELECT * FROM requests WHERE tenant_id = ? AND id = ?")
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(request)
    }

    /// Get request by call ID within a tenant
    pub async fn get_request_by_call(
        &self,
        tenant_id: &str,
        call_id: &str,
    ) -> Result<Option<LeadRequest>> {
        let request = sqlx::query_as::<_, LeadRequest>(
            "SELECT * FROM requests WHERE tenant_id = ? AND call_id = ?",
        )
        .bind(tenant_id)
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(request)
    }

    /// Number of rows for a call (always 0 or 1)
    pub async fn count_requests_for_call(&self, tenant_id: &str, call_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE tenant_id = ? AND call_id = ?")
                .bind(tenant_id)
                .bind(call_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// List requests for a tenant, newest first
    pub async fn list_requests(
        &self,
        tenant_id: &str,
        status: Option<RequestStatus>,
        limit: i64,
    ) -> Result<Vec<LeadRequest>> {
        let requests = match status {
            Some(status) => {
                sqlx::query_as::<_, LeadRequest>(
                    "SELECT * FROM requests WHERE tenant_id = ? AND status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(tenant_id)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, LeadRequest>(
                    "SELECT * FROM requests WHERE tenant_id = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(tenant_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(requests)
    }

    /// Compare-and-set status step. Returns false if the row was not in a
    /// legal predecessor state (someone else advanced it, or it is terminal).
    pub async fn transition_request(
        &self,
        tenant_id: &str,
        id: &str,
        to: RequestStatus,
    ) -> Result<bool> {
        if to == RequestStatus::Failed {
            return Err(Error::InvalidTransition {
                request_id: id.to_string(),
                from: "*".to_string(),
                to: to.to_string(),
            });
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE requests SET status = ");
        qb.push_bind(to.as_str());
        if to == RequestStatus::Enriching {
            qb.push(", claimed_at = ").push_bind(claim_stamp(Utc::now()));
        } else {
            qb.push(", claimed_at = NULL");
        }
        qb.push(", updated_at = ")
            .push_bind(Utc::now().to_rfc3339())
            .push(" WHERE tenant_id = ")
            .push_bind(tenant_id)
            .push(" AND id = ")
            .push_bind(id);
        push_status_guard(&mut qb, to.predecessors());

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Take the processing lease on a request.
    ///
    /// Moves `from -> to` (or leaves the status alone when they are equal, as
    /// for a CRM sync from `analyzed`) and stamps `claimed_at`. A row already
    /// in `to` whose claim is older than `stale_after` is taken over. Returns
    /// the lease stamp, or None when another worker holds the request or it
    /// has moved on.
    pub async fn claim_request(
        &self,
        tenant_id: &str,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        stale_after: Duration,
    ) -> Result<Option<String>> {
        if (from != to && !from.can_transition_to(to)) || to.is_terminal() {
            return Err(Error::InvalidTransition {
                request_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let lease = claim_stamp(now);
        let result = sqlx::query(
            r#"
            UPDATE requests SET status = ?, claimed_at = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ?
              AND ((status = ? AND claimed_at IS NULL) OR (status = ? AND claimed_at < ?))
            "#,
        )
        .bind(to.as_str())
        .bind(&lease)
        .bind(now.to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(claim_stamp(now - stale_after))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(tenant_id, request_id = id, from = %from, to = %to, "Request claimed");
            Ok(Some(lease))
        } else {
            Ok(None)
        }
    }

    /// Give a lease back, returning the request to `back_to`.
    ///
    /// Only the holder of `lease` can release it; a request that has since
    /// advanced or been taken over is left alone.
    pub async fn release_claim(
        &self,
        tenant_id: &str,
        id: &str,
        lease: &str,
        back_to: RequestStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE requests SET status = ?, claimed_at = NULL, updated_at = ?
            WHERE tenant_id = ? AND id = ? AND claimed_at = ?
            "#,
        )
        .bind(back_to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .bind(lease)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Store normalized transcription output
    pub async fn save_transcription(
        &self,
        tenant_id: &str,
        id: &str,
        transcript_text: &str,
        transcription_json: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE requests SET transcript_text = ?, transcription_json = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ? AND status = 'enriching'
            "#,
        )
        .bind(transcript_text)
        .bind(transcription_json)
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store analysis results and advance enriching -> analyzed in one statement
    pub async fn complete_analysis(
        &self,
        tenant_id: &str,
        id: &str,
        analysis_json: &str,
        lead_score: i64,
        spam_likelihood: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE requests SET analysis_json = ?, lead_score = ?, spam_likelihood = ?,
                                status = 'analyzed', claimed_at = NULL, updated_at = ?
            WHERE tenant_id = ? AND id = ? AND status = 'enriching'
            "#,
        )
        .bind(analysis_json)
        .bind(lead_score)
        .bind(spam_likelihood)
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remember the external record id a CRM returned for this request
    pub async fn record_crm_record(
        &self,
        tenant_id: &str,
        id: &str,
        provider: &str,
        record_id: &str,
    ) -> Result<()> {
        let path = format!("$.\"{}\"", provider.replace('"', ""));
        sqlx::query(
            r#"
            UPDATE requests
            SET crm_records_json = json_set(COALESCE(crm_records_json, '{}'), ?, ?), updated_at = ?
            WHERE tenant_id = ? AND id = ?
            "#,
        )
        .bind(path)
        .bind(record_id)
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fail a non-terminal request, keeping the row for review
    pub async fn mark_request_failed(
        &self,
        tenant_id: &str,
        id: &str,
        stage: &str,
        error: &str,
        needs_review: bool,
    ) -> Result<bool> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE requests SET status = 'failed', claimed_at = NULL, failure_stage = ");
        qb.push_bind(stage)
            .push(", last_error = ")
            .push_bind(error)
            .push(", needs_review = ")
            .push_bind(needs_review)
            .push(", updated_at = ")
            .push_bind(Utc::now().to_rfc3339())
            .push(" WHERE tenant_id = ")
            .push_bind(tenant_id)
            .push(" AND id = ")
            .push_bind(id);
        push_status_guard(&mut qb, RequestStatus::Failed.predecessors());

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Operator action: put a failed request back in the pipeline.
    ///
    /// This is the only backward move the repository allows, and only from `failed`.
    /// A request that failed at CRM sync with its analysis stored resumes at
    /// `analyzed`; anything else starts over at `received`. The retry window
    /// starts over; `created_at` keeps the original arrival time.
    pub async fn reopen_failed_request(&self, tenant_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE requests SET status = CASE
                                    WHEN failure_stage = 'crm_sync' AND analysis_json IS NOT NULL
                                    THEN 'analyzed' ELSE 'received'
                                END,
                                failure_stage = NULL, last_error = NULL, claimed_at = NULL,
                                needs_review = 0, window_started_at = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ? AND status = 'failed'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            warn!(tenant_id, request_id = id, "Failed request reopened by operator");
        }
        Ok(result.rows_affected() == 1)
    }

    /// Per-status counts for a tenant
    pub async fn request_stats(&self, tenant_id: &str) -> Result<RequestStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM requests WHERE tenant_id = ? GROUP BY status",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = RequestStats::default();
        for (status, count) in rows {
            match status.parse::<RequestStatus>() {
                Ok(RequestStatus::Received) => stats.received = count,
                Ok(RequestStatus::Enriching) => stats.enriching = count,
                Ok(RequestStatus::Analyzed) => stats.analyzed = count,
                Ok(RequestStatus::Synced) => stats.synced = count,
                Ok(RequestStatus::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }

        stats.needs_review = sqlx::query_scalar(
            "SELECT COUNT(*) FROM requests WHERE tenant_id = ? AND needs_review = 1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    // ===== Recording Operations =====

    /// Insert or refresh the recording pointer for a call
    pub async fn upsert_recording(&self, recording: &CallRecording) -> Result<CallRecording> {
        sqlx::query(
            r#"
            INSERT INTO call_recordings (id, tenant_id, request_id, call_id, storage_locator, content_type,
                                         byte_size, content_hash, transcription_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, call_id) DO UPDATE SET
                storage_locator = excluded.storage_locator,
                content_type = excluded.content_type,
                byte_size = excluded.byte_size,
                content_hash = excluded.content_hash,
                transcription_status = excluded.transcription_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&recording.id)
        .bind(&recording.tenant_id)
        .bind(&recording.request_id)
        .bind(&recording.call_id)
        .bind(&recording.storage_locator)
        .bind(&recording.content_type)
        .bind(recording.byte_size)
        .bind(&recording.content_hash)
        .bind(&recording.transcription_status)
        .bind(&recording.created_at)
        .bind(&recording.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_recording(&recording.tenant_id, &recording.call_id)
            .await?
            .ok_or_else(|| Error::Other(format!("recording for {} vanished", recording.call_id)))
    }

    /// Get the recording pointer for a call
    pub async fn get_recording(
        &self,
        tenant_id: &str,
        call_id: &str,
    ) -> Result<Option<CallRecording>> {
        let recording = sqlx::query_as::<_, CallRecording>(
            "SELECT * FROM call_recordings WHERE tenant_id = ? AND call_id = ?",
        )
        .bind(tenant_id)
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(recording)
    }

    /// Narrow status update for a recording
    pub async fn set_transcription_status(
        &self,
        tenant_id: &str,
        id: &str,
        status: TranscriptionStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE call_recordings SET transcription_status = ?, updated_at = ? WHERE tenant_id = ? AND id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ===== AI Log Operations =====

    /// Append an analysis audit row
    pub async fn insert_ai_log(&self, log: &AiProcessingLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_processing_logs (id, tenant_id, request_id, processing_type, status, attempt, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.tenant_id)
        .bind(&log.request_id)
        .bind(&log.processing_type)
        .bind(&log.status)
        .bind(log.attempt)
        .bind(&log.payload_json)
        .bind(&log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Analysis audit rows for a request, oldest first
    pub async fn list_ai_logs(&self, tenant_id: &str, request_id: &str) -> Result<Vec<AiProcessingLog>> {
        let logs = sqlx::query_as::<_, AiProcessingLog>(
            "SELECT * FROM ai_processing_logs WHERE tenant_id = ? AND request_id = ? ORDER BY created_at, attempt",
        )
        .bind(tenant_id)
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    // ===== CRM Integration Operations =====

    /// Insert or reconfigure a tenant's integration for a provider
    pub async fn upsert_crm_integration(&self, integration: &CrmIntegration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crm_integrations (id, tenant_id, provider, status, config_json, attempt_count,
                                          consecutive_failures, last_error, last_synced_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, provider) DO UPDATE SET
                config_json = excluded.config_json,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&integration.id)
        .bind(&integration.tenant_id)
        .bind(&integration.provider)
        .bind(&integration.status)
        .bind(&integration.config_json)
        .bind(integration.attempt_count)
        .bind(integration.consecutive_failures)
        .bind(&integration.last_error)
        .bind(&integration.last_synced_at)
        .bind(&integration.created_at)
        .bind(&integration.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Integrations for a tenant
    pub async fn list_crm_integrations(&self, tenant_id: &str) -> Result<Vec<CrmIntegration>> {
        let integrations = sqlx::query_as::<_, CrmIntegration>(
            "SELECT * FROM crm_integrations WHERE tenant_id = ? ORDER BY provider",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(integrations)
    }

    /// One integration by provider
    pub async fn get_crm_integration(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> Result<Option<CrmIntegration>> {
        let integration = sqlx::query_as::<_, CrmIntegration>(
            "SELECT * FROM crm_integrations WHERE tenant_id = ? AND provider = ?",
        )
        .bind(tenant_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(integration)
    }

    /// Narrow sync bookkeeping update.
    ///
    /// Failures bump the consecutive counter and flip the integration to
    /// `degraded` once it reaches `degraded_threshold`; a success resets it.
    pub async fn record_crm_attempt(
        &self,
        tenant_id: &str,
        id: &str,
        attempt: SyncAttempt<'_>,
        degraded_threshold: u32,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        match attempt {
            SyncAttempt::Succeeded => {
                sqlx::query(
                    r#"
                    UPDATE crm_integrations
                    SET attempt_count = attempt_count + 1, consecutive_failures = 0,
                        last_error = NULL, last_synced_at = ?,
                        status = CASE WHEN status = 'disabled' THEN status ELSE 'active' END,
                        updated_at = ?
                    WHERE tenant_id = ? AND id = ?
                    "#,
                )
                .bind(&now)
                .bind(&now)
                .bind(tenant_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            SyncAttempt::Failed(error) => {
                sqlx::query(
                    r#"
                    UPDATE crm_integrations
                    SET attempt_count = attempt_count + 1,
                        consecutive_failures = consecutive_failures + 1,
                        last_error = ?,
                        status = CASE
                            WHEN status = 'active' AND consecutive_failures + 1 >= ? THEN 'degraded'
                            ELSE status
                        END,
                        updated_at = ?
                    WHERE tenant_id = ? AND id = ?
                    "#,
                )
                .bind(error)
                .bind(degraded_threshold as i64)
                .bind(&now)
                .bind(tenant_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

/// Fixed-width UTC stamp so claim ages compare correctly as text
fn claim_stamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn push_status_guard(qb: &mut QueryBuilder<'_, Sqlite>, allowed: &[RequestStatus]) {
    if allowed.is_empty() {
        qb.push(" AND 0");
        return;
    }
    qb.push(" AND status IN (");
    let mut sep = qb.separated(", ");
    for status in allowed {
        sep.push_bind(status.as_str());
    }
    sep.push_unseparated(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Repository, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));

        let db = Repository::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        (db, tmp)
    }

    async fn seed_office(db: &Repository, company: &str) -> (Tenant, Office) {
        let tenant = Tenant::new("Acme Plumbing".to_string(), "s3cret".to_string());
        db.insert_tenant(&tenant).await.unwrap();
        let office = Office::new(tenant.id.clone(), company.to_string(), "ACME_TOKEN".to_string());
        db.insert_office(&office).await.unwrap();
        (tenant, office)
    }

    fn new_request(tenant: &Tenant, office: &Office, call_id: &str) -> NewRequest {
        NewRequest {
            tenant_id: tenant.id.clone(),
            office_id: office.id.clone(),
            call_id: call_id.to_string(),
            raw_payload: "{}".to_string(),
            caller_number: Some("+15550100".to_string()),
            duration_seconds: Some(120),
            tags: vec!["google-ads".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_request_is_idempotent() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;

        let (first, created) = db.upsert_request(&new_request(&tenant, &office, "C1")).await.unwrap();
        assert!(created);

        let mut again = new_request(&tenant, &office, "C1");
        again.raw_payload = r#"{"retry":true}"#.to_string();
        again.caller_number = None;
        let (second, created) = db.upsert_request(&again).await.unwrap();

        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.raw_payload, r#"{"retry":true}"#);
        assert_eq!(second.caller_number.as_deref(), Some("+15550100"));
        assert_eq!(db.count_requests_for_call(&tenant.id, "C1").await.unwrap(), 1);
        assert_eq!(second.tags(), vec!["google-ads".to_string()]);
    }

    #[tokio::test]
    async fn test_requests_are_tenant_scoped() {
        let (db, _tmp) = setup_test_db().await;
        let (t1, o1) = seed_office(&db, "co-1").await;
        let (t2, o2) = seed_office(&db, "co-2").await;

        let (r1, _) = db.upsert_request(&new_request(&t1, &o1, "C1")).await.unwrap();
        let (r2, _) = db.upsert_request(&new_request(&t2, &o2, "C1")).await.unwrap();
        assert_ne!(r1.id, r2.id);

        assert!(db.get_request(&t2.id, &r1.id).await.unwrap().is_none());
        assert!(!db
            .transition_request(&t2.id, &r1.id, RequestStatus::Enriching)
            .await
            .unwrap());
        assert_eq!(db.list_requests(&t1.id, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_transitions_are_forward_only() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;
        let (req, _) = db.upsert_request(&new_request(&tenant, &office, "C1")).await.unwrap();

        assert!(!db
            .transition_request(&tenant.id, &req.id, RequestStatus::Analyzed)
            .await
            .unwrap());
        assert!(db
            .transition_request(&tenant.id, &req.id, RequestStatus::Enriching)
            .await
            .unwrap());
        // A second claimant loses the race
        assert!(!db
            .transition_request(&tenant.id, &req.id, RequestStatus::Enriching)
            .await
            .unwrap());

        assert!(db
            .complete_analysis(&tenant.id, &req.id, "{}", 87, 3)
            .await
            .unwrap());
        assert!(db
            .transition_request(&tenant.id, &req.id, RequestStatus::Synced)
            .await
            .unwrap());
        assert!(!db
            .mark_request_failed(&tenant.id, &req.id, "crm_sync", "boom", false)
            .await
            .unwrap());

        let stored = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        assert_eq!(stored.get_status().unwrap(), RequestStatus::Synced);
        assert_eq!(stored.lead_score, Some(87));
    }

    #[tokio::test]
    async fn test_failed_request_can_be_reopened() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;
        let (req, _) = db.upsert_request(&new_request(&tenant, &office, "C1")).await.unwrap();

        assert!(!db.reopen_failed_request(&tenant.id, &req.id).await.unwrap());
        assert!(db
            .mark_request_failed(&tenant.id, &req.id, "audio", "gone", true)
            .await
            .unwrap());

        let failed = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        assert!(failed.needs_review);
        assert_eq!(failed.failure_stage.as_deref(), Some("audio"));
        assert_eq!(db.request_stats(&tenant.id).await.unwrap().needs_review, 1);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(db.reopen_failed_request(&tenant.id, &req.id).await.unwrap());
        let reopened = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        assert_eq!(reopened.get_status().unwrap(), RequestStatus::Received);
        assert!(!reopened.needs_review);
        // Arrival time is kept; only the retry window restarts
        assert_eq!(reopened.created_at, req.created_at);
        assert!(reopened.window_started_at_utc().unwrap() > req.window_started_at_utc().unwrap());
    }

    #[tokio::test]
    async fn test_crm_failure_reopens_at_analyzed() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;
        let (req, _) = db.upsert_request(&new_request(&tenant, &office, "C1")).await.unwrap();

        assert!(db
            .transition_request(&tenant.id, &req.id, RequestStatus::Enriching)
            .await
            .unwrap());
        assert!(db
            .complete_analysis(&tenant.id, &req.id, "{}", 50, 3)
            .await
            .unwrap());
        assert!(db
            .mark_request_failed(&tenant.id, &req.id, "crm_sync", "down", true)
            .await
            .unwrap());

        assert!(db.reopen_failed_request(&tenant.id, &req.id).await.unwrap());
        let reopened = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        assert_eq!(reopened.get_status().unwrap(), RequestStatus::Analyzed);
        assert_eq!(reopened.lead_score, Some(50));
    }

    #[tokio::test]
    async fn test_active_office_gate() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;

        assert!(db.find_active_office("co-1", &tenant.id).await.unwrap().is_some());

        db.set_office_active(&tenant.id, &office.id, false).await.unwrap();
        assert!(db.find_active_office("co-1", &tenant.id).await.unwrap().is_none());
        let owners = db.office_ownership("co-1").await.unwrap();
        assert_eq!(owners.len(), 1);
        assert!(!owners[0].office_active);
        assert!(owners[0].tenant_active);

        db.set_office_active(&tenant.id, &office.id, true).await.unwrap();
        db.set_tenant_status(&tenant.id, TenantStatus::Inactive).await.unwrap();
        assert!(db.find_active_office("co-1", &tenant.id).await.unwrap().is_none());
        assert!(!db.office_ownership("co-1").await.unwrap()[0].tenant_active);
    }

    #[tokio::test]
    async fn test_webhook_event_status_moves_forward() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, _office) = seed_office(&db, "co-1").await;
        let event = WebhookEvent::new(
            tenant.id.clone(),
            "evt-1".to_string(),
            "calltracking".to_string(),
            "C1".to_string(),
            "corr-1".to_string(),
        );
        db.insert_webhook_event(&event).await.unwrap();

        assert!(db
            .advance_webhook_event(&tenant.id, &event.id, WebhookEventStatus::Completed, None)
            .await
            .unwrap());
        assert!(!db
            .advance_webhook_event(&tenant.id, &event.id, WebhookEventStatus::Processing, None)
            .await
            .unwrap());

        let events = db.list_webhook_events(&tenant.id, "C1").await.unwrap();
        assert_eq!(events[0].status, "completed");
    }

    #[tokio::test]
    async fn test_crm_attempts_degrade_after_threshold() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, _office) = seed_office(&db, "co-1").await;
        let integration = CrmIntegration::new(
            tenant.id.clone(),
            "webhook".to_string(),
            serde_json::json!({"url": "http://localhost"}),
        );
        db.upsert_crm_integration(&integration).await.unwrap();

        for _ in 0..2 {
            db.record_crm_attempt(&tenant.id, &integration.id, SyncAttempt::Failed("503"), 3)
                .await
                .unwrap();
        }
        let stored = db.get_crm_integration(&tenant.id, "webhook").await.unwrap().unwrap();
        assert_eq!(stored.get_status().unwrap(), IntegrationStatus::Active);

        db.record_crm_attempt(&tenant.id, &integration.id, SyncAttempt::Failed("503"), 3)
            .await
            .unwrap();
        let stored = db.get_crm_integration(&tenant.id, "webhook").await.unwrap().unwrap();
        assert_eq!(stored.get_status().unwrap(), IntegrationStatus::Degraded);
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("503"));

        db.record_crm_attempt(&tenant.id, &integration.id, SyncAttempt::Succeeded, 3)
            .await
            .unwrap();
        let stored = db.get_crm_integration(&tenant.id, "webhook").await.unwrap().unwrap();
        assert_eq!(stored.get_status().unwrap(), IntegrationStatus::Active);
        assert_eq!(stored.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_crm_record_ids_accumulate() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;
        let (req, _) = db.upsert_request(&new_request(&tenant, &office, "C1")).await.unwrap();

        db.record_crm_record(&tenant.id, &req.id, "hubspot", "501").await.unwrap();
        db.record_crm_record(&tenant.id, &req.id, "webhook", "abc").await.unwrap();

        let stored = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        let records = stored.crm_records();
        assert_eq!(records.get("hubspot").map(String::as_str), Some("501"));
        assert_eq!(records.get("webhook").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_until_stale() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;
        let (req, _) = db.upsert_request(&new_request(&tenant, &office, "C1")).await.unwrap();
        let timeout = Duration::seconds(60);

        let lease = db
            .claim_request(&tenant.id, &req.id, RequestStatus::Received, RequestStatus::Enriching, timeout)
            .await
            .unwrap()
            .unwrap();
        assert!(db
            .claim_request(&tenant.id, &req.id, RequestStatus::Received, RequestStatus::Enriching, timeout)
            .await
            .unwrap()
            .is_none());

        // A zero timeout treats the held claim as abandoned
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let taken = db
            .claim_request(
                &tenant.id,
                &req.id,
                RequestStatus::Received,
                RequestStatus::Enriching,
                Duration::zero(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_ne!(taken, lease);

        // The superseded holder cannot release the new claim
        assert!(!db
            .release_claim(&tenant.id, &req.id, &lease, RequestStatus::Received)
            .await
            .unwrap());
        assert!(db
            .release_claim(&tenant.id, &req.id, &taken, RequestStatus::Received)
            .await
            .unwrap());
        let released = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        assert_eq!(released.get_status().unwrap(), RequestStatus::Received);
        assert!(released.claimed_at.is_none());

        assert!(matches!(
            db.claim_request(&tenant.id, &req.id, RequestStatus::Received, RequestStatus::Synced, timeout)
                .await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_claim_keeps_status() {
        let (db, _tmp) = setup_test_db().await;
        let (tenant, office) = seed_office(&db, "co-1").await;
        let (req, _) = db.upsert_request(&new_request(&tenant, &office, "C1")).await.unwrap();
        let timeout = Duration::seconds(60);

        db.transition_request(&tenant.id, &req.id, RequestStatus::Enriching)
            .await
            .unwrap();
        db.complete_analysis(&tenant.id, &req.id, "{}", 70, 2).await.unwrap();
        let analyzed = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        assert!(analyzed.claimed_at.is_none());

        let lease = db
            .claim_request(&tenant.id, &req.id, RequestStatus::Analyzed, RequestStatus::Analyzed, timeout)
            .await
            .unwrap()
            .unwrap();
        assert!(db
            .claim_request(&tenant.id, &req.id, RequestStatus::Analyzed, RequestStatus::Analyzed, timeout)
            .await
            .unwrap()
            .is_none());

        assert!(db
            .transition_request(&tenant.id, &req.id, RequestStatus::Synced)
            .await
            .unwrap());
        let synced = db.get_request(&tenant.id, &req.id).await.unwrap().unwrap();
        assert!(synced.claimed_at.is_none());
        // Nothing left to release once the request moved on
        assert!(!db
            .release_claim(&tenant.id, &req.id, &lease, RequestStatus::Analyzed)
            .await
            .unwrap());
        assert_eq!(
            db.get_request(&tenant.id, &req.id).await.unwrap().unwrap().get_status().unwrap(),
            RequestStatus::Synced
        );
    }
}
