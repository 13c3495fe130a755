//! CRM sync
//!
//! Each tenant configures zero or more CRM integrations. The dispatcher maps
//! the enriched request through the integration's field map, hands it to the
//! provider's connector, and records the outcome on the integration row.

mod hubspot;
pub mod mapping;
mod webhook;

pub use hubspot::HubSpotConnector;
pub use mapping::{FieldMap, FieldRule};
pub use webhook::WebhookConnector;

use crate::client::{CallContext, RetryingClient};
use crate::config::Config;
use crate::db::{CrmIntegration, IntegrationStatus, LeadRequest, Repository, SyncAttempt};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolved per-tenant connector settings
#[derive(Debug, Clone)]
pub struct CrmTarget {
    pub settings: Value,
    /// Secret resolved from the integration's `credential_ref`
    pub token: Option<String>,
}

impl CrmTarget {
    pub fn from_integration(integration: &CrmIntegration, config: &Config) -> Result<Self> {
        let settings = integration.config()?;
        let token = match settings.get("credential_ref").and_then(|v| v.as_str()) {
            Some(reference) => Some(config.resolve_credential(reference)?),
            None => None,
        };
        Ok(Self { settings, token })
    }
}

/// Provider-neutral contact record
#[derive(Debug, Clone, Default)]
pub struct ContactPayload {
    pub phone: Option<String>,
    pub properties: Map<String, Value>,
}

/// A CRM provider
#[async_trait]
pub trait CrmConnector: Send + Sync {
    /// Provider name integrations refer to
    fn provider(&self) -> &'static str;

    /// Cheap authenticated request proving the credentials work
    async fn validate_connection(&self, ctx: &CallContext, target: &CrmTarget) -> Result<()>;

    /// Upsert the contact and return the provider's record id
    async fn create_or_update_contact(
        &self,
        ctx: &CallContext,
        target: &CrmTarget,
        contact: &ContactPayload,
    ) -> Result<String>;
}

/// Field map used when an integration does not define one
pub fn default_field_map(provider: &str) -> FieldMap {
    let raw = match provider {
        hubspot::PROVIDER => json!({
            "phone": "caller_number",
            "firstname": "caller_name",
            "city": "city",
            "state": "state",
            "lead_score": "lead_score",
            "hs_lead_status": {
                "when": {"field": "lead_score", "op": "gte", "value": 70},
                "then": {"const": "OPEN"},
                "else": {"const": "NEW"}
            },
            "message": {"template": "{analysis.intent} ({duration_seconds}s call from {source})"}
        }),
        _ => json!({
            "call_id": "call_id",
            "phone": "caller_number",
            "name": "caller_name",
            "city": "city",
            "state": "state",
            "source": "source",
            "tags": "tags",
            "lead_score": "lead_score",
            "spam_likelihood": "spam_likelihood",
            "analysis": "analysis",
            "transcript": "transcript"
        }),
    };
    serde_json::from_value(raw).unwrap_or_default()
}

/// Result of one sync pass over a tenant's integrations
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Integrations eligible for this request (not disabled)
    pub eligible: usize,
    /// (provider, record id) pushed in this pass
    pub pushed: Vec<(String, String)>,
    /// Providers skipped because an earlier pass already pushed them
    pub already_synced: Vec<String>,
    pub failures: Vec<(String, Error)>,
}

impl SyncReport {
    /// Every eligible integration now holds a record for this request
    pub fn is_complete(&self) -> bool {
        self.eligible > 0 && self.failures.is_empty()
    }
}

/// Routes requests to connectors by provider name
pub struct CrmDispatcher {
    db: Repository,
    config: Arc<Config>,
    connectors: HashMap<String, Arc<dyn CrmConnector>>,
}

impl CrmDispatcher {
    pub fn new(db: Repository, config: Arc<Config>) -> Self {
        Self {
            db,
            config,
            connectors: HashMap::new(),
        }
    }

    /// Dispatcher with the built-in HubSpot and webhook connectors
    pub fn with_default_connectors(
        db: Repository,
        config: Arc<Config>,
        client: Arc<RetryingClient>,
    ) -> Self {
        let hubspot_url = config.crm.hubspot_base_url.clone();
        let mut dispatcher = Self::new(db, config);
        dispatcher.register(Arc::new(HubSpotConnector::new(client.clone(), hubspot_url)));
        dispatcher.register(Arc::new(WebhookConnector::new(client)));
        dispatcher
    }

    pub fn register(&mut self, connector: Arc<dyn CrmConnector>) {
        self.connectors
            .insert(connector.provider().to_string(), connector);
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn connector(&self, provider: &str) -> Result<Arc<dyn CrmConnector>> {
        self.connectors
            .get(provider)
            .cloned()
            .ok_or_else(|| Error::UnknownCrmProvider(provider.to_string()))
    }

    /// Map an enriched request into the contact shape for `integration`
    pub fn build_contact(integration: &CrmIntegration, request: &LeadRequest) -> Result<ContactPayload> {
        let settings = integration.config()?;
        let map = mapping::field_map_from_settings(&settings)?
            .unwrap_or_else(|| default_field_map(&integration.provider));
        let properties = mapping::apply(&map, &mapping::lead_fields(request));
        Ok(ContactPayload {
            phone: request.caller_number.clone(),
            properties,
        })
    }

    /// Check one integration's credentials and endpoint
    pub async fn check(&self, ctx: &CallContext, integration: &CrmIntegration) -> Result<()> {
        let connector = self.connector(&integration.provider)?;
        let target = CrmTarget::from_integration(integration, &self.config)?;
        connector.validate_connection(ctx, &target).await
    }

    /// Push a request to every eligible integration of its tenant
    pub async fn sync(&self, ctx: &CallContext, request: &LeadRequest) -> Result<SyncReport> {
        let tenant_id = request.tenant_id.as_str();
        let integrations = self.db.list_crm_integrations(tenant_id).await?;
        let existing = request.crm_records();
        let mut report = SyncReport::default();

        for integration in integrations {
            if integration.get_status()? == IntegrationStatus::Disabled {
                debug!(tenant_id, provider = %integration.provider, "Skipping disabled integration");
                continue;
            }
            report.eligible += 1;

            if existing.contains_key(&integration.provider) {
                report.already_synced.push(integration.provider.clone());
                continue;
            }

            match self.push(ctx, &integration, request).await {
                Ok(record_id) => {
                    self.db
                        .record_crm_record(tenant_id, &request.id, &integration.provider, &record_id)
                        .await?;
                    self.db
                        .record_crm_attempt(
                            tenant_id,
                            &integration.id,
                            SyncAttempt::Succeeded,
                            self.config.crm.degraded_threshold,
                        )
                        .await?;
                    info!(
                        tenant_id,
                        call_id = %request.call_id,
                        provider = %integration.provider,
                        record_id = %record_id,
                        "Lead synced"
                    );
                    report.pushed.push((integration.provider.clone(), record_id));
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::DeadlineExceeded) => return Err(Error::DeadlineExceeded),
                Err(e) => {
                    let message = e.to_string();
                    self.db
                        .record_crm_attempt(
                            tenant_id,
                            &integration.id,
                            SyncAttempt::Failed(&message),
                            self.config.crm.degraded_threshold,
                        )
                        .await?;
                    warn!(
                        tenant_id,
                        call_id = %request.call_id,
                        provider = %integration.provider,
                        error = %message,
                        "CRM sync failed"
                    );
                    report.failures.push((integration.provider.clone(), e));
                }
            }
        }

        Ok(report)
    }

    async fn push(
        &self,
        ctx: &CallContext,
        integration: &CrmIntegration,
        request: &LeadRequest,
    ) -> Result<String> {
        let connector = self.connector(&integration.provider)?;
        let target = CrmTarget::from_integration(integration, &self.config)?;
        let contact = Self::build_contact(integration, request)?;
        connector
            .create_or_update_contact(ctx, &target, &contact)
            .await
    }
}
