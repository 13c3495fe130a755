//! CRM integration administration

use crate::client::CallContext;
use crate::crm::{mapping, CrmDispatcher};
use crate::db::{CrmIntegration, Repository};
use crate::error::{Error, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Create or replace a tenant's integration for `provider`
pub async fn cmd_add_integration(
    db: &Repository,
    dispatcher: &CrmDispatcher,
    tenant_id: &str,
    provider: &str,
    settings: &str,
) -> Result<CrmIntegration> {
    db.get_tenant(tenant_id)
        .await?
        .ok_or_else(|| Error::UnknownTenant(tenant_id.to_string()))?;
    dispatcher.connector(provider)?;

    let settings: serde_json::Value = serde_json::from_str(settings)?;
    if !settings.is_object() {
        return Err(Error::Config("CRM settings must be a JSON object".to_string()));
    }
    // Reject a bad field map now rather than on the first sync
    mapping::field_map_from_settings(&settings)?;

    let integration = CrmIntegration::new(tenant_id.to_string(), provider.to_string(), settings);
    db.upsert_crm_integration(&integration).await?;
    info!(tenant_id, provider, "CRM integration saved");

    db.get_crm_integration(tenant_id, provider)
        .await?
        .ok_or_else(|| Error::UnknownCrmProvider(provider.to_string()))
}

/// Outcome of a connection check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub tenant_id: String,
    pub provider: String,
    pub status: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Check an integration's credentials and endpoint
pub async fn cmd_check_integration(
    db: &Repository,
    dispatcher: &CrmDispatcher,
    tenant_id: &str,
    provider: &str,
) -> Result<CheckResult> {
    let integration = db
        .get_crm_integration(tenant_id, provider)
        .await?
        .ok_or_else(|| Error::UnknownCrmProvider(provider.to_string()))?;

    let ctx = CallContext::new(CancellationToken::new());
    let outcome = dispatcher.check(&ctx, &integration).await;

    Ok(CheckResult {
        tenant_id: tenant_id.to_string(),
        provider: provider.to_string(),
        status: integration.status,
        ok: outcome.is_ok(),
        error: outcome.err().map(|e| e.to_string()),
    })
}

/// Print a connection check to console
pub fn print_check_result(result: &CheckResult) {
    if result.ok {
        println!("✓ {} connection OK ({})", result.provider, result.status);
    } else {
        println!("✗ {} connection failed ({})", result.provider, result.status);
        if let Some(error) = &result.error {
            println!("  {}", error);
        }
    }
}
