//! Tenant and office administration

use crate::db::{Office, Repository, Tenant, TenantStatus};
use crate::error::{Error, Result};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Tenant with its webhook secret, shown once at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenantInfo {
    pub id: String,
    pub name: String,
    pub webhook_secret: String,
}

/// Create a tenant; a secret is generated unless one is supplied
pub async fn cmd_add_tenant(
    db: &Repository,
    name: &str,
    secret: Option<String>,
) -> Result<NewTenantInfo> {
    let secret = match secret {
        Some(s) if s.trim().is_empty() => {
            return Err(Error::Config("Webhook secret cannot be empty".to_string()))
        }
        Some(s) => s,
        None => format!("whsec_{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
    };

    let tenant = Tenant::new(name.to_string(), secret);
    db.insert_tenant(&tenant).await?;
    info!(tenant_id = %tenant.id, "Tenant created");

    Ok(NewTenantInfo {
        id: tenant.id,
        name: tenant.name,
        webhook_secret: tenant.webhook_secret,
    })
}

pub async fn cmd_list_tenants(db: &Repository) -> Result<Vec<Tenant>> {
    db.list_tenants().await
}

/// Soft-deactivate a tenant; its webhooks are rejected from then on
pub async fn cmd_deactivate_tenant(db: &Repository, tenant_id: &str) -> Result<Tenant> {
    if !db.set_tenant_status(tenant_id, TenantStatus::Inactive).await? {
        return Err(Error::UnknownTenant(tenant_id.to_string()));
    }
    db.get_tenant(tenant_id)
        .await?
        .ok_or_else(|| Error::UnknownTenant(tenant_id.to_string()))
}

/// Office registration options
#[derive(Debug, Clone, Default)]
pub struct OfficeOptions {
    pub name: Option<String>,
    pub credential_ref: String,
    /// Workflow configuration as a JSON object
    pub workflow: Option<String>,
}

/// Link a call-provider company to a tenant
pub async fn cmd_add_office(
    db: &Repository,
    tenant_id: &str,
    company_id: &str,
    options: OfficeOptions,
) -> Result<Office> {
    db.get_tenant(tenant_id)
        .await?
        .ok_or_else(|| Error::UnknownTenant(tenant_id.to_string()))?;

    let workflow_json = match options.workflow {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            if !value.is_object() {
                return Err(Error::Config("Office workflow must be a JSON object".to_string()));
            }
            Some(value.to_string())
        }
        None => None,
    };

    let mut office = Office::new(
        tenant_id.to_string(),
        company_id.to_string(),
        options.credential_ref,
    );
    office.name = options.name;
    office.workflow_json = workflow_json;
    db.insert_office(&office).await?;
    info!(tenant_id, company_id, office_id = %office.id, "Office registered");
    Ok(office)
}

/// Print tenants to console
pub fn print_tenants(tenants: &[Tenant]) {
    println!("\n🏢 Tenants\n");

    if tenants.is_empty() {
        println!("No tenants yet. Use 'leadline tenant add' to create one.");
        return;
    }

    for tenant in tenants {
        let marker = if tenant.is_active() { "•" } else { "✗" };
        println!("{} {} [{}]", marker, tenant.name, tenant.status);
        println!("  ID: {}", tenant.id);
        println!("  Created: {}", tenant.created_at);
        println!();
    }
}

/// Print tenant IDs with descriptions for shell completions
pub fn print_tenant_completions(tenants: &[Tenant], shell: Shell) {
    for tenant in tenants {
        let description = format!("{} ({})", tenant.name, tenant.status).replace('\n', " ");
        match shell {
            Shell::Zsh => println!("{}:{}", tenant.id, description.replace(':', "\\:")),
            Shell::Fish => println!("{}\t{}", tenant.id, description.replace('\t', " ")),
            _ => println!("{}", tenant.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (Repository, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Repository::new(&tmp.path().join("test.db")).await.unwrap();
        (db, tmp)
    }

    #[tokio::test]
    async fn test_add_tenant_generates_secret() {
        let (db, _tmp) = setup().await;
        let created = cmd_add_tenant(&db, "Acme", None).await.unwrap();
        assert!(created.webhook_secret.starts_with("whsec_"));
        assert!(created.webhook_secret.len() > 40);

        let stored = db.get_tenant(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.webhook_secret, created.webhook_secret);
        assert!(cmd_add_tenant(&db, "Blank", Some("  ".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn test_deactivate_unknown_tenant_fails() {
        let (db, _tmp) = setup().await;
        let err = cmd_deactivate_tenant(&db, "nope").await.unwrap_err();
        assert!(matches!(err, Error::UnknownTenant(_)));

        let created = cmd_add_tenant(&db, "Acme", None).await.unwrap();
        let tenant = cmd_deactivate_tenant(&db, &created.id).await.unwrap();
        assert!(!tenant.is_active());
    }

    #[tokio::test]
    async fn test_add_office_validates_workflow() {
        let (db, _tmp) = setup().await;
        let tenant = cmd_add_tenant(&db, "Acme", None).await.unwrap();

        let options = OfficeOptions {
            credential_ref: "ACME_TOKEN".to_string(),
            workflow: Some("[1, 2]".to_string()),
            ..Default::default()
        };
        assert!(cmd_add_office(&db, &tenant.id, "co-1", options).await.is_err());

        let options = OfficeOptions {
            credential_ref: "ACME_TOKEN".to_string(),
            workflow: Some(r#"{"scoring_guidance": "Emergencies score 90+"}"#.to_string()),
            ..Default::default()
        };
        let office = cmd_add_office(&db, &tenant.id, "co-1", options).await.unwrap();
        assert_eq!(office.workflow()["scoring_guidance"], "Emergencies score 90+");
        assert!(db.find_active_office("co-1", &tenant.id).await.unwrap().is_some());
    }
}
