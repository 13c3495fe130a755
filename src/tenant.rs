//! Tenant resolution
//!
//! Maps a call-provider company id and a claimed tenant id to the Office that
//! owns the call. The repository's active-office lookup is the only gate;
//! the ownership lookup is consulted afterwards purely to name the failure.

use crate::db::{Office, Repository};
use crate::error::{Error, Result};
use tracing::debug;

/// Resolves inbound webhooks to offices
#[derive(Clone)]
pub struct TenantResolver {
    db: Repository,
}

impl TenantResolver {
    pub fn new(db: Repository) -> Self {
        Self { db }
    }

    /// Find the active Office for `company_id` within `tenant_id`.
    ///
    /// Fails with `TenantNotFound`, `InvalidTenantMapping`, `OfficeInactive`
    /// or `TenantInactive`; none of them are retryable.
    pub async fn resolve(&self, company_id: &str, tenant_id: &str) -> Result<Office> {
        if let Some(office) = self.db.find_active_office(company_id, tenant_id).await? {
            debug!(tenant_id, company_id, office_id = %office.id, "Resolved office");
            return Ok(office);
        }

        let owners = self.db.office_ownership(company_id).await?;
        if owners.is_empty() {
            return Err(Error::TenantNotFound(company_id.to_string()));
        }

        match owners.iter().find(|o| o.tenant_id == tenant_id) {
            None => Err(Error::InvalidTenantMapping {
                company_id: company_id.to_string(),
                tenant_id: tenant_id.to_string(),
            }),
            Some(owner) if !owner.tenant_active => {
                Err(Error::TenantInactive(tenant_id.to_string()))
            }
            Some(_) => Err(Error::OfficeInactive(company_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Tenant, TenantStatus};
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    async fn setup() -> (Repository, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Repository::new(&tmp.path().join("test.db")).await.unwrap();
        (db, tmp)
    }

    async fn tenant_with_office(db: &Repository, company: &str) -> (Tenant, Office) {
        let tenant = Tenant::new("Tenant".to_string(), "secret".to_string());
        db.insert_tenant(&tenant).await.unwrap();
        let office = Office::new(tenant.id.clone(), company.to_string(), "TOKEN".to_string());
        db.insert_office(&office).await.unwrap();
        (tenant, office)
    }

    #[tokio::test]
    async fn test_resolves_active_office() {
        let (db, _tmp) = setup().await;
        let (tenant, office) = tenant_with_office(&db, "co-1").await;
        let resolver = TenantResolver::new(db);

        let found = resolver.resolve("co-1", &tenant.id).await.unwrap();
        assert_eq!(found.id, office.id);
    }

    #[tokio::test]
    async fn test_failure_modes() {
        let (db, _tmp) = setup().await;
        let (t1, o1) = tenant_with_office(&db, "co-1").await;
        let (t2, _) = tenant_with_office(&db, "co-2").await;
        let resolver = TenantResolver::new(db.clone());

        let err = resolver.resolve("co-404", &t1.id).await.unwrap_err();
        assert!(matches!(err, Error::TenantNotFound(_)));

        let err = resolver.resolve("co-1", &t2.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTenantMapping { .. }));
        assert_eq!(err.kind(), ErrorKind::Authentication);

        db.set_office_active(&t1.id, &o1.id, false).await.unwrap();
        let err = resolver.resolve("co-1", &t1.id).await.unwrap_err();
        assert!(matches!(err, Error::OfficeInactive(_)));

        db.set_office_active(&t1.id, &o1.id, true).await.unwrap();
        db.set_tenant_status(&t1.id, TenantStatus::Inactive).await.unwrap();
        let err = resolver.resolve("co-1", &t1.id).await.unwrap_err();
        assert!(matches!(err, Error::TenantInactive(_)));
        assert!(!err.is_retryable());
    }
}
