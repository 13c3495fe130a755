//! HubSpot contacts connector

use super::{ContactPayload, CrmConnector, CrmTarget};
use crate::client::{check_status, endpoint, CallContext, RetryingClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use url::Url;

pub const PROVIDER: &str = "hubspot";

#[derive(Debug, Deserialize)]
struct HubSpotObject {
    id: String,
}

/// Upserts contacts keyed by phone number
pub struct HubSpotConnector {
    client: Arc<RetryingClient>,
    default_base_url: String,
}

impl HubSpotConnector {
    pub fn new(client: Arc<RetryingClient>, default_base_url: impl Into<String>) -> Self {
        Self {
            client,
            default_base_url: default_base_url.into(),
        }
    }

    fn base_url(&self, target: &CrmTarget) -> Result<Url> {
        let raw = target
            .settings
            .get("base_url")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.default_base_url);
        Url::parse(raw).map_err(|e| Error::Config(format!("Invalid HubSpot URL: {}", e)))
    }

    fn token<'a>(&self, target: &'a CrmTarget) -> Result<&'a str> {
        target
            .token
            .as_deref()
            .ok_or_else(|| Error::Config("HubSpot integration has no credential_ref".to_string()))
    }
}

#[async_trait]
impl CrmConnector for HubSpotConnector {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn validate_connection(&self, ctx: &CallContext, target: &CrmTarget) -> Result<()> {
        let mut url = endpoint(&self.base_url(target)?, "crm/v3/objects/contacts")?;
        url.query_pairs_mut().append_pair("limit", "1");
        let token = self.token(target)?;

        let _: serde_json::Value = self
            .client
            .send_json(ctx, "hubspot.validate", || {
                self.client.http().get(url.clone()).bearer_auth(token)
            })
            .await?;
        Ok(())
    }

    async fn create_or_update_contact(
        &self,
        ctx: &CallContext,
        target: &CrmTarget,
        contact: &ContactPayload,
    ) -> Result<String> {
        let phone = contact
            .phone
            .as_deref()
            .ok_or_else(|| Error::InvalidPayload("HubSpot contact needs a phone number".to_string()))?;
        let base = self.base_url(target)?;
        let token = self.token(target)?;
        let body = json!({ "properties": contact.properties });

        let mut update_url = endpoint(&base, &format!("crm/v3/objects/contacts/{}", phone))?;
        update_url.query_pairs_mut().append_pair("idProperty", "phone");

        let updated: Option<HubSpotObject> = self
            .client
            .execute(ctx, "hubspot.update_contact", || {
                let request = self
                    .client
                    .http()
                    .patch(update_url.clone())
                    .bearer_auth(token)
                    .json(&body);
                async move {
                    let response = request.send().await?;
                    if response.status() == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    let response = check_status(response).await?;
                    Ok(Some(response.json::<HubSpotObject>().await?))
                }
            })
            .await?;

        if let Some(object) = updated {
            debug!(contact_id = %object.id, "Updated HubSpot contact");
            return Ok(object.id);
        }

        let create_url = endpoint(&base, "crm/v3/objects/contacts")?;
        let created: HubSpotObject = self
            .client
            .send_json(ctx, "hubspot.create_contact", || {
                self.client
                    .http()
                    .post(create_url.clone())
                    .bearer_auth(token)
                    .json(&body)
            })
            .await?;
        debug!(contact_id = %created.id, "Created HubSpot contact");
        Ok(created.id)
    }
}
