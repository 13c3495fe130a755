//! Generic JSON webhook connector
//!
//! Settings: `url` (required), `health_url` (optional, defaults to `url`).
//! When the integration has a credential, the body is signed the same way
//! inbound deliveries are (`X-Signature: sha256=<hex>`).

use super::{ContactPayload, CrmConnector, CrmTarget};
use crate::client::{CallContext, RetryingClient};
use crate::error::{Error, Result};
use crate::signature;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

pub const PROVIDER: &str = "webhook";

#[derive(Debug, Deserialize)]
struct WebhookReceipt {
    id: Value,
}

pub struct WebhookConnector {
    client: Arc<RetryingClient>,
}

impl WebhookConnector {
    pub fn new(client: Arc<RetryingClient>) -> Self {
        Self { client }
    }

    fn setting_url(target: &CrmTarget, key: &str) -> Result<Option<Url>> {
        match target.settings.get(key).and_then(|v| v.as_str()) {
            Some(raw) => Url::parse(raw)
                .map(Some)
                .map_err(|e| Error::Config(format!("Invalid webhook {}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn url(target: &CrmTarget) -> Result<Url> {
        Self::setting_url(target, "url")?
            .ok_or_else(|| Error::Config("Webhook integration needs a url".to_string()))
    }
}

#[async_trait]
impl CrmConnector for WebhookConnector {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn validate_connection(&self, ctx: &CallContext, target: &CrmTarget) -> Result<()> {
        let url = match Self::setting_url(target, "health_url")? {
            Some(url) => url,
            None => Self::url(target)?,
        };
        self.client
            .execute(ctx, "webhook.validate", || {
                let request = self.client.http().get(url.clone());
                async move {
                    crate::client::check_status(request.send().await?).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn create_or_update_contact(
        &self,
        ctx: &CallContext,
        target: &CrmTarget,
        contact: &ContactPayload,
    ) -> Result<String> {
        let url = Self::url(target)?;
        let body = serde_json::to_vec(&json!({
            "event": "lead.enriched",
            "phone": contact.phone,
            "contact": contact.properties,
        }))?;
        let signature = match &target.token {
            Some(secret) => Some(signature::sign(&body, secret)?),
            None => None,
        };

        let receipt: WebhookReceipt = self
            .client
            .send_json(ctx, "webhook.push", || {
                let request = self
                    .client
                    .http()
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone());
                match &signature {
                    Some(sig) => request.header("X-Signature", sig.as_str()),
                    None => request,
                }
            })
            .await?;

        match receipt.id {
            Value::String(id) if !id.is_empty() => Ok(id),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(Error::InvalidPayload(format!(
                "Webhook receiver returned unusable id: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RetryPolicy, TokenBucket};
    use serde_json::Map;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector() -> WebhookConnector {
        WebhookConnector::new(Arc::new(RetryingClient::new(
            "crm",
            reqwest::Client::new(),
            Arc::new(TokenBucket::new("services", 10)),
            2,
            RetryPolicy::default(),
        )))
    }

    #[tokio::test]
    async fn test_push_returns_receiver_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/leads"))
            .and(header_exists("x-signature"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
            .expect(1)
            .mount(&server)
            .await;

        let target = CrmTarget {
            settings: json!({"url": format!("{}/hooks/leads", server.uri())}),
            token: Some("shared".to_string()),
        };
        let ctx = CallContext::new(CancellationToken::new());
        let id = connector()
            .create_or_update_contact(
                &ctx,
                &target,
                &ContactPayload {
                    phone: Some("+15550100".to_string()),
                    properties: Map::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(id, "42");

        let received = &server.received_requests().await.unwrap()[0];
        let sig = received.headers.get("x-signature").unwrap().to_str().unwrap();
        assert!(signature::verify(&received.body, sig, "shared"));
    }

    #[tokio::test]
    async fn test_validate_prefers_health_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let target = CrmTarget {
            settings: json!({
                "url": format!("{}/hooks/leads", server.uri()),
                "health_url": format!("{}/health", server.uri())
            }),
            token: None,
        };
        let ctx = CallContext::new(CancellationToken::new());
        connector().validate_connection(&ctx, &target).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let ctx = CallContext::new(CancellationToken::new());
        let target = CrmTarget {
            settings: json!({}),
            token: None,
        };
        let err = connector()
            .validate_connection(&ctx, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
