//! HTTP surface
//!
//! - `POST /webhooks/calls`: signed call-completed deliveries
//! - `GET /health`
//! - `GET /tenants/{tenant_id}/requests/{call_id}`: request lookup, signed
//!   with the tenant's webhook secret
//!
//! Intake work (verification, attribution, persistence) happens inline;
//! the pipeline runs on a [`TaskTracker`] so the provider gets its 202
//! without waiting on transcription or analysis.

mod requests;
mod webhook;

pub use webhook::CallWebhook;

use crate::config::Config;
use crate::db::Repository;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::tenant::TenantResolver;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Repository,
    pub resolver: TenantResolver,
    pub pipeline: Arc<Pipeline>,
    pub tracker: TaskTracker,
}

impl AppState {
    pub fn new(config: Arc<Config>, db: Repository, pipeline: Arc<Pipeline>) -> Self {
        Self {
            resolver: TenantResolver::new(db.clone()),
            config,
            db,
            pipeline,
            tracker: TaskTracker::new(),
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.max_body_bytes;
    Router::new()
        .route("/webhooks/calls", post(webhook::receive_call))
        .route("/health", get(health))
        .route(
            "/tenants/{tenant_id}/requests/{call_id}",
            get(requests::lookup_request),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serve until `shutdown` fires, then drain in-flight pipeline work
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = state.config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("Cannot bind {}: {}", addr, e)))?;
    info!("Listening on {}", addr);

    state.pipeline.resume_unfinished(&state.tracker).await?;

    let tracker = state.tracker.clone();
    let app = router(state);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await?;

    tracker.close();
    info!(in_flight = tracker.len(), "Waiting for pipeline tasks to finish");
    tracker.wait().await;
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewRequest, Office, Tenant};
    use crate::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn state() -> (AppState, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        let config = Arc::new(config);
        let db = Repository::new(&config.paths.db_file).await.unwrap();
        let pipeline =
            Pipeline::from_config(config.clone(), db.clone(), CancellationToken::new()).unwrap();
        (AppState::new(config, db, Arc::new(pipeline)), tmp)
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _tmp) = state().await;
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (state, _tmp) = state().await;
        let limit = state.config.server.max_body_bytes;
        let response = router(state)
            .oneshot(
                Request::post("/webhooks/calls")
                    .header("content-type", "application/json")
                    .body(Body::from(vec![b' '; limit + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    const LOOKUP_SECRET: &str = "whsec_lookup";

    async fn seeded() -> (AppState, Tenant, TempDir) {
        let (state, tmp) = state().await;
        let tenant = Tenant::new("Acme Roofing".to_string(), LOOKUP_SECRET.to_string());
        state.db.insert_tenant(&tenant).await.unwrap();
        let office = Office::new(tenant.id.clone(), "co-1".to_string(), "ACME_TOKEN".to_string());
        state.db.insert_office(&office).await.unwrap();
        state
            .db
            .upsert_request(&NewRequest {
                tenant_id: tenant.id.clone(),
                office_id: office.id.clone(),
                call_id: "C1".to_string(),
                raw_payload: "{}".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        (state, tenant, tmp)
    }

    async fn lookup(state: &AppState, uri: &str, headers: &[(&str, String)]) -> StatusCode {
        let mut request = Request::get(uri);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        router(state.clone())
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    fn signed(path: &str, secret: &str) -> Vec<(&'static str, String)> {
        let now = Utc::now().timestamp().to_string();
        let sig = signature::sign_lookup(&now, path, secret).unwrap();
        vec![(TIMESTAMP_HEADER, now), (SIGNATURE_HEADER, sig)]
    }

    #[tokio::test]
    async fn test_signed_lookup_returns_request() {
        let (state, tenant, _tmp) = seeded().await;
        let uri = format!("/tenants/{}/requests/C1", tenant.id);

        let response = router(state.clone())
            .oneshot(
                signed(&uri, LOOKUP_SECRET)
                    .into_iter()
                    .fold(Request::get(&uri), |r, (name, value)| r.header(name, value))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let view: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(view["call_id"], "C1");
        assert_eq!(view["status"], "received");
        assert!(view.get("raw_payload").is_none());

        let missing = format!("/tenants/{}/requests/C404", tenant.id);
        assert_eq!(
            lookup(&state, &missing, &signed(&missing, LOOKUP_SECRET)).await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_unsigned_lookup_rejected() {
        let (state, tenant, _tmp) = seeded().await;
        let uri = format!("/tenants/{}/requests/C1", tenant.id);

        assert_eq!(lookup(&state, &uri, &[]).await, StatusCode::UNAUTHORIZED);

        let timestamp_only = vec![(TIMESTAMP_HEADER, Utc::now().timestamp().to_string())];
        assert_eq!(
            lookup(&state, &uri, &timestamp_only).await,
            StatusCode::UNAUTHORIZED
        );

        assert_eq!(
            lookup(&state, &uri, &signed(&uri, "not-the-tenant-secret")).await,
            StatusCode::UNAUTHORIZED
        );

        // A valid signature for one call does not open another
        let other = format!("/tenants/{}/requests/C2", tenant.id);
        assert_eq!(
            lookup(&state, &other, &signed(&uri, LOOKUP_SECRET)).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_stale_lookup_rejected() {
        let (state, tenant, _tmp) = seeded().await;
        let uri = format!("/tenants/{}/requests/C1", tenant.id);
        let old = (Utc::now().timestamp() - 3600).to_string();
        let sig = signature::sign_lookup(&old, &uri, LOOKUP_SECRET).unwrap();

        assert_eq!(
            lookup(&state, &uri, &[(TIMESTAMP_HEADER, old), (SIGNATURE_HEADER, sig)]).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_lookup_for_unknown_tenant_is_unauthorized() {
        let (state, _tenant, _tmp) = seeded().await;
        let uri = "/tenants/no-such-tenant/requests/C1";

        assert_eq!(
            lookup(&state, uri, &signed(uri, LOOKUP_SECRET)).await,
            StatusCode::UNAUTHORIZED
        );
    }
}
