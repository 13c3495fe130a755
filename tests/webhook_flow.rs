//! End-to-end webhook flow against mocked upstreams

use axum::body::Body;
use axum::http::{Request, StatusCode};
use leadline::config::Config;
use leadline::db::{CrmIntegration, Office, Repository, RequestStatus, Tenant};
use leadline::pipeline::Pipeline;
use leadline::server::{router, AppState};
use leadline::signature::{self, SIGNATURE_HEADER};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "whsec_test";

struct Flow {
    state: AppState,
    db: Repository,
    server: MockServer,
    tenant_id: String,
    _tmp: TempDir,
}

impl Flow {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let server = MockServer::start().await;

        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.provider.base_url = server.uri();
        config.transcription.base_url = server.uri();
        config.analysis.base_url = server.uri();
        config.outbound.retry.max_attempts = 4;
        config.outbound.retry.base_delay_ms = 1;
        config.outbound.retry.max_delay_ms = 5;
        config.outbound.retry.unavailable_delay_secs = 0;
        config
            .provider
            .credentials
            .insert("ACME_TOKEN".to_string(), "provider-token".to_string());
        let config = Arc::new(config);

        let db = Repository::new(&config.paths.db_file).await.unwrap();
        let tenant = Tenant::new("Acme Roofing".to_string(), SECRET.to_string());
        db.insert_tenant(&tenant).await.unwrap();
        db.insert_office(&Office::new(
            tenant.id.clone(),
            "co-1".to_string(),
            "ACME_TOKEN".to_string(),
        ))
        .await
        .unwrap();

        let pipeline = Pipeline::from_config(config.clone(), db.clone(), CancellationToken::new()).unwrap();
        let state = AppState::new(config, db.clone(), Arc::new(pipeline));

        Self {
            state,
            db,
            server,
            tenant_id: tenant.id,
            _tmp: tmp,
        }
    }

    /// Call detail, transcription and both model completions
    async fn mount_upstreams(&self) {
        Mock::given(method("GET"))
            .and(path("/calls/C1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "C1",
                "recording_url": format!("{}/recordings/C1.mp3", self.server.uri()),
                "duration": 185
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"alternatives": [{
                    "transcript": "hi I need a quote for a new roof",
                    "confidence": 0.93
                }]}]
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"response_format": {"type": "json_object"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"intent":"Roof replacement quote","sentiment":"positive","lead_score":87,
                   "urgency":"high","appointment_requested":true,"follow_up_required":true,
                   "key_details":["30 year old roof"]}"#,
            )))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("4")))
            .mount(&self.server)
            .await;
    }

    async fn mount_recording(&self) {
        Mock::given(method("GET"))
            .and(path("/recordings/C1.mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(vec![3u8; 256]),
            )
            .mount(&self.server)
            .await;
    }

    fn payload(&self) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "call_id": "C1",
            "tenant_id": self.tenant_id,
            "company_id": "co-1",
            "customer_phone_number": "+15550100",
            "customer_name": "Dana Smith",
            "customer_city": "Austin",
            "duration": 185
        }))
        .unwrap()
    }

    async fn deliver(&self, body: Vec<u8>, signature: &str) -> (StatusCode, Value) {
        let response = router(self.state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/calls")
                    .header("content-type", "application/json")
                    .header(SIGNATURE_HEADER, signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn deliver_signed(&self) -> (StatusCode, Value) {
        let body = self.payload();
        let sig = signature::sign(&body, SECRET).unwrap();
        self.deliver(body, &sig).await
    }

    /// Wait for spawned pipeline runs, then accept new ones again
    async fn drain(&self) {
        self.state.tracker.close();
        self.state.tracker.wait().await;
        self.state.tracker.reopen();
    }

    async fn hits(&self, wanted: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == wanted)
            .count()
    }
}

fn completion(content: &str) -> Value {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

#[tokio::test]
async fn test_delivery_is_enriched_and_analyzed() {
    let flow = Flow::start().await;
    flow.mount_upstreams().await;
    flow.mount_recording().await;

    let (status, body) = flow.deliver_signed().await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert!(body["correlation_id"].as_str().is_some());
    flow.drain().await;

    let request = flow
        .db
        .get_request_by_call(&flow.tenant_id, "C1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.get_status().unwrap(), RequestStatus::Analyzed);
    assert_eq!(request.lead_score, Some(87));
    assert_eq!(request.spam_likelihood, Some(4));
    assert!(!request.transcript_text.unwrap_or_default().is_empty());
    assert!(!request.needs_review);

    let events = flow.db.list_webhook_events(&flow.tenant_id, "C1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, "completed");
}

#[tokio::test]
async fn test_redelivery_does_not_duplicate() {
    let flow = Flow::start().await;
    flow.mount_upstreams().await;
    flow.mount_recording().await;
    Mock::given(method("POST"))
        .and(path("/crm/leads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "lead-42"})))
        .mount(&flow.server)
        .await;
    flow.db
        .upsert_crm_integration(&CrmIntegration::new(
            flow.tenant_id.clone(),
            "webhook".to_string(),
            json!({"url": format!("{}/crm/leads", flow.server.uri())}),
        ))
        .await
        .unwrap();

    let (status, _) = flow.deliver_signed().await;
    assert_eq!(status, StatusCode::ACCEPTED);
    flow.drain().await;

    let (status, _) = flow.deliver_signed().await;
    assert_eq!(status, StatusCode::ACCEPTED);
    flow.drain().await;

    let requests = flow
        .db
        .list_requests(&flow.tenant_id, None, 10)
        .await
        .unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.delivery_count, 2);
    assert_eq!(request.get_status().unwrap(), RequestStatus::Synced);
    assert_eq!(
        request.crm_records().get("webhook").map(String::as_str),
        Some("lead-42")
    );

    assert_eq!(flow.hits("/crm/leads").await, 1);
    assert_eq!(flow.hits("/v1/transcribe").await, 1);
    assert_eq!(
        flow.db.list_webhook_events(&flow.tenant_id, "C1").await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_bad_signature_leaves_no_trace() {
    let flow = Flow::start().await;

    let (status, body) = flow.deliver(flow.payload(), "sha256=deadbeef").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "rejected");

    let body = flow.payload();
    let sig = signature::sign(&body, "some-other-secret").unwrap();
    let (status, _) = flow.deliver(body, &sig).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    flow.drain().await;
    assert!(flow
        .db
        .get_request_by_call(&flow.tenant_id, "C1")
        .await
        .unwrap()
        .is_none());
    assert!(flow
        .db
        .list_webhook_events(&flow.tenant_id, "C1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_transient_recording_failures_are_retried() {
    let flow = Flow::start().await;
    flow.mount_upstreams().await;
    Mock::given(method("GET"))
        .and(path("/recordings/C1.mp3"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&flow.server)
        .await;
    flow.mount_recording().await;

    let (status, _) = flow.deliver_signed().await;
    assert_eq!(status, StatusCode::ACCEPTED);
    flow.drain().await;

    let request = flow
        .db
        .get_request_by_call(&flow.tenant_id, "C1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.get_status().unwrap(), RequestStatus::Analyzed);
    assert!(flow
        .db
        .get_recording(&flow.tenant_id, "C1")
        .await
        .unwrap()
        .is_some());
    // Three 503s then success, within the four-attempt ceiling
    assert_eq!(flow.hits("/recordings/C1.mp3").await, 4);
}
