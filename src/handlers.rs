use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use tracing::{debug, error, warn};

use crate::engine::{AdmissionEngine, Decision, PatchCounts};
use crate::metrics::{HardenerMetrics, RequestLabels, WebhookLabels};
use crate::review::{self, ReviewVersion};

pub struct AppState {
    pub engine: AdmissionEngine,
    pub metrics: HardenerMetrics,
}

pub type SharedState = Arc<AppState>;

const WEBHOOK: &str = "mutate";

pub async fn handle_mutate(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let start = Instant::now();
    debug!(body = %body, "handling request");

    let (version, req) = match review::decode(body) {
        Ok(decoded) => decoded,
        Err(e) => {
            let Some((version, uid)) = e.envelope() else {
                error!("{e}");
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            };
            warn!(uid, "{e}");
            return json_response(review::reject(version, uid, e.to_string()));
        }
    };

    record_request_metrics(&state, &req, version);

    let decision = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        state.engine.review(&req)
    }));

    let response = match decision {
        Ok(Ok(Decision {
            response,
            patch_operations,
        })) => {
            state.metrics.record_response(response.allowed, patch_operations);
            response
        }
        Ok(Err(e)) => {
            error!(uid = %req.uid, "not mutating: {e}");
            state.metrics.record_response(true, PatchCounts::default());
            AdmissionResponse::from(&req)
        }
        Err(_) => {
            error!(uid = %req.uid, "security defaulting panicked, failing open");
            state.metrics.record_response(true, PatchCounts::default());
            let mut resp = AdmissionResponse::from(&req);
            resp.warnings = Some(vec![
                "hardener: internal error during security defaulting, failing open".to_string(),
            ]);
            resp
        }
    };

    state
        .metrics
        .admission_request_duration_seconds
        .get_or_create(&WebhookLabels { webhook: WEBHOOK })
        .observe(start.elapsed().as_secs_f64());

    review_response(version, response)
}

fn review_response(version: ReviewVersion, response: AdmissionResponse) -> Response {
    json_response(review::encode(version, response))
}

fn json_response(encoded: Result<serde_json::Value, serde_json::Error>) -> Response {
    match encoded {
        Ok(review) => {
            debug!(response = %review, "sending response");
            Json(review).into_response()
        }
        Err(e) => {
            error!("failed to serialize AdmissionReview: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn record_request_metrics(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
    version: ReviewVersion,
) {
    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            operation: format!("{:?}", req.operation).to_uppercase(),
            resource: req.resource.resource.clone(),
            version: version.as_str(),
        })
        .inc();
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use prometheus_client::registry::Registry;
    use serde_json::{json, Value};

    use super::*;
    use crate::config::PolicyConfig;

    fn state() -> SharedState {
        let mut registry = Registry::default();
        Arc::new(AppState {
            engine: AdmissionEngine::new(&PolicyConfig::default()),
            metrics: HardenerMetrics::new(&mut registry),
        })
    }

    fn review(api_version: &str, resource: &str) -> Value {
        json!({
            "apiVersion": api_version,
            "kind": "AdmissionReview",
            "request": {
                "uid": "0df28fbd-5f5f-11e8-bc74-36e6bb280816",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": resource},
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default"},
                    "spec": {"containers": [{"name": "app", "image": "nginx"}]}
                },
                "dryRun": false
            }
        })
    }

    async fn call(body: Value) -> (StatusCode, Value) {
        let response = handle_mutate(State(state()), Json(body)).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_v1_pod_is_patched() {
        let (status, body) = call(review("admission.k8s.io/v1", "pods")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(body["response"]["uid"], "0df28fbd-5f5f-11e8-bc74-36e6bb280816");
        assert_eq!(body["response"]["allowed"], true);
        assert_eq!(body["response"]["patchType"], "JSONPatch");
    }

    #[tokio::test]
    async fn test_v1beta1_envelope_is_echoed() {
        let (status, body) = call(review("admission.k8s.io/v1beta1", "pods")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1beta1");
        assert_eq!(body["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn test_non_pod_resource_is_allowed_without_patch() {
        let (status, body) = call(review("admission.k8s.io/v1", "configmaps")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], true);
        assert!(body["response"].get("patch").is_none());
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_denied_for_the_request() {
        let mut body = review("admission.k8s.io/v1beta1", "pods");
        body["request"]["uid"] = json!("abc-123");
        body["request"]["object"]["metadata"]["labels"] = json!("not-a-map");

        let (status, body) = call(body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1beta1");
        assert_eq!(body["kind"], "AdmissionReview");
        assert_eq!(body["response"]["uid"], "abc-123");
        assert_eq!(body["response"]["allowed"], false);
        assert!(body["response"].get("patch").is_none());
    }

    #[tokio::test]
    async fn test_review_without_request_keeps_envelope_version() {
        let (status, body) = call(json!({
            "apiVersion": "admission.k8s.io/v1beta1",
            "kind": "AdmissionReview"
        }))
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1beta1");
        assert_eq!(body["response"]["allowed"], false);
    }

    #[tokio::test]
    async fn test_unknown_review_version_is_bad_request() {
        let (status, _) = call(review("admission.k8s.io/v2", "pods")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
