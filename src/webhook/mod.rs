//! Mutating admission webhook for the Shawarma sidecar
//!
//! This module provides the HTTP surface and the mutation engine behind it:
//! the API server posts `AdmissionReview` payloads to `/mutate`, and the
//! webhook replies with a JSON-Patch that injects the configured sidecar
//! into pods whose annotations request it.

pub mod mutator;
pub mod service_account;
pub mod sidecar;
pub mod sidecar_monitor;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::{debug, error};

pub use mutator::{Mutator, MutatorConfig};

/// Create the webhook router with the mutation and health endpoints
pub fn webhook_router(mutator: Arc<Mutator>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/health", get(health_handler))
        .with_state(mutator)
}

/// Handle a mutating admission review
///
/// Transport-level problems (empty body, wrong content type) are HTTP 400;
/// everything else is reported inside the admission envelope with HTTP 200.
async fn mutate_handler(
    State(mutator): State<Arc<Mutator>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return bad_request("body of the request is empty");
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/json" {
        return bad_request(&format!(
            "received Content-Type={content_type}, expected Content-Type is 'application/json'"
        ));
    }

    debug!(bytes = body.len(), "mutation request received");

    match mutator.mutate(&body).await {
        Ok(response) => (
            [(header::CONTENT_TYPE, "application/json")],
            response,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode admission response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to process request: {e}"),
            )
                .into_response()
        }
    }
}

fn bad_request(message: &str) -> Response {
    error!(message = %message, "rejecting mutation request");
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

async fn health_handler() -> &'static str {
    "Healthy"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::io::Write;
    use tower::ServiceExt;

    async fn test_mutator() -> (Arc<Mutator>, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"sidecars: []").unwrap();

        let mutator = Arc::new(
            Mutator::new(MutatorConfig {
                sidecar_config_file: file.path().to_path_buf(),
                shawarma_image: "img:1".to_string(),
                native_sidecars: false,
                shawarma_service_acct_name: None,
                shawarma_secret_token_name: None,
                kube_client: None,
            })
            .await
            .unwrap(),
        );
        (mutator, file)
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let (mutator, _config) = test_mutator().await;
        let router = webhook_router(mutator);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Healthy");
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let (mutator, _config) = test_mutator().await;
        let router = webhook_router(mutator);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "application/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("empty"));
    }

    #[tokio::test]
    async fn non_json_content_type_is_rejected() {
        let (mutator, _config) = test_mutator().await;
        let router = webhook_router(mutator);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "text/plain")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("text/plain"));
    }

    /// A decode failure still answers HTTP 200; the admission protocol
    /// carries the failure inside the envelope.
    #[tokio::test]
    async fn decode_failure_is_http_ok() {
        let (mutator, _config) = test_mutator().await;
        let router = webhook_router(mutator);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"kind\": \"AdmissionReview\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert!(body["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .starts_with("failed to decode request"));
    }
}
