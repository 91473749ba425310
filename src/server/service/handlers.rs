use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap},
    Json,
};
use std::time::Instant;
use tracing::info;

use super::models::{UpdateServiceRequest, UpdateServiceResponse};
use crate::server::error::ServerError;
use crate::server::middleware::{caller_address, RequestId};
use crate::server::state::AppState;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Decode the body as a form when the content type says so, as JSON otherwise
pub fn parse_body(headers: &HeaderMap, body: &[u8]) -> Result<UpdateServiceRequest, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if content_type == FORM_CONTENT_TYPE {
        serde_urlencoded::from_bytes(body).map_err(|e| e.to_string())
    } else {
        serde_json::from_slice(body).map_err(|e| e.to_string())
    }
}

/// Redeploy a swarm service, optionally with a new image
pub async fn update_service(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    request: Request,
) -> Result<Json<UpdateServiceResponse>, ServerError> {
    let start = Instant::now();
    let remote_addr = caller_address(&request);
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.to_string())
        .unwrap_or_default();

    let result: Result<UpdateServiceResponse, ServerError> = async {
        let (parts, body) = request.into_parts();
        let body: Bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| ServerError::bad_request(format!("body: {}", e)))?;
        let body = parse_body(&parts.headers, &body)
            .map_err(|e| ServerError::bad_request(format!("body: {}", e)))?;

        state.updater.update(&service_id, &body).await
    }
    .await;

    match result {
        Ok(response) => {
            info!(
                remote_addr = %remote_addr,
                service_id = %service_id,
                request_id = %request_id,
                image = %response.image,
                warnings = response.warnings.len(),
                elapsed = ?start.elapsed(),
                "Updated service"
            );
            Ok(Json(response))
        }
        Err(err) => Err(err
            .with_context("remote_addr", remote_addr)
            .with_context("service_id", service_id)
            .with_context("request_id", request_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::middleware::{AdmissionChain, SharedSecret};
    use crate::server::service::backend::fake::{FakeConnector, FakeSwarm};
    use crate::server::service::updater::ServiceUpdater;
    use axum::{
        body::Body,
        http::{HeaderValue, Request as HttpRequest, StatusCode},
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt; // for `oneshot`

    const LABEL: &str = "whalepost.allow";

    fn app(swarm: &Arc<FakeSwarm>) -> Router {
        let updater = ServiceUpdater::new(Arc::new(FakeConnector(swarm.clone())), None, LABEL);
        let state = AppState {
            updater: Arc::new(updater),
            admission: AdmissionChain::new(vec![Box::new(SharedSecret::new("s3cr3t"))]),
        };
        crate::server::router(state)
    }

    fn put(uri: &str, content_type: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_parse_body_by_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
        );
        let req = parse_body(&headers, b"image=nginx%3A1.25&auth=1").unwrap();
        assert_eq!(req.requested_image(), Some("nginx:1.25"));
        assert!(req.auth);

        let req = parse_body(&HeaderMap::new(), br#"{"image":"nginx"}"#).unwrap();
        assert_eq!(req.requested_image(), Some("nginx"));

        assert!(parse_body(&HeaderMap::new(), b"image=nginx").is_err());
        assert!(parse_body(&HeaderMap::new(), b"").is_err());
    }

    #[tokio::test]
    async fn test_redeploy_in_place() {
        let swarm = Arc::new(
            FakeSwarm::default()
                .with_service("web", "nginx:1.25", &[(LABEL, "true")])
                .with_warnings(&["image nginx:1.25 could not be accessed\non a registry\n"]),
        );

        let response = app(&swarm)
            .oneshot(put(
                "/api/v1/service/web?key=s3cr3t",
                "application/json",
                r#"{"image":"","auth":false}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(
            json_body(response).await,
            serde_json::json!({
                "status": "success",
                "image": "nginx:1.25",
                "warnings": ["image nginx:1.25 could not be accessed on a registry"],
            })
        );
        assert_eq!(swarm.commits()[0].service.image(), "nginx:1.25");
    }

    #[tokio::test]
    async fn test_form_encoded_image_update() {
        let swarm = Arc::new(FakeSwarm::default().with_service("web", "nginx:1.25", &[(LABEL, "on")]));

        let response = app(&swarm)
            .oneshot(put(
                "/api/v1/service/web?key=s3cr3t",
                "application/x-www-form-urlencoded",
                "image=repo%2Fapp%3Av2",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["image"], "repo/app:v2");
        assert_eq!(swarm.commits()[0].service.image(), "repo/app:v2");
    }

    #[tokio::test]
    async fn test_unknown_service_is_404() {
        let swarm = Arc::new(FakeSwarm::default());

        let response = app(&swarm)
            .oneshot(put("/api/v1/service/ghost?key=s3cr3t", "application/json", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "no such service");
    }

    #[tokio::test]
    async fn test_malformed_body_is_400_with_detail() {
        let swarm = Arc::new(FakeSwarm::default().with_service("web", "nginx", &[(LABEL, "true")]));

        let response = app(&swarm)
            .oneshot(put(
                "/api/v1/service/web?key=s3cr3t",
                "application/json",
                r#"{"image": 42}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("body: "));
        assert!(swarm.commits().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_is_403_without_backend_call() {
        let swarm = Arc::new(FakeSwarm::default().with_service("web", "nginx", &[(LABEL, "true")]));

        let response = app(&swarm)
            .oneshot(put(
                "/api/v1/service/web?key=wrong",
                "application/json",
                "{}",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"], "forbidden");
        assert!(swarm.commits().is_empty());
    }

    #[tokio::test]
    async fn test_opted_out_service_is_403() {
        let swarm = Arc::new(FakeSwarm::default().with_service("web", "nginx", &[(LABEL, "false")]));

        let response = app(&swarm)
            .oneshot(put("/api/v1/service/web?key=s3cr3t", "application/json", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"], "service update not allowed");
        assert!(swarm.commits().is_empty());
    }

    #[tokio::test]
    async fn test_auth_without_credentials_is_500() {
        let swarm = Arc::new(FakeSwarm::default().with_service("web", "nginx", &[(LABEL, "true")]));

        let response = app(&swarm)
            .oneshot(put(
                "/api/v1/service/web?key=s3cr3t",
                "application/json",
                r#"{"auth":true}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"], "internal server error");
        assert!(swarm.commits().is_empty());
    }

    #[tokio::test]
    async fn test_only_put_is_routed() {
        let swarm = Arc::new(FakeSwarm::default().with_service("web", "nginx", &[(LABEL, "true")]));

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/v1/service/web?key=s3cr3t")
            .body(Body::empty())
            .unwrap();
        let response = app(&swarm).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(swarm.commits().is_empty());
    }
}
