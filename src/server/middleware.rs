use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::server::error::ServerError;

/// Request ID stored in request extensions for correlation and debugging
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Middleware that generates and injects a unique request ID for each request.
///
/// The id is stored in the request extensions and echoed back in the
/// `x-request-id` response header.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;

    response.headers_mut().insert(
        header::HeaderName::from_static("x-request-id"),
        header::HeaderValue::from_str(&request_id.0.to_string())
            .unwrap_or_else(|_| header::HeaderValue::from_static("invalid")),
    );

    response
}

/// Address of the caller for logging.
///
/// Prefers `X-Forwarded-For`, then the peer address of the connection.
pub fn caller_address(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// A check evaluated before a request reaches its handler
pub trait AdmissionPredicate: Send + Sync {
    fn admit(&self, request: &Request) -> Result<(), ServerError>;
}

/// Requires `?key=<secret>` to match the configured secret exactly.
///
/// An empty secret disables the check.
pub struct SharedSecret {
    key: String,
}

impl SharedSecret {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl AdmissionPredicate for SharedSecret {
    fn admit(&self, request: &Request) -> Result<(), ServerError> {
        if self.key.is_empty() {
            return Ok(());
        }

        let provided = request
            .uri()
            .query()
            .and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| k == "key")
                    .map(|(_, v)| v.into_owned())
            })
            .unwrap_or_default();

        if bool::from(provided.as_bytes().ct_eq(self.key.as_bytes())) {
            Ok(())
        } else {
            Err(ServerError::forbidden("forbidden"))
        }
    }
}

/// Rejects browser requests whose `Origin` host does not end with an allowed suffix.
///
/// Requests without an `Origin` header are admitted.
pub struct RestrictOrigin {
    origins: Vec<String>,
}

impl RestrictOrigin {
    pub fn new(origins: Vec<String>) -> Self {
        Self { origins }
    }

    fn is_allowed(&self, origin: &str) -> bool {
        let Ok(url) = url::Url::parse(origin) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        self.origins.iter().any(|allowed| host.ends_with(allowed.as_str()))
    }
}

impl AdmissionPredicate for RestrictOrigin {
    fn admit(&self, request: &Request) -> Result<(), ServerError> {
        match request.headers().get(header::ORIGIN) {
            None => Ok(()),
            Some(origin) => match origin.to_str() {
                Ok(o) if o.is_empty() || self.is_allowed(o) => Ok(()),
                _ => Err(ServerError::forbidden("origin restriction")),
            },
        }
    }
}

/// Ordered list of admission predicates, the first rejection wins
#[derive(Clone, Default)]
pub struct AdmissionChain {
    predicates: Arc<Vec<Box<dyn AdmissionPredicate>>>,
}

impl AdmissionChain {
    pub fn new(predicates: Vec<Box<dyn AdmissionPredicate>>) -> Self {
        Self {
            predicates: Arc::new(predicates),
        }
    }

    pub fn check(&self, request: &Request) -> Result<(), ServerError> {
        self.predicates.iter().try_for_each(|p| p.admit(request))
    }
}

/// Runs the admission chain and only calls the inner handler when every predicate admits
pub async fn admission_middleware(
    State(chain): State<AdmissionChain>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(err) = chain.check(&request) {
        let mut err = err
            .with_context("remote_addr", caller_address(&request))
            .with_context("path", request.uri().path().to_string());
        if let Some(id) = request.extensions().get::<RequestId>() {
            err = err.with_context("request_id", id.0.to_string());
        }
        return err.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        routing::get,
        Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt; // for `oneshot`

    async fn test_handler() -> &'static str {
        "Hello, World!"
    }

    fn request(uri: &str) -> Request {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    /// Router whose handler counts how often it was entered
    fn guarded_app(chain: AdmissionChain, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "entered"
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                chain,
                admission_middleware,
            ))
    }

    #[tokio::test]
    async fn test_request_id_middleware_adds_header() {
        let app = Router::new()
            .route("/", get(test_handler))
            .layer(axum::middleware::from_fn(request_id_middleware));

        let response = app.oneshot(request("/")).await.unwrap();

        let request_id = response.headers().get("x-request-id").unwrap();
        assert!(Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_shared_secret() {
        let secret = SharedSecret::new("s3cr3t");
        assert!(secret.admit(&request("/?key=s3cr3t")).is_ok());
        assert!(secret.admit(&request("/?other=1&key=s3cr3t")).is_ok());
        assert!(secret.admit(&request("/?key=s3cr3t2")).is_err());
        assert!(secret.admit(&request("/?key=S3CR3T")).is_err());
        assert!(secret.admit(&request("/?key=")).is_err());
        assert!(secret.admit(&request("/")).is_err());
    }

    #[test]
    fn test_empty_secret_admits_everything() {
        let secret = SharedSecret::new("");
        assert!(secret.admit(&request("/")).is_ok());
        assert!(secret.admit(&request("/?key=anything")).is_ok());
    }

    #[test]
    fn test_restrict_origin() {
        let restrict = RestrictOrigin::new(vec!["example.com".to_string()]);
        let with_origin = |origin: &str| {
            HttpRequest::builder()
                .uri("/")
                .header(header::ORIGIN, origin)
                .body(Body::empty())
                .unwrap()
        };

        assert!(restrict.admit(&request("/")).is_ok());
        assert!(restrict.admit(&with_origin("https://ci.example.com")).is_ok());
        assert!(restrict.admit(&with_origin("https://example.com:8443")).is_ok());
        assert!(restrict.admit(&with_origin("https://evil.org")).is_err());
        assert!(restrict.admit(&with_origin("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_correct_key_enters_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = AdmissionChain::new(vec![Box::new(SharedSecret::new("s3cr3t"))]);

        let response = guarded_app(chain, hits.clone())
            .oneshot(request("/?key=s3cr3t"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_or_missing_key_never_enters_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = AdmissionChain::new(vec![Box::new(SharedSecret::new("s3cr3t"))]);

        for uri in ["/?key=wrong", "/"] {
            let response = guarded_app(chain.clone(), hits.clone())
                .oneshot(request(uri))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_short_circuits_in_order() {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = AdmissionChain::new(vec![
            Box::new(SharedSecret::new("s3cr3t")),
            Box::new(RestrictOrigin::new(vec!["example.com".to_string()])),
        ]);

        let req = HttpRequest::builder()
            .uri("/?key=s3cr3t")
            .header(header::ORIGIN, "https://evil.org")
            .body(Body::empty())
            .unwrap();
        let response = guarded_app(chain, hits.clone()).oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "origin restriction");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_caller_address() {
        let req = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(caller_address(&req), "203.0.113.7");

        let mut req = request("/");
        req.extensions_mut()
            .insert(ConnectInfo("10.1.2.3:55555".parse::<SocketAddr>().unwrap()));
        assert_eq!(caller_address(&req), "10.1.2.3");

        assert_eq!(caller_address(&request("/")), "unknown");
    }
}
