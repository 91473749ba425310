use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::models::{DistributionInspect, Service, ServiceSpec, ServiceUpdateResponse};
use bollard::ClientVersion;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{SwarmClient, SwarmConnector, SwarmError, UpdateOptions, VersionedService};
use crate::server::registry::reference::has_digest;

/// Where the Docker engine API is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// Path to a unix socket
    Unix(String),
    /// `http://host:port`
    Http(String),
}

impl DockerEndpoint {
    /// Parse `unix:///path`, `/path`, `tcp://host:port` or `http://host:port`
    pub fn parse(endpoint: &str) -> Option<Self> {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix://") {
            return (!path.is_empty()).then(|| Self::Unix(path.to_string()));
        }
        if endpoint.starts_with('/') {
            return Some(Self::Unix(endpoint.to_string()));
        }
        for scheme in ["tcp://", "http://"] {
            if let Some(addr) = endpoint.strip_prefix(scheme) {
                let addr = addr.trim_end_matches('/');
                return (!addr.is_empty()).then(|| Self::Http(format!("http://{}", addr)));
            }
        }
        None
    }
}

/// Parse an engine API version like `1.36`
pub fn parse_api_version(version: &str) -> Result<ClientVersion, SwarmError> {
    let invalid = || SwarmError::InvalidApiVersion(version.to_string());
    let (major, minor) = version.trim().split_once('.').ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}

fn engine_err(err: impl Into<DockerError>) -> SwarmError {
    SwarmError::Docker(err.into())
}

/// Connects to the Docker engine at a pinned API version
pub struct DockerConnector {
    endpoint: DockerEndpoint,
    api_version: String,
    timeout_secs: u64,
}

impl DockerConnector {
    pub fn new(endpoint: DockerEndpoint, api_version: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            endpoint,
            api_version: api_version.into(),
            timeout_secs,
        }
    }
}

impl SwarmConnector for DockerConnector {
    fn connect(&self) -> Result<Box<dyn SwarmClient>, SwarmError> {
        let version = parse_api_version(&self.api_version)?;

        let transport = match &self.endpoint {
            #[cfg(unix)]
            DockerEndpoint::Unix(path) => {
                if !std::path::Path::new(path).exists() {
                    return Err(engine_err(DockerError::SocketNotFoundError(path.clone())));
                }
                let mut builder = Client::builder(TokioExecutor::new());
                builder.pool_max_idle_per_host(0);
                Transport::Unix {
                    client: builder.build(hyperlocal::UnixConnector),
                    socket: path.clone(),
                }
            }
            #[cfg(not(unix))]
            DockerEndpoint::Unix(path) => {
                return Err(engine_err(DockerError::UnsupportedURISchemeError {
                    uri: format!("unix://{}", path),
                }))
            }
            DockerEndpoint::Http(base) => {
                let mut builder = Client::builder(TokioExecutor::new());
                builder.pool_max_idle_per_host(0);
                Transport::Http {
                    client: builder.build(HttpConnector::new()),
                    base: base.clone(),
                }
            }
        };

        debug!(endpoint = ?self.endpoint, api_version = %self.api_version, "Connected to docker engine");
        Ok(Box::new(DockerSwarmClient {
            transport,
            version,
            timeout: Duration::from_secs(self.timeout_secs),
        }))
    }
}

enum Transport {
    Http {
        client: Client<HttpConnector, Full<Bytes>>,
        base: String,
    },
    #[cfg(unix)]
    Unix {
        client: Client<hyperlocal::UnixConnector, Full<Bytes>>,
        socket: String,
    },
}

/// Engine error body, `{"message": "..."}`
#[derive(Deserialize)]
struct EngineMessage {
    message: String,
}

struct DockerSwarmClient {
    transport: Transport,
    version: ClientVersion,
    timeout: Duration,
}

impl DockerSwarmClient {
    /// Request URI for `/v<major>.<minor>/<segments..>?<query>`.
    ///
    /// Segments are percent-encoded individually.
    fn uri(&self, segments: &[&str], query: &[(&str, String)]) -> Result<hyper::Uri, SwarmError> {
        let mut url = url::Url::parse("http://engine/").map_err(engine_err)?;
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear()
                .push(&format!(
                    "v{}.{}",
                    self.version.major_version, self.version.minor_version
                ))
                .extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        let path_and_query = &url[url::Position::BeforePath..];

        let uri: hyper::Uri = match &self.transport {
            Transport::Http { base, .. } => format!("{}{}", base, path_and_query)
                .parse()
                .map_err(engine_err)?,
            #[cfg(unix)]
            Transport::Unix { socket, .. } => hyperlocal::Uri::new(socket, path_and_query).into(),
        };
        Ok(uri)
    }

    /// Send a request and return the body of a 2xx response
    async fn send(
        &self,
        method: Method,
        uri: hyper::Uri,
        registry_auth: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Bytes, SwarmError> {
        debug!(method = %method, uri = %uri, "Docker engine request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = registry_auth {
            builder = builder.header("X-Registry-Auth", token);
        }
        let request = builder.body(Full::new(Bytes::from(body))).map_err(engine_err)?;

        let pending = match &self.transport {
            Transport::Http { client, .. } => client.request(request),
            #[cfg(unix)]
            Transport::Unix { client, .. } => client.request(request),
        };

        let (status, body) = tokio::time::timeout(self.timeout, async {
            let response = pending.await.map_err(engine_err)?;
            let status = response.status();
            let body = response.into_body().collect().await.map_err(engine_err)?;
            Ok::<_, SwarmError>((status, body.to_bytes()))
        })
        .await
        .map_err(|_| engine_err(DockerError::RequestTimeoutError))??;

        if !status.is_success() {
            let message = serde_json::from_slice::<EngineMessage>(&body)
                .map(|m| m.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());
            return Err(engine_err(DockerError::DockerResponseServerError {
                status_code: status.as_u16(),
                message,
            }));
        }

        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        uri: hyper::Uri,
        registry_auth: Option<&str>,
    ) -> Result<T, SwarmError> {
        let body = self.send(Method::GET, uri, registry_auth, Vec::new()).await?;
        serde_json::from_slice(&body).map_err(engine_err)
    }

    /// Resolve the registry digest for `image` and return `image@digest`.
    ///
    /// Returns `None` when the image is already pinned.
    async fn pin_digest(
        &self,
        image: &str,
        registry_auth: Option<&str>,
    ) -> Result<Option<String>, SwarmError> {
        if has_digest(image) {
            return Ok(None);
        }

        let mut segments = vec!["distribution"];
        segments.extend(image.split('/'));
        segments.push("json");
        let inspect: DistributionInspect =
            self.get_json(self.uri(&segments, &[])?, registry_auth).await?;

        let digest = inspect
            .descriptor
            .digest
            .ok_or_else(|| SwarmError::Incomplete(image.to_string(), "registry digest"))?;

        Ok(Some(format!("{}@{}", image, digest)))
    }
}

#[async_trait]
impl SwarmClient for DockerSwarmClient {
    async fn inspect_service(&self, service_id: &str) -> Result<VersionedService, SwarmError> {
        let uri = self.uri(
            &["services", service_id],
            &[("insertDefaults", "false".to_string())],
        )?;
        let service: Service = self.get_json(uri, None).await.map_err(|e| match e {
            SwarmError::Docker(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => SwarmError::ServiceNotFound(service_id.to_string()),
            e => e,
        })?;

        let version = service
            .version
            .and_then(|v| v.index)
            .ok_or_else(|| SwarmError::Incomplete(service_id.to_string(), "version index"))?;
        let spec: ServiceSpec = service
            .spec
            .ok_or_else(|| SwarmError::Incomplete(service_id.to_string(), "spec"))?;

        Ok(VersionedService {
            id: service.id.unwrap_or_else(|| service_id.to_string()),
            version,
            spec,
        })
    }

    async fn update_service(
        &self,
        mut service: VersionedService,
        options: UpdateOptions,
    ) -> Result<Vec<String>, SwarmError> {
        let registry_auth = options.encoded_registry_auth.as_deref();

        let mut pin_warning = None;
        if options.query_registry && !service.image().is_empty() {
            let image = service.image().to_string();
            match self.pin_digest(&image, registry_auth).await {
                Ok(Some(pinned)) => {
                    debug!(image = %image, pinned = %pinned, "Pinned image to registry digest");
                    service.set_image(pinned);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(image = %image, error = %e, "Failed to resolve image digest");
                    pin_warning = Some(digest_warning(&image));
                }
            }
        }

        let uri = self.uri(
            &["services", &service.id, "update"],
            &[("version", service.version.to_string())],
        )?;
        let body = serde_json::to_vec(&service.spec).map_err(engine_err)?;
        let body = self.send(Method::POST, uri, registry_auth, body).await?;
        let response: ServiceUpdateResponse = serde_json::from_slice(&body).map_err(engine_err)?;

        let mut warnings = response.warnings.unwrap_or_default();
        warnings.extend(pin_warning);
        Ok(warnings)
    }
}

/// The engine's own wording when a digest could not be recorded
fn digest_warning(image: &str) -> String {
    format!(
        "image {image} could not be accessed on a registry to record\n\
         its digest. Each node will access {image} independently,\n\
         possibly leading to different nodes running different\n\
         versions of the image.\n"
    )
}
