mod docker;

pub use docker::{parse_api_version, DockerConnector, DockerEndpoint};

use async_trait::async_trait;
use bollard::models::ServiceSpec;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("no such service: {0}")]
    ServiceNotFound(String),

    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("invalid docker api version {0:?}, expected MAJOR.MINOR")]
    InvalidApiVersion(String),

    #[error("service {0} has no {1}")]
    Incomplete(String, &'static str),
}

/// A service specification together with the version index required to update it
#[derive(Debug, Clone)]
pub struct VersionedService {
    pub id: String,
    pub version: u64,
    pub spec: ServiceSpec,
}

impl VersionedService {
    pub fn labels(&self) -> Option<&HashMap<String, String>> {
        self.spec.labels.as_ref()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().and_then(|l| l.get(key)).map(String::as_str)
    }

    /// Image of the task template's container spec, empty if unset
    pub fn image(&self) -> &str {
        self.spec
            .task_template
            .as_ref()
            .and_then(|t| t.container_spec.as_ref())
            .and_then(|c| c.image.as_deref())
            .unwrap_or_default()
    }

    pub fn set_image(&mut self, image: impl Into<String>) {
        self.spec
            .task_template
            .get_or_insert_with(Default::default)
            .container_spec
            .get_or_insert_with(Default::default)
            .image = Some(image.into());
    }
}

/// Options passed along with an update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Resolve the image digest at the registry and pin the spec to it
    pub query_registry: bool,
    /// Base64url JSON registry credentials (`X-Registry-Auth`)
    pub encoded_registry_auth: Option<String>,
}

/// Opens a fresh connection to the orchestrator for every request
pub trait SwarmConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn SwarmClient>, SwarmError>;
}

#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Fetch the current spec and version of a service (by id or name)
    async fn inspect_service(&self, service_id: &str) -> Result<VersionedService, SwarmError>;

    /// Submit a new spec for the service, returning the engine's warnings in order
    async fn update_service(
        &self,
        service: VersionedService,
        options: UpdateOptions,
    ) -> Result<Vec<String>, SwarmError>;
}
