use std::sync::Arc;
use tracing::{debug, warn};

use super::backend::{SwarmConnector, SwarmError, UpdateOptions};
use super::models::{UpdateServiceRequest, UpdateServiceResponse};
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::registry::{credential_host, CredentialsProvider};

const INTERNAL_ERROR: &str = "internal server error";

/// Label values that opt a service in to remote updates (compared lower-cased)
const ALLOW_VALUES: &[&str] = &["true", "yes", "on"];

/// Whether the opt-in label value permits an update
pub fn is_update_allowed(label_value: Option<&str>) -> bool {
    label_value
        .map(|v| ALLOW_VALUES.contains(&v.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Collapse embedded line breaks and trim a warning reported by the engine
pub fn normalize_warning(warning: &str) -> String {
    warning
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the fetch, authorize, mutate, commit cycle for a single service
pub struct ServiceUpdater {
    connector: Arc<dyn SwarmConnector>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    allow_label: String,
}

impl ServiceUpdater {
    pub fn new(
        connector: Arc<dyn SwarmConnector>,
        credentials: Option<Arc<dyn CredentialsProvider>>,
        allow_label: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            credentials,
            allow_label: allow_label.into(),
        }
    }

    pub async fn update(
        &self,
        service_id: &str,
        request: &UpdateServiceRequest,
    ) -> Result<UpdateServiceResponse, ServerError> {
        let client = self.connector.connect().internal_err(INTERNAL_ERROR)?;

        let mut service = client
            .inspect_service(service_id)
            .await
            .map_err(|e| match e {
                SwarmError::ServiceNotFound(_) => {
                    ServerError::not_found("no such service").with_source(e)
                }
                e => ServerError::internal_anyhow(e.into(), INTERNAL_ERROR),
            })?;

        // Labels are only read here, they are submitted back untouched
        if !is_update_allowed(service.label(&self.allow_label)) {
            return Err(ServerError::forbidden("service update not allowed")
                .with_context("label", self.allow_label.clone()));
        }

        if let Some(image) = request.requested_image() {
            debug!(from = %service.image(), to = %image, "Replacing service image");
            service.set_image(image);
        }
        let image = service.image().to_string();

        let encoded_registry_auth = if request.auth {
            Some(self.registry_auth(&image)?)
        } else {
            None
        };

        let options = UpdateOptions {
            query_registry: true,
            encoded_registry_auth,
        };
        let warnings = client
            .update_service(service, options)
            .await
            .internal_err(INTERNAL_ERROR)?;

        let warnings: Vec<String> = warnings.iter().map(|w| normalize_warning(w)).collect();
        for warning in &warnings {
            warn!(service_id = %service_id, warning = %warning, "Docker engine warning");
        }

        Ok(UpdateServiceResponse::success(image, warnings))
    }

    /// Resolve the transport token for the registry serving `image`
    fn registry_auth(&self, image: &str) -> Result<String, ServerError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ServerError::internal(INTERNAL_ERROR)
                .with_source(anyhow::anyhow!("registry credentials were not loaded at startup"))
        })?;

        let host = credential_host(image).internal_err(INTERNAL_ERROR)?;
        credentials
            .get_auth(&host)
            .internal_err(INTERNAL_ERROR)
            .map_err(|e| e.with_context("registry", host))
    }
}
