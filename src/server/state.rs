use anyhow::{Context, Result};
use std::sync::Arc;

use crate::server::middleware::{AdmissionChain, AdmissionPredicate, RestrictOrigin, SharedSecret};
use crate::server::registry::{CredentialStore, CredentialsProvider};
use crate::server::service::backend::DockerConnector;
use crate::server::service::ServiceUpdater;
use crate::server::settings::Settings;

/// Read-only state shared by all requests
#[derive(Clone)]
pub struct AppState {
    pub updater: Arc<ServiceUpdater>,
    pub admission: AdmissionChain,
}

impl AppState {
    pub fn new_for_server(settings: &Settings) -> Result<Self> {
        let endpoint = settings
            .docker_endpoint()
            .context("Invalid docker endpoint")?;
        let connector = DockerConnector::new(
            endpoint,
            settings.docker.api_version.clone(),
            settings.docker.timeout_secs,
        );

        let credentials = load_credentials(settings);
        let updater = ServiceUpdater::new(
            Arc::new(connector),
            credentials,
            settings.policy.label.clone(),
        );

        Ok(Self {
            updater: Arc::new(updater),
            admission: admission_chain(settings),
        })
    }
}

/// Predicates run before the update handler, in this order
pub fn admission_chain(settings: &Settings) -> AdmissionChain {
    let mut predicates: Vec<Box<dyn AdmissionPredicate>> = Vec::new();

    if settings.auth.key.is_empty() {
        tracing::warn!("No shared secret configured, update endpoint is unauthenticated");
    }
    predicates.push(Box::new(SharedSecret::new(settings.auth.key.clone())));

    if !settings.auth.allowed_origins.is_empty() {
        predicates.push(Box::new(RestrictOrigin::new(
            settings.auth.allowed_origins.clone(),
        )));
    }

    AdmissionChain::new(predicates)
}

/// A missing or broken credentials file only disables credential attachment
fn load_credentials(settings: &Settings) -> Option<Arc<dyn CredentialsProvider>> {
    let path = settings.credentials_path();
    match CredentialStore::load(&path) {
        Ok(store) => {
            if store.is_empty() {
                tracing::warn!(
                    path = %path.display(),
                    "Credentials file has no registry logins, requests with auth will fail"
                );
            } else {
                tracing::info!(
                    path = %path.display(),
                    count = store.len(),
                    registries = ?store.registries().collect::<Vec<_>>(),
                    "Loaded registry credentials"
                );
            }
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Registry credentials not loaded, requests with auth will fail"
            );
            None
        }
    }
}
