use oci_distribution::Reference;
use thiserror::Error;

/// Key under which `docker login` stores Docker Hub credentials
pub const OFFICIAL_INDEX_SERVER: &str = "https://index.docker.io/v1/";

/// Hostnames that all refer to the official Docker Hub registry
const OFFICIAL_REGISTRY_HOSTS: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("invalid image reference {image:?}: {reason}")]
    Invalid { image: String, reason: String },
}

/// Resolve the credential-store key for an image reference.
///
/// `nginx:latest`, `library/nginx` and `docker.io/foo/bar` all map to the
/// official index server. Everything else maps to its registry host
/// (including the port, e.g. `registry.example.com:5000`).
pub fn credential_host(image: &str) -> Result<String, ReferenceError> {
    let reference = Reference::try_from(image).map_err(|e| ReferenceError::Invalid {
        image: image.to_string(),
        reason: e.to_string(),
    })?;

    let registry = reference.registry();
    if OFFICIAL_REGISTRY_HOSTS.contains(&registry) {
        Ok(OFFICIAL_INDEX_SERVER.to_string())
    } else {
        Ok(registry.to_string())
    }
}

/// Whether the reference already carries a content digest (`name@sha256:...`)
pub fn has_digest(image: &str) -> bool {
    Reference::try_from(image)
        .map(|r| r.digest().is_some())
        .unwrap_or(false)
}
