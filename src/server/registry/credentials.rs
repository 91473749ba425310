use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse credential document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("auth for registry {registry} is not valid base64: {source}")]
    Decode {
        registry: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("auth for registry {0} is not of the form user:password")]
    Malformed(String),

    #[error("credentials not found for registry {0}")]
    NotFound(String),

    #[error("failed to encode credentials: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Provider of transport-ready registry tokens
///
/// The token is what the Docker engine expects in `X-Registry-Auth`.
pub trait CredentialsProvider: Send + Sync {
    fn get_auth(&self, registry_host: &str) -> Result<String, CredentialError>;
}

/// A single registry login, field names as the Docker engine expects them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, rename = "serveraddress", skip_serializing_if = "String::is_empty")]
    pub server_address: String,
    #[serde(default, rename = "identitytoken", skip_serializing_if = "String::is_empty")]
    pub identity_token: String,
    #[serde(default, rename = "registrytoken", skip_serializing_if = "String::is_empty")]
    pub registry_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct CredentialDocument {
    #[serde(default)]
    auths: HashMap<String, RegistryAuth>,
}

/// Registry logins loaded once at startup, read-only afterwards
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    auths: HashMap<String, RegistryAuth>,
}

impl CredentialStore {
    /// Load a Docker-style `config.json`.
    ///
    /// A single undecodable entry fails the whole load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let buf = std::fs::read(path).map_err(|source| CredentialError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&buf)
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, CredentialError> {
        let document: CredentialDocument = serde_json::from_slice(buf)?;

        let mut auths = HashMap::with_capacity(document.auths.len());
        for (registry, mut entry) in document.auths {
            let (username, password) = decode_auth(&registry, &entry.auth)?;
            entry.auth.clear();
            entry.server_address = registry.clone();
            entry.username = username;
            entry.password = password;
            auths.insert(registry, entry);
        }

        Ok(Self { auths })
    }

    pub fn len(&self) -> usize {
        self.auths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    pub fn registries(&self) -> impl Iterator<Item = &str> {
        self.auths.keys().map(String::as_str)
    }
}

impl CredentialsProvider for CredentialStore {
    fn get_auth(&self, registry_host: &str) -> Result<String, CredentialError> {
        let auth = self
            .auths
            .get(registry_host)
            .ok_or_else(|| CredentialError::NotFound(registry_host.to_string()))?;

        let buf = serde_json::to_vec(auth).map_err(CredentialError::Encode)?;
        Ok(general_purpose::URL_SAFE.encode(buf))
    }
}

/// Split a base64 `user:password` string. An empty string yields empty credentials.
fn decode_auth(registry: &str, auth: &str) -> Result<(String, String), CredentialError> {
    if auth.is_empty() {
        return Ok((String::new(), String::new()));
    }

    let decoded = general_purpose::STANDARD
        .decode(auth)
        .map_err(|source| CredentialError::Decode {
            registry: registry.to_string(),
            source,
        })?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| CredentialError::Malformed(registry.to_string()))?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| CredentialError::Malformed(registry.to_string()))?;

    Ok((
        username.to_string(),
        password.trim_matches('\0').to_string(),
    ))
}
