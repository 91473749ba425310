use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::server::service::backend::{DockerEndpoint, SwarmError};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds in-flight requests may take to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthSettings {
    /// Shared secret expected in the `key` query parameter. Empty disables the check.
    #[serde(default)]
    pub key: String,
    /// Hostname suffixes accepted in the `Origin` header. Empty disables the check.
    #[serde(default, deserialize_with = "string_or_list")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerSettings {
    /// `unix:///var/run/docker.sock`, a bare socket path, or `tcp://host:port`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Upper bound for a single round trip to the engine
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicySettings {
    /// Service label that has to be truthy for updates to be accepted
    #[serde(default = "default_label")]
    pub label: String,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            label: default_label(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrySettings {
    /// Docker `config.json` holding registry logins
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
        }
    }
}

/// Accepts a list or a comma separated string, as set through the environment
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        String(String),
        List(Vec<String>),
    }

    let items = match StringOrList::deserialize(deserializer)? {
        StringOrList::String(s) => s.split(',').map(str::to_string).collect(),
        StringOrList::List(items) => items,
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_endpoint() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_api_version() -> String {
    "1.36".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_label() -> String {
    "whalepost.allow".to_string()
}

fn default_credentials_file() -> String {
    "~/.docker/config.json".to_string()
}

/// Command line values, applied on top of file and environment configuration
#[derive(Debug, Clone, Default, clap::Args)]
pub struct SettingsOverrides {
    /// Configuration file (TOML, YAML or JSON), also read from WHALEPOST_CONFIG
    #[arg(long, short)]
    pub config: Option<String>,
    /// Shared secret required in the `key` query parameter
    #[arg(long, visible_alias = "token")]
    pub key: Option<String>,
    /// Docker engine endpoint
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Docker engine API version
    #[arg(long, visible_alias = "api")]
    pub api_version: Option<String>,
    /// Label that opts a service in to updates
    #[arg(long)]
    pub label: Option<String>,
    /// Docker config.json with registry credentials
    #[arg(long, visible_alias = "conf")]
    pub credentials: Option<String>,
    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,
    /// Port to listen on
    #[arg(long, short)]
    pub port: Option<u16>,
}

impl Settings {
    pub fn new(overrides: &SettingsOverrides) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_file = overrides
            .config
            .clone()
            .or_else(|| env::var("WHALEPOST_CONFIG").ok())
            .filter(|p| !p.is_empty());
        if let Some(path) = &config_file {
            tracing::info!("Loading config file: {}", path);
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix("WHALEPOST")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_override_option("auth.key", overrides.key.clone())?
            .set_override_option("docker.endpoint", overrides.endpoint.clone())?
            .set_override_option("docker.api_version", overrides.api_version.clone())?
            .set_override_option("policy.label", overrides.label.clone())?
            .set_override_option("registry.credentials_file", overrides.credentials.clone())?
            .set_override_option("server.host", overrides.host.clone())?
            .set_override_option("server.port", overrides.port.map(i64::from))?;

        let config = builder.build()?;

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(config.cache, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        // WHALEPOST_CONFIG itself shows up as a top-level `config` key
        for field in unused_fields.iter().filter(|f| f.as_str() != "config") {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.docker_endpoint().is_none() {
            return Err(ConfigError::Message(format!(
                "Invalid docker endpoint {:?}, expected unix:///path, /path or tcp://host:port",
                self.docker.endpoint
            )));
        }

        crate::server::service::backend::parse_api_version(&self.docker.api_version)
            .map_err(|e: SwarmError| ConfigError::Message(e.to_string()))?;

        if self.policy.label.trim().is_empty() {
            return Err(ConfigError::Message(
                "Opt-in label not configured. Set WHALEPOST_POLICY__LABEL or [policy] label"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn docker_endpoint(&self) -> Option<DockerEndpoint> {
        DockerEndpoint::parse(&self.docker.endpoint)
    }

    /// Credentials file path with a leading `~` expanded
    pub fn credentials_path(&self) -> PathBuf {
        expand_home(&self.registry.credentials_file)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.policy.label, "whalepost.allow");
        assert_eq!(settings.docker.api_version, "1.36");
        assert_eq!(
            settings.docker_endpoint(),
            Some(DockerEndpoint::Unix("/var/run/docker.sock".to_string()))
        );
        assert!(settings.auth.key.is_empty());
    }

    #[test]
    fn test_file_and_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[auth]
key = "from-file"
allowed_origins = ["example.com"]

[docker]
endpoint = "tcp://10.0.0.5:2375"
api_version = "1.41"

[policy]
label = "deploy.allow"
"#
        )
        .unwrap();

        let overrides = SettingsOverrides {
            config: Some(file.path().to_string_lossy().into_owned()),
            key: Some("from-cli".to_string()),
            port: Some(9000),
            ..Default::default()
        };
        let settings = Settings::new(&overrides).unwrap();

        assert_eq!(settings.auth.key, "from-cli");
        assert_eq!(settings.auth.allowed_origins, vec!["example.com"]);
        assert_eq!(settings.docker.api_version, "1.41");
        assert_eq!(settings.policy.label, "deploy.allow");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(
            settings.docker_endpoint(),
            Some(DockerEndpoint::Http("http://10.0.0.5:2375".to_string()))
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut settings = Settings::default();
        settings.docker.api_version = "latest".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.docker.endpoint = "ftp://docker".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.policy.label = " ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_allowed_origins_from_comma_separated_string() {
        let settings: AuthSettings =
            serde_json::from_str(r#"{"allowed_origins": "example.com, ci.example.org,"}"#).unwrap();
        assert_eq!(settings.allowed_origins, vec!["example.com", "ci.example.org"]);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/docker.json"), PathBuf::from("/etc/docker.json"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home("~/.docker/config.json"),
                home.join(".docker/config.json")
            );
        }
    }
}
