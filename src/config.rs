//! Configuration management
//!
//! The main file is decoded with figment (YAML, then `PROM_GATEWAY_SERVER__`
//! environment overrides). Client definitions may be split across
//! `clients_files`, and credentials may be kept in separate files; both are
//! resolved here so the rest of the gateway only ever sees a [`Snapshot`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::ValidationError;
use crate::reload::SnapshotSource;
use crate::snapshot::{ClientAuth, ClientId, ClientSpec, DEFAULT_TRUST_HEADER, Snapshot};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listener and upstream settings
    pub server: ServerConfig,
    /// Glob patterns of extra files holding client definitions
    pub clients_files: Vec<String>,
    /// Inline client definitions
    pub clients: BTreeMap<ClientId, ClientConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Tenant listener port
    pub port: u16,
    /// Address both listeners bind to
    pub host: String,
    /// Upstream Prometheus base URL
    pub proxy: String,
    /// Trust header name
    pub id_header: String,
    /// Serve `/api/v1/series`, `/api/v1/query`, `/api/v1/query_range`
    pub api_enable: bool,
    /// Serve `/federate`
    pub federate_enable: bool,
    /// Require credentials on tenant routes
    pub authentication: bool,
    /// Start the admin listener
    pub admin_api_enable: bool,
    /// Admin listener port
    pub admin_port: u16,
    /// Per-request timeout on both listeners
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Timeout for a single upstream request
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            proxy: "http://localhost:9090/".to_string(),
            id_header: DEFAULT_TRUST_HEADER.to_string(),
            api_enable: true,
            federate_enable: true,
            authentication: true,
            admin_api_enable: true,
            admin_port: 8888,
            timeout: Duration::from_secs(15),
            upstream_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Parsed upstream base URL
    pub fn upstream_url(&self) -> Result<Url> {
        let url = Url::parse(&self.proxy)
            .map_err(|e| Error::Config(format!("Invalid proxy URL {:?}: {e}", self.proxy)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::Config(format!(
                "Unsupported proxy URL scheme {other:?}, expected http or https"
            ))),
        }
    }
}

/// One client as written in the configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Accepted credentials
    pub auth: AuthSchema,
    /// Label constraints
    #[serde(rename = "match")]
    pub matches: Vec<String>,
}

/// Authentication schemes of one client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSchema {
    /// Client may self-assert its ID through the trust header
    pub header: bool,
    /// HTTP Basic credentials
    pub basic: BasicAuth,
    /// Bearer tokens
    pub bearer: BearerAuth,
}

/// HTTP Basic credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BasicAuth {
    /// User name, encoded together with `password`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password, encoded together with `user`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Raw base64 `user:password` values
    pub base64: Vec<String>,
    /// Glob patterns of files holding one base64 value each
    pub files: Vec<String>,
}

/// Bearer tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BearerAuth {
    /// Tokens
    pub tokens: Vec<String>,
    /// Glob patterns of files holding one token each
    pub files: Vec<String>,
}

impl Config {
    /// Load configuration from file and environment, then resolve client
    /// and credential files.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        // PROM_GATEWAY_SERVER__ADMIN_PORT -> server.admin-port. Only the
        // server section; other PROM_GATEWAY_ variables belong to the CLI.
        let mut config: Self = Figment::new()
            .merge(Yaml::file(path))
            .merge(
                Env::prefixed("PROM_GATEWAY_SERVER__")
                    .map(|key| format!("server.{}", key.as_str().replace('_', "-")).into()),
            )
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_clients_files()?;
        if config.clients.is_empty() {
            return Err(ValidationError::EmptyClientSet.into());
        }
        config.resolve_credentials()?;

        debug!(path = %path.display(), clients = config.clients.len(), "Loaded configuration");
        Ok(config)
    }

    /// Merge every file matched by `clients_files` into `clients`.
    fn load_clients_files(&mut self) -> Result<()> {
        let files = find_files(&self.clients_files)?;
        if !files.is_empty() {
            debug!(files = ?files, "Found client config files");
        }

        for file in files {
            let content = std::fs::read_to_string(&file).map_err(|e| {
                Error::Config(format!("Cannot read client config file {}: {e}", file.display()))
            })?;
            let clients: BTreeMap<ClientId, ClientConfig> = serde_yaml::from_str(&content)
                .map_err(|e| {
                    Error::Config(format!("Cannot parse client config file {}: {e}", file.display()))
                })?;

            for (id, client) in clients {
                if self.clients.contains_key(&id) {
                    return Err(Error::Config(format!(
                        "duplicate client ID from files: ID={id}, file={}",
                        file.display()
                    )));
                }
                self.clients.insert(id, client);
            }
        }
        Ok(())
    }

    /// Fold user/password pairs and credential files into the inline lists.
    fn resolve_credentials(&mut self) -> Result<()> {
        for (id, client) in &mut self.clients {
            let basic = &mut client.auth.basic;
            match (&basic.user, &basic.password) {
                (Some(user), Some(password)) => {
                    basic.base64.push(STANDARD.encode(format!("{user}:{password}")));
                }
                (None, None) => {}
                _ => {
                    return Err(Error::Config(format!(
                        "client {id}: basic auth needs both user and password"
                    )));
                }
            }

            let from_files = read_credential_files(&basic.files)?;
            basic.base64.extend(from_files);

            let bearer = &mut client.auth.bearer;
            let from_files = read_credential_files(&bearer.files)?;
            bearer.tokens.extend(from_files);
        }
        Ok(())
    }

    /// The immutable snapshot consumed by the credential and match tables
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let clients = self
            .clients
            .iter()
            .map(|(id, client)| {
                let spec = ClientSpec {
                    auth: ClientAuth {
                        header: client.auth.header,
                        basic: client.auth.basic.base64.clone(),
                        bearer: client.auth.bearer.tokens.clone(),
                    },
                    matches: client.matches.clone(),
                };
                (id.clone(), spec)
            })
            .collect();

        Snapshot {
            trust_header: self.server.id_header.clone(),
            clients,
        }
    }
}

fn find_files(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::Config(format!("Invalid file pattern {pattern:?}: {e}")))?;
        for path in paths {
            files.push(path.map_err(|e| Error::Config(e.to_string()))?);
        }
    }
    Ok(files)
}

/// One credential per file, surrounding whitespace removed
fn read_credential_files(patterns: &[String]) -> Result<Vec<String>> {
    let files = find_files(patterns)?;
    if !files.is_empty() {
        debug!(files = ?files, "Found credential files");
    }

    let mut credentials = Vec::with_capacity(files.len());
    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|e| {
            Error::Config(format!("Cannot read credential file {}: {e}", file.display()))
        })?;
        let credential = content.trim();
        if credential.is_empty() {
            debug!(file = %file.display(), "Skipping empty credential file");
            continue;
        }
        credentials.push(credential.to_string());
    }
    Ok(credentials)
}

/// Re-reads the configuration file on every load
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    /// Source backed by the file at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn load(&self) -> Result<Snapshot> {
        Config::load(&self.path).map(|config| config.snapshot())
    }
}

/// Humantime serde support
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" must be tried before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
