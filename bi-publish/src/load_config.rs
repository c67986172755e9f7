//! `load_config`: reads the static YAML config and injects the password from
//! the environment.
//!
//! The YAML file never holds secrets. The sign-in password comes from
//! `BI_PUBLISH_PASSWORD` (a `.env` file is honoured by the binary).
//! Relative paths in the file are taken relative to the file itself.
//!
//! Accepted shape:
//!
//! ```yaml
//! server:
//!   url: https://analytics.example.com
//!   api_version: "3.6"
//!   site: marketing
//!   username: publisher
//! publish:
//!   project: Finance/Reports
//!   target_connections: ./targets.json
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bi_publish_core::rest::ServerConfig;
use serde::Deserialize;
use tracing::{error, info};

pub const PASSWORD_ENV: &str = "BI_PUBLISH_PASSWORD";

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(flatten)]
    pub endpoint: ServerConfig,
    /// Site content URL; empty for the default site.
    #[serde(default)]
    pub site: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishSection {
    /// Destination folder path, e.g. `Finance/Reports`.
    pub project: String,
    /// JSON file mapping connection captions to target credentials.
    pub target_connections: PathBuf,
}

/// Sign-in password; never printed.
pub struct Password(String);

impl Password {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

#[derive(Debug)]
pub struct CliConfig {
    pub server: ServerSection,
    pub publish: PublishSection,
    pub password: Password,
}

#[derive(Deserialize)]
struct RawConfig {
    server: ServerSection,
    publish: PublishSection,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path = path.as_ref();
    info!(config_path = %path.display(), "Loading configuration");

    let content = fs::read_to_string(path).map_err(|e| {
        error!(error = %e, config_path = %path.display(), "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {}: {e}", path.display())
    })?;
    let mut raw: RawConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config YAML {}", path.display()))?;

    if raw.publish.target_connections.is_relative() {
        if let Some(dir) = path.parent() {
            raw.publish.target_connections = dir.join(&raw.publish.target_connections);
        }
    }

    let password = std::env::var(PASSWORD_ENV)
        .with_context(|| format!("{PASSWORD_ENV} must be set to the sign-in password"))?;

    info!(
        server = %raw.server.endpoint.server_url,
        api_version = %raw.server.endpoint.api_version,
        site = %raw.server.site,
        username = %raw.server.username,
        project = %raw.publish.project,
        "Configuration loaded"
    );
    Ok(CliConfig {
        server: raw.server,
        publish: raw.publish,
        password: Password(password),
    })
}
