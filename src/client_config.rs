//! nodectl client configuration
//!
//! The client configuration names the node to talk to and the token the
//! node's control API expects. It is a small TOML file:
//!
//! ```toml
//! target = "10.0.0.10"
//! token = "s3cret"
//! ```

use anyhow::{bail, Context, Result};
use init::CONTROL_PORT;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "NODECTL_CONFIG";

/// Configuration path relative to the home directory
pub const DEFAULT_CONFIG: &str = ".nodeos/config.toml";

/// Connection settings for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Node address, with or without port
    pub target: String,
    /// Control API token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read client config: {}", path.display()))?;
        let config: ClientConfig = toml::from_str(&contents)
            .with_context(|| format!("Invalid client config: {}", path.display()))?;

        if config.target.trim().is_empty() {
            bail!("Client config {} has an empty target", path.display());
        }
        Ok(config)
    }

    /// Control API address; the default port is added when missing.
    pub fn address(&self) -> String {
        let target = self.target.trim();
        if target.parse::<SocketAddr>().is_ok() {
            return target.to_string();
        }
        if let Ok(ip) = target.parse::<IpAddr>() {
            return SocketAddr::new(ip, CONTROL_PORT).to_string();
        }
        match target.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => target.to_string(),
            _ => format!("{}:{}", target, CONTROL_PORT),
        }
    }
}

/// Locate the client configuration
///
/// Searches in order:
/// 1. User-specified path (`--nodeconfig` or `NODECTL_CONFIG`)
/// 2. `~/.nodeos/config.toml`
pub fn detect_config_path(custom_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = custom_path {
        return Some(path.to_path_buf());
    }

    let home = std::env::var("HOME").ok()?;
    let path = PathBuf::from(home).join(DEFAULT_CONFIG);
    path.exists().then_some(path)
}

/// Build the effective configuration from the config file and `--target`.
pub fn resolve(custom_path: Option<&Path>, target: Option<&str>) -> Result<ClientConfig> {
    let loaded = match detect_config_path(custom_path) {
        Some(path) => Some(ClientConfig::load(&path)?),
        None => None,
    };

    match (loaded, target) {
        (Some(mut config), Some(target)) => {
            config.target = target.to_string();
            Ok(config)
        }
        (Some(config), None) => Ok(config),
        (None, Some(target)) => Ok(ClientConfig {
            target: target.to_string(),
            token: None,
        }),
        (None, None) => bail!(
            "No client config found.\n\
            \n\
            Please either:\n\
            1. Create ~/{}\n\
            2. Set {} to a config file\n\
            3. Use --nodeconfig or --target",
            DEFAULT_CONFIG,
            CONFIG_ENV
        ),
    }
}
