//! The user data document.

use crate::error::{Error, Result};
use crate::kubeadm::Kubeadm;
use crate::mount::Mount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// The only user data version this crate understands.
pub const VERSION: &str = "v1";

/// Node configuration supplied at boot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    /// Document version
    pub version: String,
    /// Environment variables passed to every containerized service
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Security settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Security>,
    /// Per-service options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Services>,
}

/// Security settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    /// Shared secret required by the control API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Per-service option blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Services {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<Kubelet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeadm: Option<Kubeadm>,
}

/// Options every service block accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceOptions {
    /// Container image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Additional environment variables for this service only
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Kubelet options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kubelet {
    #[serde(flatten)]
    pub common: CommonServiceOptions,
    /// Additional mounts for the kubelet sandbox
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<Mount>,
    /// Additional kubelet command line arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl UserData {
    /// Load and validate user data from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let data = Self::from_yaml_str(&contents)?;
        debug!(path = %path.display(), "Loaded user data");
        Ok(data)
    }

    /// Parse and validate user data from a YAML string.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let data: UserData = serde_yaml::from_str(contents)?;
        data.validate()?;
        Ok(data)
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the document for values the init system cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.version != VERSION {
            return Err(Error::UnsupportedVersion(self.version.clone()));
        }

        if let Some(token) = self.security.as_ref().and_then(|s| s.token.as_ref()) {
            if token.trim().is_empty() {
                return Err(Error::Invalid("security.token must not be empty".to_string()));
            }
        }

        if let Some(kubelet) = self.kubelet() {
            for mount in &kubelet.extra_mounts {
                if !mount.destination.is_absolute() {
                    return Err(Error::Invalid(format!(
                        "kubelet extra mount destination must be absolute: {}",
                        mount.destination.display()
                    )));
                }
            }
        }

        if let Some(kubeadm) = self.kubeadm() {
            kubeadm.documents()?;
        }

        Ok(())
    }

    /// Kubelet options, if configured.
    pub fn kubelet(&self) -> Option<&Kubelet> {
        self.services.as_ref().and_then(|s| s.kubelet.as_ref())
    }

    /// Kubeadm options, if configured.
    pub fn kubeadm(&self) -> Option<&Kubeadm> {
        self.services.as_ref().and_then(|s| s.kubeadm.as_ref())
    }

    /// Control API token, if configured.
    pub fn token(&self) -> Option<&str> {
        self.security.as_ref().and_then(|s| s.token.as_deref())
    }
}
