//! Kubeadm options and the kubeadm configuration documents.
//!
//! The `configuration` field carries kubeadm's own multi-document YAML
//! verbatim, because it is handed to kubeadm unchanged. Each document is
//! discriminated by its `kind` field up front: an `InitConfiguration` makes
//! this node bootstrap a new cluster, a `JoinConfiguration` makes it join an
//! existing one (as a control plane member when `controlPlane` is set).

use crate::error::{Error, Result};
use crate::userdata::CommonServiceOptions;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Kubeadm service options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kubeadm {
    #[serde(flatten)]
    pub common: CommonServiceOptions,
    /// Raw kubeadm configuration (one or more YAML documents)
    #[serde(default)]
    pub configuration: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_preflight_errors: Vec<String>,
}

/// One kubeadm configuration document, selected by its `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum KubeadmDocument {
    InitConfiguration(InitConfiguration),
    JoinConfiguration(JoinConfiguration),
    ClusterConfiguration(Passthrough),
    KubeletConfiguration(Passthrough),
    KubeProxyConfiguration(Passthrough),
}

/// `kind: InitConfiguration`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfiguration {
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// `kind: JoinConfiguration`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfiguration {
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<Value>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// Documents kubeadm reads but the init system only carries along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Passthrough {
    pub api_version: String,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl Kubeadm {
    /// Parse the configuration into its documents.
    ///
    /// Exactly one `InitConfiguration` or `JoinConfiguration` must be present.
    pub fn documents(&self) -> Result<Vec<KubeadmDocument>> {
        let docs = parse_documents(&self.configuration)?;

        let inits = docs
            .iter()
            .filter(|d| matches!(d, KubeadmDocument::InitConfiguration(_)))
            .count();
        let joins = docs
            .iter()
            .filter(|d| matches!(d, KubeadmDocument::JoinConfiguration(_)))
            .count();

        match (inits, joins) {
            (1, 0) | (0, 1) => Ok(docs),
            (0, 0) => Err(Error::Kubeadm(
                "expected an InitConfiguration or a JoinConfiguration".to_string(),
            )),
            _ => Err(Error::Kubeadm(
                "expected exactly one InitConfiguration or JoinConfiguration".to_string(),
            )),
        }
    }

    /// Replace the configuration with the given documents.
    pub fn set_documents(&mut self, docs: &[KubeadmDocument]) -> Result<()> {
        let mut rendered = Vec::with_capacity(docs.len());
        for doc in docs {
            rendered.push(serde_yaml::to_string(doc)?);
        }
        self.configuration = rendered.join("---\n");
        Ok(())
    }

    /// Whether this node bootstraps a new cluster.
    pub fn is_bootstrap(&self) -> Result<bool> {
        Ok(self
            .documents()?
            .iter()
            .any(|d| matches!(d, KubeadmDocument::InitConfiguration(_))))
    }

    /// Whether this node runs the control plane.
    pub fn is_control_plane(&self) -> Result<bool> {
        Ok(self.documents()?.iter().any(|d| match d {
            KubeadmDocument::InitConfiguration(_) => true,
            KubeadmDocument::JoinConfiguration(join) => join.control_plane.is_some(),
            _ => false,
        }))
    }
}

fn parse_documents(contents: &str) -> Result<Vec<KubeadmDocument>> {
    let mut docs = Vec::new();
    if contents.trim().is_empty() {
        return Ok(docs);
    }

    for document in serde_yaml::Deserializer::from_str(contents) {
        let doc = Option::<KubeadmDocument>::deserialize(document)
            .map_err(|e| Error::Kubeadm(e.to_string()))?;
        if let Some(doc) = doc {
            docs.push(doc);
        }
    }

    Ok(docs)
}
