//! Built-in system services.

mod containerd;
mod kubeadm;
mod kubelet;
mod udevd;

pub use containerd::Containerd;
pub use kubeadm::Kubeadm;
pub use kubelet::Kubelet;
pub use udevd::Udevd;

use crate::error::{Error, Result};
use crate::runner::restart::BackoffPolicy;
use crate::service::Service;
use std::path::Path;
use std::sync::Arc;
use userdata::{CommonServiceOptions, UserData};

/// Every built-in service, in boot order.
pub fn all() -> Vec<Arc<dyn Service>> {
    vec![
        Arc::new(Containerd),
        Arc::new(Udevd),
        Arc::new(Kubeadm),
        Arc::new(Kubelet),
    ]
}

/// Backoff for services restarted forever.
pub(crate) fn forever_backoff() -> BackoffPolicy {
    BackoffPolicy::default()
}

/// Node-wide environment overlaid with the service's own entries.
pub(crate) fn service_env(data: &UserData, common: Option<&CommonServiceOptions>) -> Vec<String> {
    let mut env = data.env.clone();
    if let Some(common) = common {
        env.extend(common.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

pub(crate) async fn create_dirs<I, P>(service: &str, dirs: I) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    for dir in dirs {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::hook(service, "pre", format!("create {}: {}", dir.display(), e)))?;
    }
    Ok(())
}
