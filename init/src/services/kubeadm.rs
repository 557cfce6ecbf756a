use crate::condition::{wait_for_socket, Condition, Endpoint};
use crate::constants::{CONTAINERD_ADDRESS, KUBEADM_CONFIG, KUBERNETES_IMAGE};
use crate::error::{Error, Result};
use crate::runner::containerd::ContainerdRunner;
use crate::runner::restart::{Restart, RestartPolicy};
use crate::runner::{Args, Options, Runner};
use crate::service::Service;
use crate::services::{create_dirs, service_env};
use async_trait::async_trait;
use std::path::Path;
use tracing::info;
use userdata::{KubeadmDocument, Mount, UserData};

/// Bootstraps or joins the cluster once.
pub struct Kubeadm;

fn options(data: &UserData) -> Result<&userdata::Kubeadm> {
    data.kubeadm().ok_or_else(|| {
        Error::UserData(userdata::Error::Invalid(
            "services.kubeadm is required".to_string(),
        ))
    })
}

/// Render the configuration written for kubeadm. A certificate key from
/// the user data is carried into the `InitConfiguration` unless the
/// document already sets one.
pub fn render_config(kubeadm: &userdata::Kubeadm) -> Result<String> {
    let mut docs = kubeadm.documents()?;

    if let Some(ref key) = kubeadm.certificate_key {
        for doc in docs.iter_mut() {
            if let KubeadmDocument::InitConfiguration(init) = doc {
                init.certificate_key.get_or_insert_with(|| key.clone());
            }
        }
    }

    let mut rendered = kubeadm.clone();
    rendered.set_documents(&docs)?;
    Ok(rendered.configuration)
}

/// Command line for `kubeadm init` or `kubeadm join`.
pub fn command(kubeadm: &userdata::Kubeadm) -> Result<Vec<String>> {
    let bootstrap = kubeadm.is_bootstrap()?;
    let control_plane = kubeadm.is_control_plane()?;

    let mut args = vec![
        "/usr/local/bin/kubeadm".to_string(),
        if bootstrap { "init" } else { "join" }.to_string(),
        format!("--config={}", KUBEADM_CONFIG),
    ];

    if !kubeadm.ignore_preflight_errors.is_empty() {
        args.push(format!(
            "--ignore-preflight-errors={}",
            kubeadm.ignore_preflight_errors.join(",")
        ));
    }

    if control_plane && kubeadm.certificate_key.is_some() {
        if bootstrap {
            args.push("--experimental-upload-certs".to_string());
        } else if let Some(ref key) = kubeadm.certificate_key {
            args.push(format!("--certificate-key={}", key));
        }
    }

    args.extend(kubeadm.extra_args.iter().cloned());
    Ok(args)
}

async fn write_config(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dirs("kubeadm", [parent]).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[async_trait]
impl Service for Kubeadm {
    fn id(&self, _data: &UserData) -> String {
        "kubeadm".to_string()
    }

    async fn pre(&self, data: &UserData) -> Result<()> {
        let config = render_config(options(data)?)?;
        create_dirs("kubeadm", ["/etc/kubernetes", "/var/lib/kubelet"]).await?;
        write_config(Path::new(KUBEADM_CONFIG), &config).await?;
        info!(path = KUBEADM_CONFIG, "Wrote kubeadm configuration");
        Ok(())
    }

    fn condition(&self, _data: &UserData) -> Option<Box<dyn Condition>> {
        Some(Box::new(wait_for_socket(Endpoint::Unix(
            CONTAINERD_ADDRESS.into(),
        ))))
    }

    fn runner(&self, data: &UserData) -> Result<Box<dyn Runner>> {
        let kubeadm = options(data)?;
        let image = kubeadm
            .common
            .image
            .clone()
            .unwrap_or_else(|| KUBERNETES_IMAGE.to_string());

        let mounts = vec![
            Mount::bind("/dev", &["rbind", "rshared", "rw"]),
            Mount::bind("/etc/kubernetes", &["bind", "rw"]),
            Mount::bind("/etc/os-release", &["bind", "ro"]),
            Mount::bind_to("/run", "/var/run", &["rbind", "rshared", "rw"]),
            Mount::pseudo("cgroup", "/sys/fs/cgroup", &["rbind", "rshared", "rw"]),
            Mount::bind("/var/lib/kubelet", &["rbind", "rshared", "rw"]),
            Mount::bind("/var/lib/etcd", &["rbind", "rshared", "rw"]),
        ];

        let opts = Options::default()
            .with_image(image)
            .with_env(service_env(data, Some(&kubeadm.common)))
            .with_mounts(mounts)
            .with_host_pid()
            .with_privileged();

        let runner = ContainerdRunner::new(Args::new(self.id(data), command(kubeadm)?), opts);
        Ok(Box::new(Restart::new(Box::new(runner), RestartPolicy::Once)))
    }

    async fn post(&self, _data: &UserData) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INIT: &str = "apiVersion: kubeadm.k8s.io/v1beta1\nkind: InitConfiguration\n";
    const JOIN_CONTROL_PLANE: &str = "apiVersion: kubeadm.k8s.io/v1beta1\nkind: JoinConfiguration\ncontrolPlane:\n  localAPIEndpoint:\n    advertiseAddress: 10.0.0.2\n";

    fn kubeadm(configuration: &str) -> userdata::Kubeadm {
        userdata::Kubeadm {
            configuration: configuration.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_command() {
        let mut k = kubeadm(INIT);
        k.ignore_preflight_errors = vec!["Swap".to_string(), "NumCPU".to_string()];
        k.certificate_key = Some("abc".to_string());

        assert_eq!(
            command(&k).unwrap(),
            vec![
                "/usr/local/bin/kubeadm",
                "init",
                "--config=/etc/kubernetes/kubeadm-config.yaml",
                "--ignore-preflight-errors=Swap,NumCPU",
                "--experimental-upload-certs",
            ]
        );
    }

    #[test]
    fn test_join_control_plane_command() {
        let mut k = kubeadm(JOIN_CONTROL_PLANE);
        k.certificate_key = Some("abc".to_string());
        k.extra_args = vec!["--v=5".to_string()];

        let args = command(&k).unwrap();
        assert_eq!(args[1], "join");
        assert!(args.contains(&"--certificate-key=abc".to_string()));
        assert_eq!(args.last().unwrap(), "--v=5");
    }

    #[test]
    fn test_render_config_carries_certificate_key() {
        let mut k = kubeadm(INIT);
        k.certificate_key = Some("abc".to_string());

        let rendered = render_config(&k).unwrap();
        let docs = kubeadm(&rendered).documents().unwrap();
        match &docs[0] {
            KubeadmDocument::InitConfiguration(init) => {
                assert_eq!(init.certificate_key.as_deref(), Some("abc"));
            }
            other => panic!("unexpected document: {:?}", other),
        }
    }

    #[test]
    fn test_missing_kubeadm_options() {
        assert!(matches!(
            options(&UserData::default()),
            Err(Error::UserData(userdata::Error::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_write_config_creates_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("etc/kubernetes/kubeadm-config.yaml");
        write_config(&path, INIT).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), INIT);
    }
}
