use crate::condition::{wait_for_files_to_exist, Condition};
use crate::constants::{
    CONTAINERD_ADDRESS, K8S_CONTAINERD_NAMESPACE, KUBEADM_FLAGS, KUBERNETES_IMAGE,
};
use crate::error::Result;
use crate::runner::containerd::ContainerdRunner;
use crate::runner::restart::{Restart, RestartPolicy};
use crate::runner::{Args, Options, Runner};
use crate::service::Service;
use crate::services::{create_dirs, forever_backoff, service_env};
use async_trait::async_trait;
use userdata::{Mount, UserData};

const REQUIRED_DIRS: &[&str] = &[
    "/dev/disk/by-path",
    "/etc/kubernetes",
    "/run",
    "/sys/fs/cgroup",
    "/usr/libexec/kubernetes",
    "/var/lib/containerd",
    "/var/lib/kubelet",
    "/var/log/pods",
];

/// The node agent.
pub struct Kubelet;

/// Split the `KUBELET_KUBEADM_ARGS` line written by kubeadm into flags.
pub fn parse_kubeadm_flags(contents: &str) -> Vec<String> {
    let line = contents.trim();
    let line = line.strip_prefix("KUBELET_KUBEADM_ARGS=").unwrap_or(line);
    line.trim_matches('"')
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn default_mounts() -> Vec<Mount> {
    vec![
        Mount::bind("/dev", &["rbind", "rshared", "rw"]),
        Mount::bind("/etc/kubernetes", &["bind", "rw"]),
        Mount::bind("/etc/os-release", &["bind", "ro"]),
        Mount::bind("/etc/resolv.conf", &["bind", "ro"]),
        Mount::bind_to("/run", "/var/run", &["rbind", "rshared", "rw"]),
        Mount::pseudo("cgroup", "/sys/fs/cgroup", &["rbind", "rshared", "rw"]),
        Mount::bind("/usr/libexec/kubernetes", &["rbind", "rshared", "rw"]),
        Mount::bind("/var/lib/containerd", &["rbind", "rshared", "rw"]),
        Mount::bind("/var/lib/kubelet", &["rbind", "rshared", "rw"]),
        Mount::bind("/var/log/pods", &["rbind", "rshared", "rw"]),
        Mount::bind("/etc/cni", &["rbind", "rshared", "rw"]),
        Mount::bind("/opt/cni", &["rbind", "rshared", "rw"]),
    ]
}

fn command(data: &UserData, kubeadm_flags: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "/hyperkube",
        "kubelet",
        "--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf",
        "--kubeconfig=/etc/kubernetes/kubelet.conf",
        "--config=/var/lib/kubelet/config.yaml",
        "--container-runtime=remote",
        "--runtime-request-timeout=15m",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("--container-runtime-endpoint=unix://{}", CONTAINERD_ADDRESS));

    args.extend(parse_kubeadm_flags(kubeadm_flags));
    if let Some(kubelet) = data.kubelet() {
        args.extend(kubelet.extra_args.iter().cloned());
    }
    args
}

#[async_trait]
impl Service for Kubelet {
    fn id(&self, _data: &UserData) -> String {
        "kubelet".to_string()
    }

    async fn pre(&self, _data: &UserData) -> Result<()> {
        create_dirs("kubelet", REQUIRED_DIRS).await
    }

    fn condition(&self, _data: &UserData) -> Option<Box<dyn Condition>> {
        Some(Box::new(wait_for_files_to_exist([
            KUBEADM_FLAGS,
            CONTAINERD_ADDRESS,
        ])))
    }

    fn runner(&self, data: &UserData) -> Result<Box<dyn Runner>> {
        let flags = std::fs::read_to_string(KUBEADM_FLAGS)?;
        let kubelet = data.kubelet();

        let image = kubelet
            .and_then(|k| k.common.image.clone())
            .unwrap_or_else(|| KUBERNETES_IMAGE.to_string());

        // TODO: restrict extra mount sources to an allow-list.
        let mut mounts = default_mounts();
        if let Some(kubelet) = kubelet {
            mounts.extend(kubelet.extra_mounts.iter().cloned());
        }

        let opts = Options::default()
            .with_namespace(K8S_CONTAINERD_NAMESPACE)
            .with_image(image)
            .with_env(service_env(data, kubelet.map(|k| &k.common)))
            .with_mounts(mounts)
            .with_host_pid()
            .with_privileged()
            .with_rootfs_propagation("slave");

        let runner = ContainerdRunner::new(Args::new(self.id(data), command(data, &flags)), opts);
        Ok(Box::new(
            Restart::new(Box::new(runner), RestartPolicy::Forever).with_backoff(forever_backoff()),
        ))
    }

    async fn post(&self, _data: &UserData) -> Result<()> {
        Ok(())
    }
}
