//! Well-known paths, namespaces and ports.

/// Containerd namespace for system services.
pub const SYSTEM_CONTAINERD_NAMESPACE: &str = "system";

/// Containerd namespace used by the CRI plugin.
pub const K8S_CONTAINERD_NAMESPACE: &str = "k8s.io";

/// Containerd GRPC socket.
pub const CONTAINERD_ADDRESS: &str = "/run/containerd/containerd.sock";

/// Image providing kubelet and kubeadm.
pub const KUBERNETES_IMAGE: &str = "k8s.gcr.io/hyperkube:v1.14.0";

/// Kubeconfig written by `kubeadm init`.
pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Where the kubeadm configuration from user data is written.
pub const KUBEADM_CONFIG: &str = "/etc/kubernetes/kubeadm-config.yaml";

/// Extra kubelet flags written by kubeadm.
pub const KUBEADM_FLAGS: &str = "/var/lib/kubelet/kubeadm-flags.env";

/// Default user data location.
pub const USER_DATA_PATH: &str = "/var/userdata.yaml";

/// Control API port.
pub const CONTROL_PORT: u16 = 50000;
