//! Node configuration for the nodeos init system.
//!
//! The user data document describes everything node-specific the init
//! process needs: environment variables handed to services, per-service
//! options such as extra kubelet mounts, the kubeadm bootstrap document and
//! the shared token guarding the control API.
//!
//! ```
//! use nodeos_userdata::UserData;
//!
//! let data = UserData::from_yaml_str("version: v1\nenv:\n  HTTP_PROXY: http://proxy:3128\n").unwrap();
//! assert_eq!(data.env["HTTP_PROXY"], "http://proxy:3128");
//! ```

pub mod error;
pub mod kubeadm;
pub mod mount;
pub mod userdata;

pub use error::{Error, Result};
pub use kubeadm::{InitConfiguration, JoinConfiguration, Kubeadm, KubeadmDocument};
pub use mount::Mount;
pub use userdata::{CommonServiceOptions, Kubelet, Security, Services, UserData};
