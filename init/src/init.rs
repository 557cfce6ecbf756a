//! Init system core - PID 1 duties and signal handling.

use crate::constants::{CONTROL_PORT, USER_DATA_PATH};
use crate::control::ControlServer;
use crate::error::{Error, Result};
use crate::service::Service;
use crate::services;
use crate::supervisor::{Supervisor, SupervisorConfig};
use nix::mount::{mount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use userdata::UserData;

/// Init system configuration.
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// User data document
    pub userdata_path: PathBuf,
    /// Whether to mount virtual filesystems
    pub mount_filesystems: bool,
    /// Whether to enforce PID 1 requirement
    pub require_pid1: bool,
    /// Control API address; `None` disables the API
    pub control_addr: Option<SocketAddr>,
    /// Supervisor tuning
    pub supervisor: SupervisorConfig,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            userdata_path: PathBuf::from(USER_DATA_PATH),
            mount_filesystems: true,
            require_pid1: true,
            control_addr: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, CONTROL_PORT))),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// The main init system.
pub struct Init {
    config: InitConfig,
    services: Vec<Arc<dyn Service>>,
    shutdown: CancellationToken,
}

impl Init {
    /// Create a new init system running the built-in services.
    pub fn new(config: InitConfig) -> Result<Self> {
        let pid = std::process::id();
        if config.require_pid1 && pid != 1 {
            return Err(Error::NotPid1(pid));
        }

        Ok(Self {
            config,
            services: services::all(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the set of services started at boot.
    pub fn with_services(mut self, services: Vec<Arc<dyn Service>>) -> Self {
        self.services = services;
        self
    }

    /// Token that triggers the same shutdown as SIGTERM when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the init system until shutdown completes.
    pub async fn run(&self) -> Result<()> {
        info!("nodeos init starting");

        if self.config.mount_filesystems {
            self.mount_filesystems();
        }

        let data = Arc::new(UserData::load(&self.config.userdata_path)?);
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&data),
            self.config.supervisor.clone(),
        ));

        let control_stop = CancellationToken::new();
        if let Some(addr) = self.config.control_addr {
            let token = data.token().map(str::to_string);
            match ControlServer::bind(addr, Arc::clone(&supervisor), token).await {
                Ok(server) => {
                    tokio::spawn(server.serve(control_stop.clone()));
                }
                Err(e) => warn!(addr = %addr, error = %e, "Failed to start control API"),
            }
        }

        supervisor.start(self.services.clone()).await;

        self.event_loop().await?;

        control_stop.cancel();
        supervisor.shutdown().await;
        self.power_off()
    }

    /// Mount virtual filesystems (/proc, /sys, /dev, etc.)
    fn mount_filesystems(&self) {
        info!("Mounting virtual filesystems");

        let mounts = [
            ("proc", "/proc", "proc"),
            ("sysfs", "/sys", "sysfs"),
            ("devtmpfs", "/dev", "devtmpfs"),
            ("devpts", "/dev/pts", "devpts"),
            ("tmpfs", "/run", "tmpfs"),
            ("cgroup2", "/sys/fs/cgroup", "cgroup2"),
        ];

        for (source, target, fstype) in mounts {
            if let Err(e) = self.mount_fs(source, target, fstype, MsFlags::empty()) {
                warn!(target = target, error = %e, "Failed to mount filesystem");
            }
        }
    }

    fn mount_fs(&self, source: &str, target: &str, fstype: &str, flags: MsFlags) -> Result<()> {
        let target_path = std::path::Path::new(target);
        if !target_path.exists() {
            std::fs::create_dir_all(target_path)?;
        }

        mount(Some(source), target, Some(fstype), flags, None::<&str>)?;

        info!(
            source = source,
            target = target,
            fstype = fstype,
            "Mounted filesystem"
        );
        Ok(())
    }

    /// Wait for a shutdown signal.
    // TODO: reap orphaned children on SIGCHLD once it no longer races
    // tokio's own child reaping for supervised processes.
    async fn event_loop(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        info!("Init system ready, entering event loop");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }

        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        unsafe {
            libc::sync();
        }

        if self.config.require_pid1 {
            info!("Powering off");
            reboot(RebootMode::RB_POWER_OFF)?;
        }

        Ok(())
    }
}
