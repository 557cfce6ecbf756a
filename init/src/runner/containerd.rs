//! Containerd runner.
//!
//! Runs a service inside a container. The runner itself only turns its
//! [`Args`] and [`Options`] into a [`ProcessSpec`]; creating the sandbox is
//! the job of an [`ExecutionBackend`]. The default backend is [`CtrBackend`],
//! which drives containerd through the `ctr` CLI.
//!
//! Killing a `ctr run` client does not kill its container, so the
//! [`CtrSandbox`] kill path removes the task and container through `ctr`
//! before the next attempt reuses the container ID.

use crate::constants::CONTAINERD_ADDRESS;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::runner::process::ChildSandbox;
use crate::runner::{
    supervise, Args, ExecutionBackend, ExitStatus, Options, ProcessSpec, Runner, Sandbox,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs a service through an [`ExecutionBackend`].
pub struct ContainerdRunner {
    args: Args,
    opts: Options,
    backend: Arc<dyn ExecutionBackend>,
    stop: CancellationToken,
}

impl ContainerdRunner {
    /// Create a runner backed by [`CtrBackend`].
    pub fn new(args: Args, opts: Options) -> Self {
        Self::with_backend(args, opts, Arc::new(CtrBackend::default()))
    }

    pub fn with_backend(args: Args, opts: Options, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            args,
            opts,
            backend,
            stop: CancellationToken::new(),
        }
    }

    pub fn spec(&self) -> ProcessSpec {
        ProcessSpec::new(&self.args, &self.opts)
    }
}

#[async_trait]
impl Runner for ContainerdRunner {
    fn id(&self) -> &str {
        &self.args.id
    }

    async fn open(&self) -> Result<()> {
        if self.stop.is_cancelled() {
            return Ok(());
        }
        debug!(service = %self.args.id, backend = self.backend.name(), "Preparing sandbox");
        self.backend.prepare(&self.spec()).await
    }

    async fn run(&self, events: &EventSink) -> Result<()> {
        if self.stop.is_cancelled() {
            return Ok(());
        }

        let sandbox = self.backend.spawn(&self.spec()).await?;
        supervise(
            &self.args.id,
            sandbox,
            &self.stop,
            self.opts.grace_period,
            events,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        debug!(service = %self.args.id, "Closing containerd runner");
        self.stop.cancel();
        Ok(())
    }
}

/// Backend invoking `ctr` against a containerd socket.
#[derive(Debug, Clone)]
pub struct CtrBackend {
    /// `ctr` executable
    pub binary: PathBuf,
    /// Containerd socket
    pub address: PathBuf,
}

impl Default for CtrBackend {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/bin/ctr"),
            address: PathBuf::from(CONTAINERD_ADDRESS),
        }
    }
}

impl CtrBackend {
    fn base_args(&self, namespace: &str) -> Vec<String> {
        vec![
            "--address".to_string(),
            self.address.display().to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ]
    }

    fn image<'a>(&self, spec: &'a ProcessSpec) -> Result<&'a str> {
        spec.image
            .as_deref()
            .ok_or_else(|| Error::Backend(format!("{}: no container image", spec.id)))
    }

    /// Arguments for `ctr images pull`.
    pub fn pull_args(&self, spec: &ProcessSpec) -> Result<Vec<String>> {
        let mut args = self.base_args(&spec.namespace);
        args.extend(["images".to_string(), "pull".to_string()]);
        args.push(self.image(spec)?.to_string());
        Ok(args)
    }

    /// Arguments for `ctr run`.
    pub fn run_args(&self, spec: &ProcessSpec) -> Result<Vec<String>> {
        let image = self.image(spec)?;

        let mut args = self.base_args(&spec.namespace);
        // System services share the host network.
        args.extend([
            "run".to_string(),
            "--rm".to_string(),
            "--net-host".to_string(),
        ]);

        if spec.privileged {
            args.push("--privileged".to_string());
        }
        if spec.host_pid {
            args.push("--with-ns".to_string());
            args.push("pid:/proc/1/ns/pid".to_string());
        }
        if let Some(ref cgroup) = spec.cgroup_parent {
            args.push("--cgroup".to_string());
            args.push(cgroup.clone());
        }
        if let Some(ref dir) = spec.working_directory {
            args.push("--cwd".to_string());
            args.push(dir.display().to_string());
        }
        for mount in &spec.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_string());
        }
        for kv in &spec.env {
            args.push("--env".to_string());
            args.push(kv.clone());
        }

        args.push(image.to_string());
        args.push(spec.id.clone());
        args.extend(spec.args.iter().cloned());
        Ok(args)
    }

    /// Argument lists that kill and remove the container left behind by a
    /// killed `ctr run` client, in execution order.
    pub fn cleanup_args(&self, spec: &ProcessSpec) -> Vec<Vec<String>> {
        let steps: [&[&str]; 3] = [
            &["task", "kill", "--all", "--signal", "SIGKILL"],
            &["task", "delete", "--force"],
            &["containers", "delete"],
        ];

        steps
            .iter()
            .map(|step| {
                let mut args = self.base_args(&spec.namespace);
                args.extend(step.iter().map(|a| a.to_string()));
                args.push(spec.id.clone());
                args
            })
            .collect()
    }

    fn sandbox(&self, spec: &ProcessSpec, client: ChildSandbox) -> CtrSandbox {
        CtrSandbox {
            client,
            binary: self.binary.clone(),
            id: spec.id.clone(),
            cleanup: self.cleanup_args(spec),
        }
    }
}

/// A `ctr run` client together with the container it started.
pub struct CtrSandbox {
    client: ChildSandbox,
    binary: PathBuf,
    id: String,
    cleanup: Vec<Vec<String>>,
}

impl CtrSandbox {
    async fn remove_container(&self) {
        for args in &self.cleanup {
            match Command::new(&self.binary).args(args).output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => warn!(
                    service = %self.id,
                    command = %args.join(" "),
                    error = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Container cleanup step failed"
                ),
                Err(e) => warn!(
                    service = %self.id,
                    command = %args.join(" "),
                    error = %e,
                    "Failed to run ctr"
                ),
            }
        }
    }
}

#[async_trait]
impl Sandbox for CtrSandbox {
    fn pid(&self) -> Option<u32> {
        self.client.pid()
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        self.client.wait().await
    }

    fn terminate(&mut self) -> Result<()> {
        // ctr forwards the signal to the task.
        self.client.terminate()
    }

    async fn kill(&mut self) -> Result<()> {
        self.remove_container().await;
        self.client.kill().await
    }
}

#[async_trait]
impl ExecutionBackend for CtrBackend {
    fn name(&self) -> &'static str {
        "ctr"
    }

    async fn prepare(&self, spec: &ProcessSpec) -> Result<()> {
        let args = self.pull_args(spec)?;
        info!(service = %spec.id, image = ?spec.image, "Pulling image");

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("{}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            return Err(Error::Backend(format!(
                "image pull for {} failed: {}",
                spec.id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn Sandbox>> {
        if let Some(ref propagation) = spec.rootfs_propagation {
            debug!(service = %spec.id, propagation = %propagation, "Rootfs propagation left to the runtime default");
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.run_args(spec)?);
        let client = ChildSandbox::spawn(&spec.id, cmd)?;
        Ok(Box::new(self.sandbox(spec, client)))
    }
}
