//! Host process runner.
//!
//! Spawns the service executable directly on the host in its own session,
//! forwards its output to the log and stops it with SIGTERM/SIGKILL.

use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::runner::{supervise, Args, ExitStatus, Options, Runner, Sandbox};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A [`Sandbox`] over a plain child process.
pub struct ChildSandbox {
    child: Child,
    pid: Option<u32>,
}

impl ChildSandbox {
    /// Spawn `cmd` in a new session with output forwarded to the log.
    pub fn spawn(id: &str, mut cmd: Command) -> Result<Self> {
        // Own session so signals to the init process don't hit the child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", id, e)))?;
        let pid = child.id();
        info!(service = %id, pid = ?pid, "Spawned process");

        if let Some(stdout) = child.stdout.take() {
            forward_output(id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(id.to_string(), "stderr", stderr);
        }

        Ok(Self { child, pid })
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            // Already reaped.
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Sandbox for ChildSandbox {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.pid = None;
        Ok(status.into())
    }

    fn terminate(&mut self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    async fn kill(&mut self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

fn forward_output<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(service = %service, stream = stream, "{}", line);
        }
    });
}

/// Runs a service as a plain host process.
pub struct ProcessRunner {
    args: Args,
    opts: Options,
    stop: CancellationToken,
}

impl ProcessRunner {
    pub fn new(args: Args, opts: Options) -> Self {
        Self {
            args,
            opts,
            stop: CancellationToken::new(),
        }
    }

    fn command(&self) -> Result<Command> {
        let (program, rest) = self
            .args
            .process_args
            .split_first()
            .ok_or_else(|| Error::ProcessSpawnFailed(format!("{}: empty command", self.args.id)))?;

        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        for kv in &self.opts.env {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }
        if let Some(ref dir) = self.opts.working_directory {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn id(&self) -> &str {
        &self.args.id
    }

    async fn open(&self) -> Result<()> {
        // Validate early so a bad command fails the start, not every restart.
        self.command().map(|_| ())
    }

    async fn run(&self, events: &EventSink) -> Result<()> {
        if self.stop.is_cancelled() {
            return Ok(());
        }

        let sandbox = ChildSandbox::spawn(&self.args.id, self.command()?)?;
        supervise(
            &self.args.id,
            Box::new(sandbox),
            &self.stop,
            self.opts.grace_period,
            events,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        debug!(service = %self.args.id, "Closing process runner");
        self.stop.cancel();
        Ok(())
    }
}
