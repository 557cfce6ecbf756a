//! Start conditions.
//!
//! A [`Condition`] blocks a service until some external precondition holds:
//! a file exists, a socket accepts connections, or a combination of those.
//! Conditions are polled, carry no state between evaluations and always
//! honour the cancellation token they are given.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default interval between two evaluations of a polled condition.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Asynchronous gate evaluated before a service starts.
#[async_trait]
pub trait Condition: Send + Sync + fmt::Display {
    /// Block until the condition holds, or fail with [`Error::Cancelled`]
    /// once `token` is cancelled.
    async fn wait(&self, token: &CancellationToken) -> Result<()>;
}

/// Poll `check` every `interval` until it returns true or `token` fires.
async fn poll_until<F>(token: &CancellationToken, interval: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool + Send,
{
    loop {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if check() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => return Err(Error::Cancelled),
        }
    }
}

/// Satisfied once every listed path exists.
#[derive(Debug, Clone)]
pub struct FilesExist {
    paths: Vec<PathBuf>,
    interval: Duration,
}

impl FilesExist {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl Condition for FilesExist {
    async fn wait(&self, token: &CancellationToken) -> Result<()> {
        poll_until(token, self.interval, || {
            self.paths.iter().all(|p| {
                let exists = p.exists();
                if !exists {
                    debug!(path = %p.display(), "Waiting for file");
                }
                exists
            })
        })
        .await
    }
}

impl fmt::Display for FilesExist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths: Vec<String> = self.paths.iter().map(|p| p.display().to_string()).collect();
        write!(f, "files {} to exist", paths.join(", "))
    }
}

/// Something a socket condition can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Satisfied once the endpoint accepts a connection.
#[derive(Debug, Clone)]
pub struct SocketReachable {
    endpoint: Endpoint,
    interval: Duration,
}

impl SocketReachable {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn try_connect(&self) -> bool {
        let connected = match &self.endpoint {
            Endpoint::Unix(path) => tokio::net::UnixStream::connect(path).await.map(|_| ()),
            Endpoint::Tcp(addr) => tokio::net::TcpStream::connect(addr).await.map(|_| ()),
        };
        if let Err(e) = &connected {
            debug!(endpoint = %self.endpoint, error = %e, "Endpoint not reachable yet");
        }
        connected.is_ok()
    }
}

#[async_trait]
impl Condition for SocketReachable {
    async fn wait(&self, token: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                reachable = self.try_connect() => if reachable { return Ok(()) },
                _ = token.cancelled() => return Err(Error::Cancelled),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = token.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

impl fmt::Display for SocketReachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to be reachable", self.endpoint)
    }
}

/// Satisfied once each inner condition is satisfied.
pub struct All {
    conditions: Vec<Box<dyn Condition>>,
}

#[async_trait]
impl Condition for All {
    async fn wait(&self, token: &CancellationToken) -> Result<()> {
        for condition in &self.conditions {
            condition.wait(token).await?;
        }
        Ok(())
    }
}

impl fmt::Display for All {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.conditions.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(" and "))
    }
}

/// Wait for all the given files to exist.
pub fn wait_for_files_to_exist<I, P>(paths: I) -> FilesExist
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    FilesExist {
        paths: paths.into_iter().map(Into::into).collect(),
        interval: DEFAULT_POLL_INTERVAL,
    }
}

/// Wait for an endpoint to accept connections.
pub fn wait_for_socket(endpoint: Endpoint) -> SocketReachable {
    SocketReachable {
        endpoint,
        interval: DEFAULT_POLL_INTERVAL,
    }
}

/// Combine conditions; all of them must hold.
pub fn all(conditions: Vec<Box<dyn Condition>>) -> All {
    All { conditions }
}
