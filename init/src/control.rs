//! Control API for operators.
//!
//! A line-delimited JSON protocol over TCP: the client sends one
//! [`ControlRequest`] per line and reads one [`ControlResponse`] line back.
//! When the user data sets `security.token`, every request must carry it.
//! Without a token the kubeconfig is never served.

use crate::constants::ADMIN_KUBECONFIG;
use crate::error::{Error, Result};
use crate::service::ServiceStatus;
use crate::supervisor::Supervisor;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest request line the server buffers.
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

/// Commands understood by the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Check that init is responding
    Ping,
    /// Fetch the cluster admin kubeconfig
    Kubeconfig,
    /// Status of all services
    Status,
}

/// A command together with the caller's credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub command: ControlCommand,
}

/// Response from the init process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command failed
    Error { message: String },
    /// Pong response
    Pong,
    /// Contents of the admin kubeconfig
    Kubeconfig { contents: String },
    /// Service statuses
    Status { services: Vec<ServiceStatus> },
}

/// Serves the control API (runs in the init process)
pub struct ControlServer {
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
    token: Option<String>,
    kubeconfig: PathBuf,
}

impl ControlServer {
    /// Bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        token: Option<String>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Control API listening");
        if token.is_none() {
            warn!("No control token configured, kubeconfig requests will be refused");
        }
        Ok(Self {
            listener,
            supervisor,
            token,
            kubeconfig: PathBuf::from(ADMIN_KUBECONFIG),
        })
    }

    /// Serve the kubeconfig from another location.
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = path.into();
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `stop` is cancelled.
    pub async fn serve(self, stop: CancellationToken) {
        let handler = Arc::new(Handler {
            supervisor: self.supervisor,
            token: self.token,
            kubeconfig: self.kubeconfig,
        });

        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = stop.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted control connection");
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            warn!(peer = %peer, error = %e, "Control connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept control connection"),
            }
        }

        debug!("Control API stopped");
    }
}

struct Handler {
    supervisor: Arc<Supervisor>,
    token: Option<String>,
    kubeconfig: PathBuf,
}

impl Handler {
    async fn handle(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_LEN));

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
                Err(_) => {
                    warn!("Dropping control connection with oversized request");
                    let response = ControlResponse::Error {
                        message: format!("Request exceeds {} bytes", MAX_REQUEST_LEN),
                    };
                    return write_response(&mut writer, &response).await;
                }
            };

            let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
                Ok(request) => self.respond(request).await,
                Err(e) => ControlResponse::Error {
                    message: format!("Failed to parse request: {}", e),
                },
            };
            write_response(&mut writer, &response).await?;
        }
        Ok(())
    }

    fn is_authorized(&self, request: &ControlRequest) -> bool {
        match (&self.token, &request.command) {
            (Some(expected), _) => request.token.as_deref() == Some(expected.as_str()),
            (None, ControlCommand::Kubeconfig) => false,
            (None, _) => true,
        }
    }

    async fn respond(&self, request: ControlRequest) -> ControlResponse {
        if !self.is_authorized(&request) {
            warn!(command = ?request.command, "Rejected unauthorized control request");
            return ControlResponse::Error {
                message: Error::Unauthorized.to_string(),
            };
        }

        debug!(command = ?request.command, "Received control command");
        match request.command {
            ControlCommand::Ping => ControlResponse::Pong,
            ControlCommand::Kubeconfig => match tokio::fs::read_to_string(&self.kubeconfig).await {
                Ok(contents) => ControlResponse::Kubeconfig { contents },
                Err(e) => ControlResponse::Error {
                    message: format!("Failed to read {}: {}", self.kubeconfig.display(), e),
                },
            },
            ControlCommand::Status => ControlResponse::Status {
                services: self.supervisor.statuses().await,
            },
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &ControlResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Control API client (used by nodectl)
pub struct ControlClient {
    addr: String,
    token: Option<String>,
}

impl ControlClient {
    pub fn new(addr: impl Into<String>, token: Option<String>) -> Self {
        Self {
            addr: addr.into(),
            token,
        }
    }

    /// Send a command and receive a response
    pub async fn send_command(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            Error::Control(format!("Failed to connect to {}: {}", self.addr, e))
        })?;

        let request = ControlRequest {
            token: self.token.clone(),
            command,
        };
        let json = serde_json::to_string(&request)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Failed to parse response: {}", e)))?;

        match response {
            ControlResponse::Error { message } => Err(Error::Control(message)),
            response => Ok(response),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.send_command(ControlCommand::Ping).await? {
            ControlResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn kubeconfig(&self) -> Result<String> {
        match self.send_command(ControlCommand::Kubeconfig).await? {
            ControlResponse::Kubeconfig { contents } => Ok(contents),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<Vec<ServiceStatus>> {
        match self.send_command(ControlCommand::Status).await? {
            ControlResponse::Status { services } => Ok(services),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: ControlResponse) -> Error {
    Error::Control(format!("Unexpected response: {:?}", response))
}
