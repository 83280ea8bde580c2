//! Request intake: a local stream socket speaking newline-JSON.
//!
//! The front-end reports per-request outcomes over a Unix socket; each
//! line is one request and receives exactly one JSON response line.
//! Connections are handled concurrently and mutations serialize on the
//! tracker's lock, so requests within one connection are processed in
//! order while connections proceed independently.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownToken;
use crate::tracker::Tracker;

/// One request line from the front-end.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// "failure" or "success"
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub domain: String,
    /// Failure classification: "invalid_solution", "timeout", "hmac_failed".
    #[serde(default)]
    pub reason: String,
    /// Informational only.
    #[serde(default)]
    pub timestamp: String,
}

/// One response line to the front-end.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub strike_count: u32,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    fn counted(strike_count: u32, blocked: bool) -> Self {
        Self {
            strike_count,
            blocked,
            message: None,
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            strike_count: 0,
            blocked: false,
            message: Some(message.to_string()),
        }
    }
}

pub struct IntakeServer {
    socket_path: PathBuf,
    listener: UnixListener,
    tracker: Arc<Tracker>,
}

impl IntakeServer {
    /// Bind the socket, replacing any stale path from a previous run.
    ///
    /// The parent directory is created 0755 and the socket opened to
    /// 0666 so the front-end, running under a different account, can
    /// connect.
    pub fn bind(socket_path: &Path, tracker: Arc<Tracker>) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind socket {}", socket_path.display()))?;

        if let Err(e) =
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))
        {
            warn!(error = %e, "socket_chmod_failed");
        }

        info!(path = %socket_path.display(), "socket_listening");
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            tracker,
        })
    }

    /// Accept connections until shutdown, then drain in-flight handlers
    /// and unlink the socket path.
    pub async fn run(self, mut shutdown: ShutdownToken) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let tracker = self.tracker.clone();
                        handlers.spawn(handle_connection(stream, tracker));
                    }
                    Err(e) => {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        warn!(error = %e, "socket_accept_failed");
                    }
                }
            }
        }

        // Stop accepting before waiting out the in-flight handlers.
        drop(self.listener);
        while handlers.join_next().await.is_some() {}

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "socket_unlink_failed");
        }
        info!("socket_server_stopped");
    }
}

async fn handle_connection(stream: UnixStream, tracker: Arc<Tracker>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => dispatch(&tracker, request).await,
                    Err(e) => {
                        warn!(error = %e, data = %line, "invalid_socket_message");
                        Response::rejected("invalid JSON")
                    }
                };

                if send_response(&mut write_half, &response).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "socket_read_error");
                break;
            }
        }
    }
}

async fn dispatch(tracker: &Tracker, request: Request) -> Response {
    match request.kind.as_str() {
        "failure" => {
            let (strike_count, blocked) = tracker
                .record_failure(&request.ip, &request.domain, &request.reason)
                .await;
            Response::counted(strike_count, blocked)
        }
        "success" => {
            tracker.record_success(&request.ip, &request.domain).await;
            Response::counted(0, false)
        }
        other => {
            warn!(kind = other, "unknown_message_type");
            Response::rejected("unknown message type")
        }
    }
}

async fn send_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut data = serde_json::to_vec(response).context("failed to encode response")?;
    data.push(b'\n');
    writer
        .write_all(&data)
        .await
        .context("failed to write response")?;
    Ok(())
}
