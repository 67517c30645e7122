//! Client side of the control socket

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::frame::{FrameError, read_frame, write_frame};
use super::listener::remove_socket_file;
use super::messages::{ControlCommand, ControlResponse};
use crate::health::HealthReport;

/// Default timeout for control operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Daemon is not running (no socket at {})", .0.display())]
    NotRunning(PathBuf),

    #[error("Daemon did not answer within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Unexpected response: {0:?}")]
    Unexpected(Box<ControlResponse>),
}

/// What is behind the socket path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// A daemon answered PING
    Alive,
    /// Something accepted the connection but gave no valid answer in time
    Busy,
    /// The socket file existed but nobody listens on it; it has been removed
    Stale,
    /// No socket file
    Absent,
}

/// Client for the daemon's control socket
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send one command and wait for the reply
    pub async fn send(&self, command: &ControlCommand) -> Result<ControlResponse, ClientError> {
        debug!(socket_path = ?self.socket_path, ?command, "ControlClient::send: called");
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                    ClientError::NotRunning(self.socket_path.clone())
                }
                _ => ClientError::Io(e),
            })?;
            write_frame(&mut stream, &command.to_request()).await?;
            let response: ControlResponse = read_frame(&mut stream).await?;
            Ok::<_, ClientError>(response)
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        debug!(?response, "ControlClient::send: received response");
        Ok(response)
    }

    /// Send a command whose answer is text
    pub async fn text(&self, command: &ControlCommand) -> Result<String, ClientError> {
        match self.send(command).await? {
            ControlResponse::Text(body) => Ok(body),
            ControlResponse::Error(message) => Err(ClientError::Daemon(message)),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.text(&ControlCommand::Ping).await?.as_str() {
            "PONG" => Ok(()),
            other => Err(ClientError::Unexpected(Box::new(ControlResponse::text(other)))),
        }
    }

    pub async fn report(&self) -> Result<HealthReport, ClientError> {
        match self.send(&ControlCommand::Report).await? {
            ControlResponse::Report(report) => Ok(report),
            ControlResponse::Error(message) => Err(ClientError::Daemon(message)),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Find out whether a daemon owns the socket
    ///
    /// The socket is removed only when connecting is refused; a listener
    /// that is slow to answer keeps its socket.
    pub async fn probe(&self) -> ServerState {
        if !self.socket_exists() {
            return ServerState::Absent;
        }
        match self.ping().await {
            Ok(()) => ServerState::Alive,
            Err(ClientError::NotRunning(_)) => {
                warn!(socket_path = ?self.socket_path, "Removing stale control socket");
                remove_socket_file(&self.socket_path);
                ServerState::Stale
            }
            Err(e) => {
                warn!(socket_path = ?self.socket_path, error = %e, "Control socket is in use but did not answer");
                ServerState::Busy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::frame::read_frame_bytes;
    use crate::ipc::listener::bind_control_socket;
    use tempfile::TempDir;

    #[test]
    fn test_client_with_timeout() {
        let client = ControlClient::new("/tmp/x.sock").with_timeout(Duration::from_secs(10));
        assert_eq!(client.timeout, Duration::from_secs(10));
        assert_eq!(client.socket_path(), Path::new("/tmp/x.sock"));
    }

    #[tokio::test]
    async fn test_missing_socket_is_not_running() {
        let temp = TempDir::new().unwrap();
        let client = ControlClient::new(temp.path().join("none.sock"));
        assert!(matches!(client.ping().await, Err(ClientError::NotRunning(_))));
        assert_eq!(client.probe().await, ServerState::Absent);
    }

    #[tokio::test]
    async fn test_silent_server_is_busy_and_keeps_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("jr.sock");
        let listener = bind_control_socket(&socket_path).unwrap();

        // Accepts and reads, never answers
        let silent = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame_bytes(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ControlClient::new(&socket_path).with_timeout(Duration::from_millis(200));
        assert!(matches!(client.ping().await, Err(ClientError::Timeout(_))));
        assert_eq!(client.probe().await, ServerState::Busy);
        assert!(socket_path.exists());
        silent.abort();
    }

    #[tokio::test]
    async fn test_socket_file_without_listener_is_stale() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("jr.sock");
        {
            drop(bind_control_socket(&socket_path).unwrap());
        }
        assert!(socket_path.exists());

        let client = ControlClient::new(&socket_path);
        assert!(matches!(client.ping().await, Err(ClientError::NotRunning(_))));
        assert_eq!(client.probe().await, ServerState::Stale);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_ping_against_mock_daemon() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("jr.sock");
        let listener = bind_control_socket(&socket_path).unwrap();

        let mock = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let payload = read_frame_bytes(&mut stream).await.unwrap();
            assert_eq!(
                ControlCommand::from_json(&payload).unwrap(),
                ControlCommand::Ping
            );
            write_frame(&mut stream, &ControlResponse::text("PONG")).await.unwrap();
        });

        let client = ControlClient::new(&socket_path);
        client.ping().await.unwrap();
        mock.await.unwrap();
    }
}
