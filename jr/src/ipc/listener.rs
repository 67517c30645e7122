//! Daemon side of the control socket

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::frame::{read_frame_bytes, write_frame};
use super::messages::{ControlCommand, ControlResponse};
use crate::engine::EngineHandle;

/// How long a connected client may take to send its request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors setting up the control socket
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Cannot create socket directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} exists and is not a socket; refusing to replace it", .0.display())]
    NotASocket(PathBuf),

    #[error("Cannot remove leftover control socket {}: {source}", path.display())]
    Leftover {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot bind control socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Bind the daemon's control socket
///
/// A socket file left behind by an earlier daemon is replaced; the caller
/// must hold the master lock. Any other kind of file at the path is an error.
pub fn bind_control_socket(socket_path: &Path) -> Result<UnixListener, SocketError> {
    debug!(?socket_path, "bind_control_socket: called");
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SocketError::Directory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    match std::fs::symlink_metadata(socket_path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(?socket_path, "bind_control_socket: replacing leftover socket");
            std::fs::remove_file(socket_path).map_err(|source| SocketError::Leftover {
                path: socket_path.to_path_buf(),
                source,
            })?;
        }
        Ok(_) => return Err(SocketError::NotASocket(socket_path.to_path_buf())),
        Err(_) => {}
    }

    let listener = UnixListener::bind(socket_path).map_err(|source| SocketError::Bind {
        path: socket_path.to_path_buf(),
        source,
    })?;
    info!(?socket_path, "Control socket bound");
    Ok(listener)
}

/// Remove the control socket file; a missing file is fine
pub fn remove_socket_file(socket_path: &Path) {
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!(?socket_path, "remove_socket_file: removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(?socket_path, error = %e, "Failed to remove control socket"),
    }
}

/// Accept connections one at a time and forward their commands to the engine
///
/// Runs until the task is aborted.
pub async fn serve(listener: UnixListener, engine: EngineHandle) {
    info!("Control socket listening");
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("serve: connection accepted");
                if let Err(e) = handle_connection(stream, &engine).await {
                    warn!(error = %e, "Control connection error");
                }
            }
            Err(e) => {
                warn!(error = %e, "Control socket accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, engine: &EngineHandle) -> Result<()> {
    let payload = tokio::time::timeout(REQUEST_TIMEOUT, read_frame_bytes(&mut stream))
        .await
        .context("Request timeout")?
        .context("Failed to read request")?;

    let response = match ControlCommand::from_json(&payload) {
        Ok(command) => {
            debug!(?command, "handle_connection: dispatching");
            match engine.request(command).await {
                Ok(response) => response,
                Err(e) => ControlResponse::error(e.to_string()),
            }
        }
        Err(e) => {
            warn!(error = %e, "Rejected control request");
            ControlResponse::error(e.to_string())
        }
    };

    write_frame(&mut stream, &response)
        .await
        .context("Failed to write response")?;
    debug!(is_error = response.is_error(), "handle_connection: response sent");
    Ok(())
}
