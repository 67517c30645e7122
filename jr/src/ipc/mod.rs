//! Control socket
//!
//! Local Unix socket through which operators and monitoring talk to the
//! daemon. Every message is one frame: a 4-byte big-endian length followed
//! by that many bytes of JSON. A connection carries one request and one
//! response.

use std::path::PathBuf;

pub mod client;
pub mod frame;
pub mod listener;
pub mod messages;

pub use client::{ClientError, ControlClient, ServerState};
pub use frame::{FrameError, MAX_FRAME_LEN, read_frame, write_frame};
pub use listener::{SocketError, bind_control_socket, remove_socket_file, serve};
pub use messages::{ControlCommand, ControlResponse, ProtocolError, Request};

/// Default socket path
///
/// Prefers the per-user runtime directory, then the local data directory.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("jobrunner")
        .join("jr.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_ends_with_jr_sock() {
        let path = default_socket_path();
        assert!(path.ends_with("jobrunner/jr.sock"));
    }
}
