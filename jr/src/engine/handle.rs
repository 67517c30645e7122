//! Handle for talking to the running engine

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::ipc::{ControlCommand, ControlResponse};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is not running")]
    ChannelError,
}

/// A command together with where to send the answer
#[derive(Debug)]
pub struct EngineRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<ControlResponse>,
}

/// Cloneable sender side of the engine's command channel
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<EngineRequest>) -> Self {
        Self { tx }
    }

    /// Submit a command and wait for the engine's answer
    pub async fn request(&self, command: ControlCommand) -> Result<ControlResponse, EngineError> {
        debug!(?command, "EngineHandle::request: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelError)?;
        reply_rx.await.map_err(|_| EngineError::ChannelError)
    }

    pub async fn reload(&self) -> Result<ControlResponse, EngineError> {
        self.request(ControlCommand::Reload).await
    }

    pub async fn quit(&self) -> Result<ControlResponse, EngineError> {
        self.request(ControlCommand::Quit).await
    }

    /// Whether the engine has stopped taking commands
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
