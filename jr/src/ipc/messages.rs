//! Control protocol messages
//!
//! A request is a JSON array `["COMMAND", [args...]]`. A response is
//! `{"type": "Text" | "Report" | "Error", "body": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::health::HealthReport;

/// Wire envelope of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request(pub String, pub Vec<Value>);

/// Errors turning a request envelope into a command
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command} takes {expected} argument(s), got {got}")]
    ArgCount {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{command}: argument {index} must be {expected}")]
    BadArgument {
        command: &'static str,
        index: usize,
        expected: &'static str,
    },
}

/// Commands the daemon accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Ping,
    Reload,
    Pause,
    Resume,
    Quit,
    Kill,
    RunJob { name: String, with_deps: bool },
    ShowJob { name: String },
    Status,
    Report,
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Ping => "PING",
            ControlCommand::Reload => "RELOAD",
            ControlCommand::Pause => "PAUSE",
            ControlCommand::Resume => "RESUME",
            ControlCommand::Quit => "QUIT",
            ControlCommand::Kill => "KILL",
            ControlCommand::RunJob { .. } => "RUNJOB",
            ControlCommand::ShowJob { .. } => "SHOWJOB",
            ControlCommand::Status => "STATUS",
            ControlCommand::Report => "REPORT",
        }
    }

    pub fn to_request(&self) -> Request {
        let args = match self {
            ControlCommand::RunJob { name, with_deps } => vec![Value::from(name.as_str()), Value::from(*with_deps)],
            ControlCommand::ShowJob { name } => vec![Value::from(name.as_str())],
            _ => Vec::new(),
        };
        Request(self.name().to_string(), args)
    }

    /// Decode a request; command names are case-insensitive
    pub fn from_request(request: Request) -> Result<Self, ProtocolError> {
        let Request(name, args) = request;
        let command = match name.to_ascii_uppercase().as_str() {
            "PING" => no_args("PING", &args, ControlCommand::Ping)?,
            "RELOAD" => no_args("RELOAD", &args, ControlCommand::Reload)?,
            "PAUSE" => no_args("PAUSE", &args, ControlCommand::Pause)?,
            "RESUME" => no_args("RESUME", &args, ControlCommand::Resume)?,
            "QUIT" => no_args("QUIT", &args, ControlCommand::Quit)?,
            "KILL" => no_args("KILL", &args, ControlCommand::Kill)?,
            "STATUS" => no_args("STATUS", &args, ControlCommand::Status)?,
            "REPORT" => no_args("REPORT", &args, ControlCommand::Report)?,
            "SHOWJOB" => {
                arg_count("SHOWJOB", &args, 1)?;
                ControlCommand::ShowJob {
                    name: string_arg("SHOWJOB", &args, 0)?,
                }
            }
            "RUNJOB" => {
                arg_count("RUNJOB", &args, 2)?;
                ControlCommand::RunJob {
                    name: string_arg("RUNJOB", &args, 0)?,
                    with_deps: bool_arg("RUNJOB", &args, 1)?,
                }
            }
            _ => return Err(ProtocolError::UnknownCommand(name)),
        };
        Ok(command)
    }

    /// Decode a raw JSON payload
    pub fn from_json(payload: &[u8]) -> Result<Self, ProtocolError> {
        let request: Request =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_request(request)
    }
}

fn no_args(command: &'static str, args: &[Value], cmd: ControlCommand) -> Result<ControlCommand, ProtocolError> {
    arg_count(command, args, 0)?;
    Ok(cmd)
}

fn arg_count(command: &'static str, args: &[Value], expected: usize) -> Result<(), ProtocolError> {
    if args.len() != expected {
        return Err(ProtocolError::ArgCount {
            command,
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn string_arg(command: &'static str, args: &[Value], index: usize) -> Result<String, ProtocolError> {
    args[index]
        .as_str()
        .map(String::from)
        .ok_or(ProtocolError::BadArgument {
            command,
            index,
            expected: "a string",
        })
}

/// Booleans, or 0/1 as older clients send them
fn bool_arg(command: &'static str, args: &[Value], index: usize) -> Result<bool, ProtocolError> {
    match &args[index] {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
        _ => Err(ProtocolError::BadArgument {
            command,
            index,
            expected: "a boolean",
        }),
    }
}

/// Daemon reply to one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ControlResponse {
    Text(String),
    Report(HealthReport),
    Error(String),
}

impl ControlResponse {
    pub fn text(body: impl Into<String>) -> Self {
        ControlResponse::Text(body.into())
    }

    pub fn error(body: impl Into<String>) -> Self {
        ControlResponse::Error(body.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControlResponse::Error(_))
    }
}
