use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SrError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("host error: {0}")]
    Host(String),
    #[error("daemon error [{code}]: {message}")]
    Daemon { code: ErrorCode, message: String },
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    Exec,
    Exception,
    NotFound,
    Arg,
    CfgValidation,
    CfgWrite,
    LogIo,
    DaemonUnreachable,
    IpcTimeout,
    IpcProtocol,
    Internal,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Exec => "E_EXEC",
            ErrorCode::Exception => "E_EXCEPTION",
            ErrorCode::NotFound => "E_NOT_FOUND",
            ErrorCode::Arg => "E_ARG",
            ErrorCode::CfgValidation => "E_CFG_VALIDATION",
            ErrorCode::CfgWrite => "E_CFG_WRITE",
            ErrorCode::LogIo => "E_LOG_IO",
            ErrorCode::DaemonUnreachable => "E_DAEMON_UNREACHABLE",
            ErrorCode::IpcTimeout => "E_IPC_TIMEOUT",
            ErrorCode::IpcProtocol => "E_IPC_PROTOCOL",
            ErrorCode::Internal => "E_INTERNAL",
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "E_EXEC" => ErrorCode::Exec,
            "E_EXCEPTION" => ErrorCode::Exception,
            "E_NOT_FOUND" => ErrorCode::NotFound,
            "E_ARG" => ErrorCode::Arg,
            "E_CFG_VALIDATION" => ErrorCode::CfgValidation,
            "E_CFG_WRITE" => ErrorCode::CfgWrite,
            "E_LOG_IO" => ErrorCode::LogIo,
            "E_DAEMON_UNREACHABLE" => ErrorCode::DaemonUnreachable,
            "E_IPC_TIMEOUT" => ErrorCode::IpcTimeout,
            "E_IPC_PROTOCOL" => ErrorCode::IpcProtocol,
            "E_INTERNAL" => ErrorCode::Internal,
            _ => ErrorCode::Other(value),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(value: ErrorCode) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
