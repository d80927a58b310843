use std::io;
use std::path::PathBuf;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::classifier::FaultKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable machine tag for every failure the core reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidCredential,
    EngineMissing,
    SpawnFailure,
    EngineRuntimeError,
    UnexpectedTermination,
    PrivilegeRequired,
    ConfigWrite,
    SessionActive,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::EngineMissing => "ENGINE_MISSING",
            Self::SpawnFailure => "SPAWN_FAILURE",
            Self::EngineRuntimeError => "ENGINE_RUNTIME_ERROR",
            Self::UnexpectedTermination => "UNEXPECTED_TERMINATION",
            Self::PrivilegeRequired => "PRIVILEGE_REQUIRED",
            Self::ConfigWrite => "CONFIG_WRITE",
            Self::SessionActive => "SESSION_ACTIVE",
            Self::Cancelled => "CANCELLED",
            Self::Io => "IO",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid key: {0}")]
    InvalidCredential(String),

    #[error("Engine executable not found: {}", .0.display())]
    EngineMissing(PathBuf),

    #[error("Failed to launch engine: {0}")]
    SpawnFailure(#[source] io::Error),

    #[error("{message}")]
    EngineRuntime { kind: FaultKind, message: String },

    #[error("{0}")]
    PrivilegeRequired(String),

    #[error("Failed to write config {}: {source}", .path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("A session is already active")]
    SessionActive,

    #[error("Connection attempt was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Failed to render config: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidCredential(_) => ErrorKind::InvalidCredential,
            Error::EngineMissing(_) => ErrorKind::EngineMissing,
            Error::SpawnFailure(_) => ErrorKind::SpawnFailure,
            Error::EngineRuntime { .. } => ErrorKind::EngineRuntimeError,
            Error::PrivilegeRequired(_) => ErrorKind::PrivilegeRequired,
            Error::ConfigWrite { .. } | Error::Json(_) => ErrorKind::ConfigWrite,
            Error::SessionActive => ErrorKind::SessionActive,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn invalid(detail: impl Into<String>) -> Self {
        Error::InvalidCredential(detail.into())
    }
}

/// `TAG|detail` string kept in the status report.
pub(crate) fn err(kind: ErrorKind, detail: impl AsRef<str>) -> String {
    format!("{}|{}", kind.tag(), detail.as_ref())
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Error", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
