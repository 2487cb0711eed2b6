// Copyright 2020 Joyent, Inc.

//! Error types surfaced to callers.

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a failure reported in an answer's error field.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Validation,
    Authorization,
    NotFound,
    AlreadyExists,
    Protocol,
    Backend,
    Canceled,
}

/// Server-side failure, carried verbatim to the caller in the answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new<S: Into<String>>(kind: FaultKind, message: S) -> Fault {
        Fault {
            kind,
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Fault {
        Fault::new(FaultKind::Validation, message)
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Fault {
        Fault::new(FaultKind::Authorization, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Fault {
        Fault::new(FaultKind::NotFound, message)
    }

    pub fn protocol<S: Into<String>>(message: S) -> Fault {
        Fault::new(FaultKind::Protocol, message)
    }

    pub fn backend<S: Into<String>>(message: S) -> Fault {
        Fault::new(FaultKind::Backend, message)
    }

    pub fn canceled() -> Fault {
        Fault::new(FaultKind::Canceled, "operation was canceled")
    }
}

impl From<std::io::Error> for Fault {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Fault::not_found(error.to_string()),
            std::io::ErrorKind::AlreadyExists => {
                Fault::new(FaultKind::AlreadyExists, error.to_string())
            }
            std::io::ErrorKind::PermissionDenied => Fault::unauthorized(error.to_string()),
            _ => Fault::backend(error.to_string()),
        }
    }
}

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("operation was canceled")]
    Canceled,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("access denied: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault.kind {
            FaultKind::Validation => Error::Validation(fault.message),
            FaultKind::Authorization => Error::Unauthorized(fault.message),
            FaultKind::NotFound => Error::NotFound(fault.message),
            FaultKind::AlreadyExists => Error::AlreadyExists(fault.message),
            FaultKind::Protocol => Error::Protocol(fault.message),
            FaultKind::Backend => Error::Remote(fault.message),
            FaultKind::Canceled => Error::Canceled,
        }
    }
}

/// Result type alias using the crate `Error`.
pub type Result<T> = std::result::Result<T, Error>;
