// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types for the connection pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of an inquiry scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("inquiry failed: {0}")]
    Radio(String),
}

/// Failure while querying a device's service table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("service query failed: {0}")]
pub struct DiagnosisError(pub String);

/// Failure to open a channel to a remote device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),
}

/// Errors returned by a connection session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("write failed: {0}")]
    Write(String),

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Errors returned by the session controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Failure to export the history buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    #[error("history is empty, nothing to export")]
    Empty,

    #[error("cannot write {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
}

/// Category attached to error events sent to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Discovery,
    Diagnosis,
    Connection,
    InvalidState,
    NotConnected,
    Decode,
    Export,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Discovery => "DiscoveryError",
            ErrorCategory::Diagnosis => "DiagnosisError",
            ErrorCategory::Connection => "ConnectionError",
            ErrorCategory::InvalidState => "InvalidStateError",
            ErrorCategory::NotConnected => "NotConnectedError",
            ErrorCategory::Decode => "DecodeError",
            ErrorCategory::Export => "ExportError",
        }
    }
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::InvalidState { .. } => ErrorCategory::InvalidState,
            SessionError::NotConnected => ErrorCategory::NotConnected,
            SessionError::Connection(_) | SessionError::Write(_) | SessionError::Cancelled => {
                ErrorCategory::Connection
            }
        }
    }
}

impl ControllerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ControllerError::AlreadyConnected(_) => ErrorCategory::InvalidState,
            ControllerError::Session(e) => e.category(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectionError::Timeout("no answer after 10s".to_string());
        assert_eq!(err.to_string(), "connection timed out: no answer after 10s");

        let err = SessionError::InvalidState {
            operation: "connect",
            state: "Connected".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cannot connect while session is Connected"
        );

        let err = ExportError::Io {
            path: PathBuf::from("/nope/out.csv"),
            message: "denied".to_string(),
        };
        assert_eq!(err.to_string(), "cannot write /nope/out.csv: denied");

        let err: SessionError = ConnectionError::Refused("busy".to_string()).into();
        assert_eq!(err.to_string(), "connection refused: busy");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(SessionError::NotConnected.category(), ErrorCategory::NotConnected);
        assert_eq!(
            ControllerError::AlreadyConnected("00:11:22:33:44:55".into()).category(),
            ErrorCategory::InvalidState
        );
        let err: ControllerError = SessionError::from(ConnectionError::RadioUnavailable(
            "adapter off".into(),
        ))
        .into();
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert_eq!(ErrorCategory::Diagnosis.as_str(), "DiagnosisError");
    }
}
