//! Error taxonomy for the upload pipeline
//!
//! Every failure a request can surface maps onto one [`ErrorCode`]. Worker
//! timeouts are deliberately absent: a worker that overruns its deadline is
//! killed by the supervisor and the client only sees the connection drop
//! (retry-safe, no artifact is produced).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Client-visible error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    PayloadRejected,
    UnsupportedFormat,
    CorruptInput,
    TransformFault,
    EncodeFault,
    #[serde(rename = "IOFault")]
    IoFault,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 6] = [
        ErrorCode::PayloadRejected,
        ErrorCode::UnsupportedFormat,
        ErrorCode::CorruptInput,
        ErrorCode::TransformFault,
        ErrorCode::EncodeFault,
        ErrorCode::IoFault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PayloadRejected => "PayloadRejected",
            ErrorCode::UnsupportedFormat => "UnsupportedFormat",
            ErrorCode::CorruptInput => "CorruptInput",
            ErrorCode::TransformFault => "TransformFault",
            ErrorCode::EncodeFault => "EncodeFault",
            ErrorCode::IoFault => "IOFault",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an upload was refused before touching disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    TooLarge { declared: u64, limit: u64 },
    MissingLength,
    LengthMismatch { declared: u64, actual: u64 },
    Empty,
    /// Body ended early or the connection failed mid-upload
    Unreadable,
    /// Body not delivered within the body timeout
    BodyTimeout { secs: u64 },
    DisallowedType(String),
    DisallowedExtension(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooLarge { declared, limit } => {
                write!(f, "declared size {} exceeds limit of {} bytes", declared, limit)
            }
            RejectReason::MissingLength => f.write_str("request must declare its content length"),
            RejectReason::LengthMismatch { declared, actual } => {
                write!(f, "declared size {} does not match received {} bytes", declared, actual)
            }
            RejectReason::Empty => f.write_str("empty payload"),
            RejectReason::Unreadable => f.write_str("request body could not be read"),
            RejectReason::BodyTimeout { secs } => write!(f, "request body not received within {}s", secs),
            RejectReason::DisallowedType(t) => write!(f, "content type '{}' is not accepted", t),
            RejectReason::DisallowedExtension(e) => write!(f, "file extension '{}' is not accepted", e),
        }
    }
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Payload rejected: {0}")]
    PayloadRejected(RejectReason),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt input: {0}")]
    CorruptInput(String),

    #[error("Stage '{stage}' failed: {reason}")]
    TransformFault { stage: String, reason: String },

    #[error("Encode failed: {0}")]
    EncodeFault(String),

    /// `context` names the operation, never a path
    #[error("Storage failure during {context}")]
    IoFault {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl MediaError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        MediaError::IoFault { context, source }
    }

    pub fn transform(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        MediaError::TransformFault {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            MediaError::PayloadRejected(_) => ErrorCode::PayloadRejected,
            MediaError::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            MediaError::CorruptInput(_) => ErrorCode::CorruptInput,
            MediaError::TransformFault { .. } => ErrorCode::TransformFault,
            MediaError::EncodeFault(_) => ErrorCode::EncodeFault,
            MediaError::IoFault { .. } => ErrorCode::IoFault,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_fault_hides_paths() {
        let err = MediaError::io(
            "stage upload",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "/srv/uploads/x: denied"),
        );
        assert_eq!(err.code(), ErrorCode::IoFault);
        assert!(!err.to_string().contains("/srv"));
    }

    #[test]
    fn test_code_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&ErrorCode::IoFault).unwrap();
        assert_eq!(json, "\"IOFault\"");
        for code in ErrorCode::ALL {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.as_str());
        }
    }

    #[test]
    fn test_reject_reason_message() {
        let err = MediaError::PayloadRejected(RejectReason::TooLarge { declared: 11, limit: 10 });
        assert_eq!(err.code(), ErrorCode::PayloadRejected);
        assert!(err.to_string().contains("exceeds limit of 10 bytes"));
    }
}
