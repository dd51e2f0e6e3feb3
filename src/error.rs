//! Error taxonomy for the capture transport.
//!
//! Library code returns [`CaptureError`]; the orchestrator and binaries wrap it
//! in `anyhow` with context. Which variants are fatal is decided by the caller:
//! the recording thread treats [`CaptureError::NetworkTermination`] as a normal
//! end of capture and only logs [`CaptureError::PacketWriteFailure`].

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to start target process: {0}")]
    SpawnFailure(String),

    #[error("failed to inject tracer into process {pid}: {reason}")]
    InjectionFailure { pid: u32, reason: String },

    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    #[error(
        "trace header mismatch: expected {expected}, got {actual}. \
         The tracer and vktrace-capture were probably built from different versions"
    )]
    VersionSkew { expected: String, actual: String },

    #[error("connection closed by peer")]
    NetworkTermination,

    #[error("could not connect to {address}:{port} after {attempts} attempts")]
    ConnectFailure {
        address: String,
        port: u16,
        attempts: u32,
    },

    #[error("fatal network error: {0}")]
    NetworkFailure(#[source] io::Error),

    #[error("incoming frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("failed to write {expected} byte packet at offset {offset}: {source}")]
    PacketWriteFailure {
        offset: u64,
        expected: usize,
        #[source]
        source: io::Error,
    },

    #[error("could not finalize portability table: {0}")]
    PortabilityFinalizeFailure(#[source] io::Error),

    #[error("invalid trace file: {0}")]
    InvalidTrace(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CaptureError {
    pub fn version_skew(expected: impl ToString, actual: impl ToString) -> Self {
        CaptureError::VersionSkew {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Errors that end a capture without indicating anything went wrong.
    pub fn is_clean_termination(&self) -> bool {
        matches!(self, CaptureError::NetworkTermination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_skew_message_mentions_build_mismatch() {
        let err = CaptureError::version_skew("112 bytes", "96 bytes");
        let msg = err.to_string();
        assert!(msg.contains("112 bytes"));
        assert!(msg.contains("different versions"));
    }

    #[test]
    fn test_clean_termination() {
        assert!(CaptureError::NetworkTermination.is_clean_termination());
        assert!(!CaptureError::HandshakeFailure("x".into()).is_clean_termination());
    }
}
