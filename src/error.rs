//! Error taxonomy for the ingestion pipeline.
//!
//! Each component reports its own error type; nothing here is allowed to
//! terminate the link reader or an ingestion worker. Binaries and startup code
//! use `anyhow` on top of these.

use std::path::PathBuf;

/// Why a frame was dropped by the decoder. Frames with these errors never
/// reach the orchestrator and produce no device acknowledgment.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid size declaration '{0}'")]
    InvalidSize(String),

    #[error("frame closed without a size declaration")]
    MissingSize,

    #[error("declared size {declared} exceeds limit of {limit} bytes")]
    SizeTooLarge { declared: usize, limit: usize },

    #[error("payload is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("payload exceeded limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("frame closed before any payload was sent")]
    ClosedWithoutData,
}

/// Failure of one recognition call.
#[derive(Debug, thiserror::Error)]
pub enum RecognitionFailure {
    #[error("recognition service unreachable: {0}")]
    Network(String),

    #[error("recognition request timed out")]
    Timeout,

    #[error("recognition service returned status {status}")]
    ServerError { status: u16 },

    #[error("malformed recognition response: {0}")]
    BadResponse(String),
}

impl RecognitionFailure {
    /// Short cause tag used in logs.
    pub fn cause_tag(&self) -> &'static str {
        match self {
            RecognitionFailure::Network(_) => "network",
            RecognitionFailure::Timeout => "timeout",
            RecognitionFailure::ServerError { .. } => "server_error",
            RecognitionFailure::BadResponse(_) => "bad_response",
        }
    }
}

/// Errors raised while driving one image through the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Writing the image to temporary storage failed. Fatal for that image.
    #[error("failed to stage image at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to archive {from} to {to}: {source}")]
    Placement {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist vehicle event: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("failed to acknowledge device: {0}")]
    Acknowledge(#[source] anyhow::Error),

    #[error("failed to enqueue notification: {0}")]
    Notify(String),
}
