//! Error types for clusterflow.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::OpKind;
use crate::lane::LaneKind;

/// Result type alias for clusterflow operations.
pub type Result<T> = std::result::Result<T, ClusterFlowError>;

/// Errors raised anywhere between reading input and reporting timings.
///
/// Every variant is fatal for the run: nothing in the pipeline retries or
/// reports partial results.
#[derive(Error, Debug)]
pub enum ClusterFlowError {
    /// A hex input line could not be decoded.
    #[error("{reason} in file {} at line {line}: \"{content}\"", .path.display())]
    InputFormat {
        /// Input file.
        path: PathBuf,
        /// 1-indexed line number.
        line: usize,
        /// Trimmed offending line.
        content: String,
        /// What was wrong with the line.
        reason: String,
    },

    /// An input file could not be opened or read.
    #[error("Failed to read input file {}: {source}", .path.display())]
    InputIo {
        /// Input file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A stream is longer than its lane accepts.
    #[error("{lane} input size {len} exceeds lane capacity of {capacity} words")]
    CapacityExceeded {
        /// Target lane.
        lane: LaneKind,
        /// Stream length in words.
        len: usize,
        /// Configured capacity in words.
        capacity: usize,
    },

    /// No device matched the platform and device class filters.
    #[error("No {platform} platform / {class} device found")]
    DeviceNotFound {
        /// Platform name filter.
        platform: String,
        /// Device class filter.
        class: String,
    },

    /// The accelerator image could not be read or loaded.
    #[error("Failed to load accelerator image {image}: {reason}")]
    ProgramLoadFailed {
        /// Image path or label.
        image: String,
        /// Reason reported by the loader.
        reason: String,
    },

    /// The loaded program has no stage with this name.
    #[error("Failed to create stage: {0}")]
    StageNotFound(String),

    /// Device buffer allocation failed.
    #[error("Failed to allocate {size} byte buffer: {reason}")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Reason reported by the backend.
        reason: String,
    },

    /// A stage argument could not be bound.
    #[error("Failed to set argument {slot} for stage {stage}: {reason}")]
    BindFailed {
        /// Stage name.
        stage: String,
        /// Argument slot.
        slot: u32,
        /// Reason reported by the backend.
        reason: String,
    },

    /// The channel rejected an enqueue.
    #[error("Enqueue of {op} for {lane} lane failed: {reason}")]
    Submission {
        /// Lane the operation belongs to.
        lane: LaneKind,
        /// Operation kind.
        op: OpKind,
        /// Reason reported by the backend.
        reason: String,
    },

    /// The drain reported a failed operation or timed out.
    #[error("Completion failed: {0}")]
    Completion(String),

    /// Timestamps were requested for an operation that has not completed.
    #[error("Timing unavailable for {op} of {lane} lane")]
    TimingUnavailable {
        /// Lane the operation belongs to.
        lane: LaneKind,
        /// Operation kind.
        op: OpKind,
    },

    /// A recorded operation graph does not have the per-lane chain shape.
    #[error("Invalid operation graph: {0}")]
    InvalidGraph(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested backend was not compiled in.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// Backend-specific failure outside the categories above.
    #[error("Backend error: {0}")]
    BackendError(String),
}

impl ClusterFlowError {
    /// Returns `true` for errors raised before any device interaction.
    pub fn is_host_side(&self) -> bool {
        matches!(
            self,
            Self::InputFormat { .. }
                | Self::InputIo { .. }
                | Self::CapacityExceeded { .. }
                | Self::InvalidConfig(_)
        )
    }
}
