//! # clusterflow core
//!
//! Core traits and types for the two-lane cluster pipeline host.
//!
//! Raw pixel and strip cluster words are streamed into an accelerator,
//! pass through a fixed-function pipeline, and the results are read back
//! into host memory. This crate owns everything between the parsed input
//! and the timing report.
//!
//! ## Core Abstractions
//!
//! - [`WordStream`] - Bounded sequence of 64-bit input words
//! - [`ComputeBackend`] - Device capability set with an out-of-order channel
//! - [`DeviceSession`] - One device, one channel, one loaded program
//! - [`Lane`] - Buffers and stages of the pixel or strip track
//! - [`ExecutionEngine`] - Submits the dependency-ordered operation graph
//! - [`TimingReport`] - Six per-stage durations from a drained run
//!
//! ## Example
//!
//! ```ignore
//! use clusterflow_core::prelude::*;
//!
//! let session = DeviceSession::open_path(backend, &config, "pipeline.xclbin")?;
//! let mut pixel = Lane::new(&session, LaneKind::Pixel, &config)?;
//! let mut strip = Lane::new(&session, LaneKind::Strip, &config)?;
//! let outcome = ExecutionEngine::new(&session, &config)
//!     .run(&mut [LaneJob::new(&mut pixel, &pixels), LaneJob::new(&mut strip, &strips)])
//!     .await?;
//! print!("{}", outcome.timing);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod backend_stub;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lane;
pub mod session;
pub mod stream;
pub mod timing;

/// Recording fake backend for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{
        AccessMode, BackendKind, BufferHandle, ComputeBackend, DeviceId, DeviceInfo, EventHandle,
        OpKind, OpTimestamps, PlatformInfo, StageHandle,
    };
    pub use crate::config::{
        align_next, BufferLayout, DeviceClass, LaneGeometry, LaneStages, PipelineConfig,
        PipelineConfigBuilder, StageArgSpec,
    };
    pub use crate::engine::{ExecutionEngine, LaneJob, RunOutcome};
    pub use crate::error::*;
    pub use crate::graph::{OperationGraph, OperationRecord};
    pub use crate::lane::{Lane, LaneKind, LaneState};
    pub use crate::session::{select_device, DeviceSession};
    pub use crate::stream::{validate, validate_against, WordStream};
    pub use crate::timing::{LaneTiming, TimingReport};
}

// Re-exports for convenience
pub use backend::{BackendKind, ComputeBackend, OpKind};
pub use config::PipelineConfig;
pub use engine::{ExecutionEngine, LaneJob, RunOutcome};
pub use error::{ClusterFlowError, Result};
pub use lane::{Lane, LaneKind, LaneState};
pub use session::DeviceSession;
pub use stream::WordStream;
pub use timing::TimingReport;
