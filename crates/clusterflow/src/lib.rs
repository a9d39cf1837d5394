//! # clusterflow
//!
//! Host side of a two-lane accelerator pipeline for pixel and strip
//! cluster streams.
//!
//! One event's raw pixel and strip words are read from hex files, checked
//! against the lane capacities, streamed to the accelerator, pushed through
//! each lane's start and end stages and read back. Both lanes run
//! concurrently on one out-of-order channel; the host blocks exactly once
//! and then reports six per-stage durations.
//!
//! ## Quick Start
//!
//! ```ignore
//! use clusterflow::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut flow = ClusterFlow::builder()
//!         .backend(BackendKind::Sim)
//!         .build()?;
//!
//!     let run = flow
//!         .run_paths("pipeline.xclbin", "pixel.txt", "strip.txt")
//!         .await?;
//!     print!("{}", run.timing());
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! - **Sim** - Simulated accelerator (always available)
//! - **OpenCL** - Real devices through an ICD loader (requires `opencl` feature)
//!
//! ```toml
//! [dependencies]
//! clusterflow = { version = "0.1", features = ["opencl"] }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! pixel.txt ──► WordStream ──► Lane(Pixel) ──┐
//!                                            ├──► ExecutionEngine ──► drain ──► TimingReport
//! strip.txt ──► WordStream ──► Lane(Strip) ──┘          │
//!                                                DeviceSession ──► ComputeBackend
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

// Re-export the workspace crates
pub use clusterflow_core as core;
pub use clusterflow_opencl as opencl;
pub use clusterflow_sim as sim;

use clusterflow_core::backend::{BackendKind, ComputeBackend, DeviceInfo};
use clusterflow_core::config::PipelineConfig;
use clusterflow_core::engine::{ExecutionEngine, LaneJob, RunOutcome};
use clusterflow_core::error::Result;
use clusterflow_core::lane::{Lane, LaneKind};
use clusterflow_core::session::DeviceSession;
use clusterflow_core::stream::{validate_against, WordStream};
use clusterflow_core::timing::TimingReport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{create_backend, ClusterFlow, ClusterFlowBuilder, PipelineRun};
    pub use clusterflow_core::prelude::*;
    pub use clusterflow_sim::{SimBackend, SimConfig, SimImage};
}

/// Instantiate a backend by kind.
///
/// The OpenCL backend fails with `BackendUnavailable` unless the `opencl`
/// feature is enabled.
pub fn create_backend(kind: BackendKind) -> Result<Arc<dyn ComputeBackend>> {
    let backend: Arc<dyn ComputeBackend> = match kind {
        BackendKind::Sim => Arc::new(clusterflow_sim::SimBackend::new()),
        BackendKind::OpenCl => Arc::new(clusterflow_opencl::OpenClBackend::new()?),
    };
    info!(backend = %kind, "Backend created");
    Ok(backend)
}

/// Everything one completed run produced.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Operation graph and timings.
    pub outcome: RunOutcome,
    /// Pixel result buffer.
    pub pixel_output: Vec<u32>,
    /// Strip result buffer.
    pub strip_output: Vec<u32>,
    /// Platform the run executed on.
    pub platform: String,
    /// Device the run executed on.
    pub device: DeviceInfo,
}

impl PipelineRun {
    /// The six per-stage durations.
    pub fn timing(&self) -> &TimingReport {
        &self.outcome.timing
    }

    /// Result buffer of one lane.
    pub fn output(&self, kind: LaneKind) -> &[u32] {
        match kind {
            LaneKind::Pixel => &self.pixel_output,
            LaneKind::Strip => &self.strip_output,
        }
    }
}

/// Session and lanes kept between runs on the same image.
struct Attached {
    image: PathBuf,
    session: DeviceSession,
    pixel: Lane,
    strip: Lane,
}

impl Attached {
    fn open(
        backend: Arc<dyn ComputeBackend>,
        config: &PipelineConfig,
        image: &Path,
    ) -> Result<Self> {
        let session = DeviceSession::open_path(backend, config, image)?;
        let pixel = Lane::new(&session, LaneKind::Pixel, config)?;
        let strip = match Lane::new(&session, LaneKind::Strip, config) {
            Ok(strip) => strip,
            Err(e) => {
                if let Err(release) = pixel.release(&session) {
                    warn!(error = %release, "Failed to release pixel lane");
                }
                return Err(e);
            }
        };
        Ok(Self {
            image: image.to_path_buf(),
            session,
            pixel,
            strip,
        })
    }

    fn detach(self) {
        let Self {
            image,
            session,
            pixel,
            strip,
        } = self;
        for lane in [pixel, strip] {
            let kind = lane.kind();
            if let Err(e) = lane.release(&session) {
                warn!(lane = %kind, error = %e, "Failed to release lane buffers");
            }
        }
        debug!(image = %image.display(), "Session detached");
    }
}

/// Pipeline host facade.
///
/// Holds a backend and a validated configuration. The device session and
/// both lanes are opened by the first run and reused by later runs on the
/// same image path, so lane buffers are allocated once. Switching images,
/// a failed run or dropping the facade releases them.
pub struct ClusterFlow {
    backend: Arc<dyn ComputeBackend>,
    config: PipelineConfig,
    attached: Option<Attached>,
}

impl std::fmt::Debug for ClusterFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterFlow")
            .field("backend", &self.backend.kind())
            .field("config", &self.config)
            .field("image", &self.attached.as_ref().map(|a| &a.image))
            .finish()
    }
}

impl Drop for ClusterFlow {
    fn drop(&mut self) {
        if let Some(attached) = self.attached.take() {
            attached.detach();
        }
    }
}

impl ClusterFlow {
    /// Create a new builder.
    pub fn builder() -> ClusterFlowBuilder {
        ClusterFlowBuilder::new()
    }

    /// Simulated backend with the default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Active backend kind.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Active configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Read both hex inputs and run them through the pipeline.
    pub async fn run_paths(
        &mut self,
        image: impl AsRef<Path>,
        pixel_input: impl AsRef<Path>,
        strip_input: impl AsRef<Path>,
    ) -> Result<PipelineRun> {
        let pixel = WordStream::read_hex_file(pixel_input)?;
        let strip = WordStream::read_hex_file(strip_input)?;
        info!(pixel_words = pixel.len(), strip_words = strip.len(), "Reading done");
        self.run_streams(image, &pixel, &strip).await
    }

    /// Run already decoded streams through the pipeline.
    ///
    /// Capacities are checked before the image is read or the device is
    /// touched, so an oversized stream costs no device calls.
    pub async fn run_streams(
        &mut self,
        image: impl AsRef<Path>,
        pixel: &WordStream,
        strip: &WordStream,
    ) -> Result<PipelineRun> {
        validate_against(pixel, LaneKind::Pixel, &self.config)?;
        validate_against(strip, LaneKind::Strip, &self.config)?;

        let image = image.as_ref();
        let mut attached = match self.attached.take() {
            Some(attached) if attached.image == image => attached,
            stale => {
                if let Some(stale) = stale {
                    stale.detach();
                }
                Attached::open(Arc::clone(&self.backend), &self.config, image)?
            }
        };

        let Attached {
            session,
            pixel: pixel_lane,
            strip: strip_lane,
            ..
        } = &mut attached;
        let outcome = ExecutionEngine::new(session, &self.config)
            .run(&mut [
                LaneJob::new(pixel_lane, pixel),
                LaneJob::new(strip_lane, strip),
            ])
            .await;

        match outcome {
            Ok(outcome) => {
                let run = PipelineRun {
                    outcome,
                    pixel_output: pixel_lane.take_output(),
                    strip_output: strip_lane.take_output(),
                    platform: session.platform().to_string(),
                    device: session.device().clone(),
                };
                self.attached = Some(attached);
                Ok(run)
            }
            Err(e) => {
                // Work of a timed-out or failed run may still be in flight;
                // start the next run on fresh buffers.
                attached.detach();
                Err(e)
            }
        }
    }
}

/// Builder for [`ClusterFlow`].
pub struct ClusterFlowBuilder {
    kind: BackendKind,
    instance: Option<Arc<dyn ComputeBackend>>,
    config: PipelineConfig,
}

impl ClusterFlowBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            kind: BackendKind::Sim,
            instance: None,
            config: PipelineConfig::default(),
        }
    }

    /// Set the backend kind.
    #[must_use]
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Use an existing backend instead of creating one by kind.
    #[must_use]
    pub fn backend_instance(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.instance = Some(backend);
        self
    }

    /// Set the pipeline configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and create the backend.
    pub fn build(self) -> Result<ClusterFlow> {
        self.config.validate()?;
        let backend = match self.instance {
            Some(backend) => backend,
            None => create_backend(self.kind)?,
        };
        Ok(ClusterFlow {
            backend,
            config: self.config,
            attached: None,
        })
    }
}

impl Default for ClusterFlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}
