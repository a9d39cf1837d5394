//! # clusterflow sim
//!
//! Simulated accelerator backend for clusterflow.
//!
//! Stands in for the FPGA card during development and testing. The
//! simulator exposes a device catalog with a Xilinx platform, loads a TOML
//! image manifest instead of a device binary, and runs submitted
//! operations on tokio tasks in whatever order their wait-lists allow.
//!
//! ```ignore
//! use clusterflow_sim::{SimBackend, SimConfig, SimFault};
//!
//! let backend = SimBackend::with_config(
//!     SimConfig::new().with_fault(SimFault::RejectSubmission(3)),
//! );
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backend;
mod config;
mod image;

pub use backend::SimBackend;
pub use config::{default_catalog, SimConfig, SimFault};
pub use image::{
    ImageError, SimImage, SimStageSpec, StageRole, SIM_IMAGE_MAGIC, SIM_IMAGE_VERSION,
};
