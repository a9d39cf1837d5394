//! Error types for the clusterflow CLI.

use clusterflow::core::error::ClusterFlowError;
use clusterflow::sim::ImageError;
use thiserror::Error;

/// CLI result type alias.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error type.
#[derive(Error, Debug)]
pub enum CliError {
    /// Any failure inside the pipeline.
    #[error(transparent)]
    Pipeline(#[from] ClusterFlowError),

    /// IO error while writing output files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The simulated image could not be produced.
    #[error("Simulated image error: {0}")]
    SimImage(#[from] ImageError),

    /// Positional arguments missing for a pipeline run.
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
}
