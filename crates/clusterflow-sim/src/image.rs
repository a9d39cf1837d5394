//! Simulated accelerator image.
//!
//! The simulator loads a TOML manifest in place of a device binary. It
//! declares every stage of the program: its role, the internal stream it
//! feeds or drains, how many argument slots it takes, a fixed latency and
//! the largest payload it accepts.
//!
//! ```toml
//! magic = "clusterflow-sim-image"
//! version = 1
//!
//! [[stages]]
//! name = "configurableLengthWideLoader:{pixelLoader}"
//! role = "loader"
//! stream = "pixel"
//! args = 3
//! buffer_slot = 0
//! len_slot = 2
//! latency_us = 50
//! capacity_words = 1232896
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use clusterflow_core::config::PipelineConfig;
use clusterflow_core::error::ClusterFlowError;
use clusterflow_core::lane::LaneKind;

/// Magic string every simulated image starts with.
pub const SIM_IMAGE_MAGIC: &str = "clusterflow-sim-image";

/// Manifest format version understood by this crate.
pub const SIM_IMAGE_VERSION: u32 = 1;

/// Errors decoding a simulated image.
#[derive(Error, Debug)]
pub enum ImageError {
    /// The blob is not UTF-8 text.
    #[error("image is not UTF-8 text")]
    NotText,

    /// The manifest is not valid TOML for this schema.
    #[error("malformed manifest: {0}")]
    Malformed(String),

    /// Wrong magic string.
    #[error("not a clusterflow-sim-image (magic is '{0}')")]
    BadMagic(String),

    /// Unsupported manifest version.
    #[error("unsupported image version {0}")]
    BadVersion(u32),

    /// Two stages share a name.
    #[error("duplicate stage '{0}'")]
    DuplicateStage(String),

    /// A stage declares a slot outside its argument count.
    #[error("stage '{stage}' uses slot {slot} but takes {args} arguments")]
    SlotOutOfRange {
        /// Stage name.
        stage: String,
        /// Offending slot.
        slot: u32,
        /// Declared argument count.
        args: u32,
    },
}

impl From<ImageError> for ClusterFlowError {
    fn from(e: ImageError) -> Self {
        ClusterFlowError::BackendError(e.to_string())
    }
}

/// What a stage does with its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageRole {
    /// Moves `len` words from its input buffer into the internal stream.
    Loader,
    /// Drains the internal stream into its output buffer.
    Writer,
}

/// One stage of a simulated program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStageSpec {
    /// Stage name, resolved by `create_stage`.
    pub name: String,
    /// Loader or writer.
    pub role: StageRole,
    /// Internal stream connecting a loader to its writer.
    pub stream: String,
    /// Number of argument slots.
    pub args: u32,
    /// Slot carrying the buffer.
    pub buffer_slot: u32,
    /// Slot carrying the word count (loaders only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len_slot: Option<u32>,
    /// Header words a writer reserves before the payload.
    #[serde(default)]
    pub header_words: usize,
    /// Fixed execution latency in microseconds.
    #[serde(default)]
    pub latency_us: u64,
    /// Largest payload the stage accepts, in 64-bit words.
    pub capacity_words: usize,
}

/// Decoded simulated image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimImage {
    /// Must equal [`SIM_IMAGE_MAGIC`].
    pub magic: String,
    /// Must equal [`SIM_IMAGE_VERSION`].
    pub version: u32,
    /// Program stages.
    #[serde(default)]
    pub stages: Vec<SimStageSpec>,
}

impl SimImage {
    /// Image exposing the loader and writer of both lanes as named by `config`.
    pub fn for_config(config: &PipelineConfig) -> Self {
        let args = &config.args;
        let loader_args = args.input_buffer_slot.max(args.input_len_slot) + 1;
        let writer_args = args.output_buffer_slot + 1;

        let stages = LaneKind::ALL
            .iter()
            .flat_map(|&kind| {
                let names = config.stages(kind);
                let stream = kind.to_string().to_lowercase();
                [
                    SimStageSpec {
                        name: names.start.clone(),
                        role: StageRole::Loader,
                        stream: stream.clone(),
                        args: loader_args,
                        buffer_slot: args.input_buffer_slot,
                        len_slot: Some(args.input_len_slot),
                        header_words: 0,
                        latency_us: 50,
                        capacity_words: config.input_capacity(kind),
                    },
                    SimStageSpec {
                        name: names.end.clone(),
                        role: StageRole::Writer,
                        stream,
                        args: writer_args,
                        buffer_slot: args.output_buffer_slot,
                        len_slot: None,
                        header_words: config.layout.header_words,
                        latency_us: 120,
                        capacity_words: config.input_capacity(kind),
                    },
                ]
            })
            .collect();

        Self {
            magic: SIM_IMAGE_MAGIC.to_string(),
            version: SIM_IMAGE_VERSION,
            stages,
        }
    }

    /// Decode and check an image blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ImageError::NotText)?;
        let image: SimImage =
            toml::from_str(text).map_err(|e| ImageError::Malformed(e.to_string()))?;
        image.check()?;
        Ok(image)
    }

    /// Serialize to the manifest format.
    pub fn to_toml(&self) -> Result<String, ImageError> {
        toml::to_string_pretty(self).map_err(|e| ImageError::Malformed(e.to_string()))
    }

    /// Stage by name.
    pub fn stage(&self, name: &str) -> Option<&SimStageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    fn check(&self) -> Result<(), ImageError> {
        if self.magic != SIM_IMAGE_MAGIC {
            return Err(ImageError::BadMagic(self.magic.clone()));
        }
        if self.version != SIM_IMAGE_VERSION {
            return Err(ImageError::BadVersion(self.version));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if self.stages[..i].iter().any(|s| s.name == stage.name) {
                return Err(ImageError::DuplicateStage(stage.name.clone()));
            }
            let slots = std::iter::once(stage.buffer_slot).chain(stage.len_slot);
            for slot in slots {
                if slot >= stage.args {
                    return Err(ImageError::SlotOutOfRange {
                        stage: stage.name.clone(),
                        slot,
                        args: stage.args,
                    });
                }
            }
        }
        Ok(())
    }
}
