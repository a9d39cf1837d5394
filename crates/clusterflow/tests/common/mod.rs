//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use clusterflow::prelude::*;
use tempfile::TempDir;

/// Configuration small enough that whole result buffers can be inspected.
pub fn small_config() -> PipelineConfig {
    let geometry = |base: LaneGeometry| LaneGeometry {
        rows: 2,
        max_clusters: 4,
        ..base
    };
    PipelineConfigBuilder::new()
        .with_layout(BufferLayout {
            block_words: 16,
            header_words: 2,
            input_padding_words: 8,
            max_input_clusters: 4,
        })
        .with_geometry(LaneKind::Pixel, geometry(LaneGeometry::pixel()))
        .with_geometry(LaneKind::Strip, geometry(LaneGeometry::strip()))
        .build()
        .expect("small config is valid")
}

/// Scratch directory holding an image and input files.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write the simulated image matching `config`.
    pub fn sim_image(&self, config: &PipelineConfig) -> PathBuf {
        let toml = SimImage::for_config(config)
            .to_toml()
            .expect("Failed to serialize image");
        self.write("pipeline.xclbin", &toml)
    }

    /// Write one hex word per line.
    pub fn hex_file(&self, name: &str, words: &[u64]) -> PathBuf {
        let text: String = words.iter().map(|w| format!("{:016x}\n", w)).collect();
        self.write(name, &text)
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).expect("Failed to write fixture");
        path
    }
}

