//! Pipeline configuration.
//!
//! All buffer sizes are derived from an immutable [`PipelineConfig`]
//! instead of compile-time constants. The defaults reproduce the F110
//! stream-integration geometry: pixel and strip lanes with independently
//! configured word, field, row and cluster counts.
//!
//! Configuration can be built in code through [`PipelineConfigBuilder`] or
//! loaded from a TOML file:
//!
//! ```toml
//! platform_filter = "Xilinx"
//! drain_timeout_ms = 5000
//!
//! [pixel]
//! max_clusters = 1024
//! input_rows = 3
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ClusterFlowError, Result};
use crate::lane::LaneKind;

/// Round `n` up past the next multiple of `block`.
///
/// The result always advances at least one block: an exact multiple still
/// gains a full block of slack, matching the sizing rule the accelerator
/// image was built against.
///
/// # Panics
///
/// Panics if `block` is zero; [`PipelineConfig::validate`] rejects that.
#[must_use]
pub const fn align_next(n: usize, block: usize) -> usize {
    (n / block + 1) * block
}

/// Class of compute device a session may bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Fixed-function accelerator card (FPGA).
    #[default]
    Accelerator,
    /// General-purpose GPU.
    Gpu,
    /// Host CPU device.
    Cpu,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Accelerator => write!(f, "accelerator"),
            DeviceClass::Gpu => write!(f, "gpu"),
            DeviceClass::Cpu => write!(f, "cpu"),
        }
    }
}

/// Sizing rules shared by both lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferLayout {
    /// Allocation granularity in words.
    pub block_words: usize,
    /// Header words reserved at the front of each output container.
    pub header_words: usize,
    /// Slack appended to each input buffer.
    pub input_padding_words: usize,
    /// Upper bound on input clusters per event.
    pub max_input_clusters: usize,
}

impl Default for BufferLayout {
    fn default() -> Self {
        Self {
            block_words: 1024,
            header_words: 16,
            input_padding_words: 4096,
            max_input_clusters: 409_600,
        }
    }
}

/// Geometry of one lane kind.
///
/// Has no `Default`: a partially specified lane table in TOML is filled
/// from the defaults of its own kind, see [`LaneGeometry::pixel`] and
/// [`LaneGeometry::strip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneGeometry {
    /// Words per encoded cluster inside the pipeline.
    pub words_per_cluster: usize,
    /// Fields per cluster record.
    pub fields: usize,
    /// Output rows per cluster.
    pub rows: usize,
    /// Maximum clusters the pipeline emits.
    pub max_clusters: usize,
    /// Input words per cluster.
    pub input_rows: usize,
}

impl LaneGeometry {
    /// Pixel lane defaults.
    #[must_use]
    pub const fn pixel() -> Self {
        Self {
            words_per_cluster: 10,
            fields: 17,
            rows: 22,
            max_clusters: 326_400,
            input_rows: 3,
        }
    }

    /// Strip lane defaults.
    #[must_use]
    pub const fn strip() -> Self {
        Self {
            words_per_cluster: 9,
            fields: 11,
            rows: 14,
            max_clusters: 307_200,
            input_rows: 2,
        }
    }

    /// Maximum input stream length in 64-bit words.
    #[must_use]
    pub fn input_capacity_words(&self, layout: &BufferLayout) -> usize {
        self.input_rows * layout.max_input_clusters + layout.input_padding_words
    }

    /// Output container length in 32-bit words, header included.
    #[must_use]
    pub fn output_capacity_words(&self, layout: &BufferLayout) -> usize {
        align_next(self.rows * self.max_clusters + layout.header_words, layout.block_words)
    }

    /// Stage-internal block buffer length in 32-bit words.
    #[must_use]
    pub fn block_buffer_words(&self, layout: &BufferLayout) -> usize {
        align_next(self.words_per_cluster * self.max_clusters, layout.block_words)
    }
}

/// Lane table as written in TOML; absent fields keep the lane's defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LaneGeometryOverrides {
    words_per_cluster: Option<usize>,
    fields: Option<usize>,
    rows: Option<usize>,
    max_clusters: Option<usize>,
    input_rows: Option<usize>,
}

impl LaneGeometryOverrides {
    fn apply(self, base: LaneGeometry) -> LaneGeometry {
        LaneGeometry {
            words_per_cluster: self.words_per_cluster.unwrap_or(base.words_per_cluster),
            fields: self.fields.unwrap_or(base.fields),
            rows: self.rows.unwrap_or(base.rows),
            max_clusters: self.max_clusters.unwrap_or(base.max_clusters),
            input_rows: self.input_rows.unwrap_or(base.input_rows),
        }
    }
}

fn pixel_geometry<'de, D>(deserializer: D) -> std::result::Result<LaneGeometry, D::Error>
where
    D: Deserializer<'de>,
{
    LaneGeometryOverrides::deserialize(deserializer).map(|o| o.apply(LaneGeometry::pixel()))
}

fn strip_geometry<'de, D>(deserializer: D) -> std::result::Result<LaneGeometry, D::Error>
where
    D: Deserializer<'de>,
{
    LaneGeometryOverrides::deserialize(deserializer).map(|o| o.apply(LaneGeometry::strip()))
}

/// Names of the two stages bounding a lane inside the accelerator program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStages {
    /// Stage that consumes the input buffer.
    pub start: String,
    /// Stage that fills the output buffer.
    pub end: String,
}

impl LaneStages {
    /// Pixel loader and writer.
    pub fn pixel() -> Self {
        Self {
            start: "configurableLengthWideLoader:{pixelLoader}".to_string(),
            end: "EDMWriter:{PixelEDMWriter}".to_string(),
        }
    }

    /// Strip loader and writer.
    pub fn strip() -> Self {
        Self {
            start: "configurableLengthWideLoader:{stripLoader}".to_string(),
            end: "EDMWriter:{StripEDMWriter}".to_string(),
        }
    }
}

/// Argument slots carrying host-visible data.
///
/// Slots not named here belong to the stages' internal streaming wiring
/// and are never touched by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageArgSpec {
    /// Start stage slot receiving the input buffer.
    pub input_buffer_slot: u32,
    /// Start stage slot receiving the stream length.
    pub input_len_slot: u32,
    /// End stage slot receiving the output buffer.
    pub output_buffer_slot: u32,
}

impl Default for StageArgSpec {
    fn default() -> Self {
        Self {
            input_buffer_slot: 0,
            input_len_slot: 2,
            output_buffer_slot: 2,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Substring a platform name must contain.
    pub platform_filter: String,
    /// Device class to bind to.
    pub device_class: DeviceClass,
    /// Shared sizing rules.
    pub layout: BufferLayout,
    /// Pixel lane geometry.
    #[serde(deserialize_with = "pixel_geometry")]
    pub pixel: LaneGeometry,
    /// Strip lane geometry.
    #[serde(deserialize_with = "strip_geometry")]
    pub strip: LaneGeometry,
    /// Pixel stage names.
    pub pixel_stages: LaneStages,
    /// Strip stage names.
    pub strip_stages: LaneStages,
    /// Host-visible argument slots.
    pub args: StageArgSpec,
    /// Optional upper bound on the drain, in milliseconds.
    pub drain_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            platform_filter: "Xilinx".to_string(),
            device_class: DeviceClass::Accelerator,
            layout: BufferLayout::default(),
            pixel: LaneGeometry::pixel(),
            strip: LaneGeometry::strip(),
            pixel_stages: LaneStages::pixel(),
            strip_stages: LaneStages::strip(),
            args: StageArgSpec::default(),
            drain_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ClusterFlowError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClusterFlowError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ClusterFlowError::InvalidConfig(e.to_string()))
    }

    /// Geometry for a lane kind.
    #[must_use]
    pub fn geometry(&self, kind: LaneKind) -> &LaneGeometry {
        match kind {
            LaneKind::Pixel => &self.pixel,
            LaneKind::Strip => &self.strip,
        }
    }

    /// Stage names for a lane kind.
    #[must_use]
    pub fn stages(&self, kind: LaneKind) -> &LaneStages {
        match kind {
            LaneKind::Pixel => &self.pixel_stages,
            LaneKind::Strip => &self.strip_stages,
        }
    }

    /// Input capacity in 64-bit words for a lane kind.
    #[must_use]
    pub fn input_capacity(&self, kind: LaneKind) -> usize {
        self.geometry(kind).input_capacity_words(&self.layout)
    }

    /// Output capacity in 32-bit words for a lane kind.
    #[must_use]
    pub fn output_capacity(&self, kind: LaneKind) -> usize {
        self.geometry(kind).output_capacity_words(&self.layout)
    }

    /// Drain timeout, if configured.
    #[must_use]
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    /// Reject configurations that cannot size or bind a lane.
    pub fn validate(&self) -> Result<()> {
        if self.layout.block_words == 0 {
            return Err(ClusterFlowError::InvalidConfig(
                "layout.block_words must be non-zero".to_string(),
            ));
        }
        for kind in LaneKind::ALL {
            let geometry = self.geometry(kind);
            if geometry.rows == 0 || geometry.max_clusters == 0 {
                return Err(ClusterFlowError::InvalidConfig(format!(
                    "{} lane must have non-zero rows and max_clusters",
                    kind
                )));
            }
            if self.input_capacity(kind) == 0 {
                return Err(ClusterFlowError::InvalidConfig(format!(
                    "{} lane input capacity is zero",
                    kind
                )));
            }
            let stages = self.stages(kind);
            if stages.start.is_empty() || stages.end.is_empty() {
                return Err(ClusterFlowError::InvalidConfig(format!(
                    "{} lane stage names must not be empty",
                    kind
                )));
            }
        }
        if self.args.input_buffer_slot == self.args.input_len_slot {
            return Err(ClusterFlowError::InvalidConfig(format!(
                "input buffer and input length share slot {}",
                self.args.input_buffer_slot
            )));
        }
        if self.drain_timeout_ms == Some(0) {
            return Err(ClusterFlowError::InvalidConfig(
                "drain_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Creates a builder with the default F110 configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the platform name filter.
    #[must_use]
    pub fn with_platform_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.platform_filter = filter.into();
        self
    }

    /// Sets the device class filter.
    #[must_use]
    pub fn with_device_class(mut self, class: DeviceClass) -> Self {
        self.config.device_class = class;
        self
    }

    /// Sets the shared buffer layout.
    #[must_use]
    pub fn with_layout(mut self, layout: BufferLayout) -> Self {
        self.config.layout = layout;
        self
    }

    /// Sets the geometry of one lane kind.
    #[must_use]
    pub fn with_geometry(mut self, kind: LaneKind, geometry: LaneGeometry) -> Self {
        match kind {
            LaneKind::Pixel => self.config.pixel = geometry,
            LaneKind::Strip => self.config.strip = geometry,
        }
        self
    }

    /// Sets the stage names of one lane kind.
    #[must_use]
    pub fn with_stages(mut self, kind: LaneKind, stages: LaneStages) -> Self {
        match kind {
            LaneKind::Pixel => self.config.pixel_stages = stages,
            LaneKind::Strip => self.config.strip_stages = stages,
        }
        self
    }

    /// Sets the host-visible argument slots.
    #[must_use]
    pub fn with_args(mut self, args: StageArgSpec) -> Self {
        self.config.args = args;
        self
    }

    /// Bounds the drain.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_next_always_advances() {
        assert_eq!(align_next(0, 1024), 1024);
        assert_eq!(align_next(1, 1024), 1024);
        assert_eq!(align_next(1023, 1024), 1024);
        assert_eq!(align_next(1024, 1024), 2048);
        assert_eq!(align_next(1025, 1024), 2048);
    }

    #[test]
    fn test_default_capacities_match_f110_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.input_capacity(LaneKind::Pixel), 3 * 409_600 + 4096);
        assert_eq!(config.input_capacity(LaneKind::Strip), 2 * 409_600 + 4096);
        // (22 * 326400 + 16) / 1024 = 7012 -> 7013 blocks
        assert_eq!(config.output_capacity(LaneKind::Pixel), 7013 * 1024);
        // (14 * 307200 + 16) / 1024 = 4200 -> 4201 blocks
        assert_eq!(config.output_capacity(LaneKind::Strip), 4201 * 1024);
    }

    #[test]
    fn test_header_words_push_into_next_block() {
        let layout = BufferLayout::default();
        let geometry = LaneGeometry {
            rows: 1,
            max_clusters: 1008,
            ..LaneGeometry::pixel()
        };
        // 1008 + 16 = 1024 exactly, which still gains a block.
        assert_eq!(geometry.output_capacity_words(&layout), 2048);
    }

    #[test]
    fn test_block_buffer_words() {
        let layout = BufferLayout::default();
        assert_eq!(
            LaneGeometry::pixel().block_buffer_words(&layout),
            (10 * 326_400 / 1024 + 1) * 1024
        );
        assert_eq!(
            LaneGeometry::strip().block_buffer_words(&layout),
            (9 * 307_200 / 1024 + 1) * 1024
        );
    }

    #[test]
    fn test_toml_partial_override() {
        let config = PipelineConfig::from_toml_str(
            r#"
platform_filter = "Sim"
drain_timeout_ms = 250

[strip]
max_clusters = 64
input_rows = 1
"#,
        )
        .unwrap();
        assert_eq!(config.platform_filter, "Sim");
        assert_eq!(config.strip.max_clusters, 64);
        assert_eq!(config.strip.rows, 14);
        assert_eq!(config.pixel, LaneGeometry::pixel());
        assert_eq!(config.drain_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_partial_lane_tables_keep_their_own_kind_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
[pixel]
rows = 30

[strip]
fields = 12
"#,
        )
        .unwrap();
        let pixel = LaneGeometry {
            rows: 30,
            ..LaneGeometry::pixel()
        };
        let strip = LaneGeometry {
            fields: 12,
            ..LaneGeometry::strip()
        };
        assert_eq!(config.pixel, pixel);
        assert_eq!(config.strip, strip);
        assert_eq!(config.strip.words_per_cluster, 9);
        assert_eq!(config.strip.max_clusters, 307_200);
    }

    #[test]
    fn test_unknown_lane_field_rejected() {
        let result = PipelineConfig::from_toml_str("[strip]\nmax_cluster = 64\n");
        assert!(matches!(result, Err(ClusterFlowError::InvalidConfig(_))));
    }

    #[test]
    fn test_toml_round_trip_keeps_stage_names() {
        let config = PipelineConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_shared_slots() {
        let result = PipelineConfigBuilder::new()
            .with_args(StageArgSpec {
                input_buffer_slot: 1,
                input_len_slot: 1,
                output_buffer_slot: 2,
            })
            .build();
        assert!(matches!(result, Err(ClusterFlowError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_block() {
        let result = PipelineConfigBuilder::new()
            .with_layout(BufferLayout {
                block_words: 0,
                ..BufferLayout::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_empty_stage_name() {
        let result = PipelineConfigBuilder::new()
            .with_stages(
                LaneKind::Strip,
                LaneStages {
                    start: String::new(),
                    end: "writer".to_string(),
                },
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder() {
        let config = PipelineConfigBuilder::new()
            .with_platform_filter("Intel")
            .with_device_class(DeviceClass::Gpu)
            .with_drain_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(config.platform_filter, "Intel");
        assert_eq!(config.device_class, DeviceClass::Gpu);
        assert_eq!(config.drain_timeout_ms, Some(2000));
    }
}
