//! Per-stage durations derived from completed operation records.

use std::fmt;

use crate::backend::OpKind;
use crate::error::Result;
use crate::graph::OperationGraph;
use crate::lane::LaneKind;

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Durations of one lane, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneTiming {
    /// `TRANSFER_IN` start to end.
    pub input_transfer_ns: u64,
    /// `COMPUTE_START` start to `COMPUTE_END` end.
    pub pipeline_ns: u64,
    /// `TRANSFER_OUT` start to end.
    pub output_transfer_ns: u64,
    /// Device-clock interval covered by the pipeline.
    pub pipeline_span: (u64, u64),
}

impl LaneTiming {
    fn from_graph(graph: &OperationGraph, lane: LaneKind) -> Result<Self> {
        let input = graph.timestamps(lane, OpKind::TransferIn)?;
        let start = graph.timestamps(lane, OpKind::ComputeStart)?;
        let end = graph.timestamps(lane, OpKind::ComputeEnd)?;
        let output = graph.timestamps(lane, OpKind::TransferOut)?;

        Ok(Self {
            input_transfer_ns: input.duration_ns(),
            pipeline_ns: end.end_ns.saturating_sub(start.start_ns),
            output_transfer_ns: output.duration_ns(),
            pipeline_span: (start.start_ns, end.end_ns),
        })
    }

    /// Input transfer in milliseconds.
    #[must_use]
    pub fn input_transfer_ms(&self) -> f64 {
        ns_to_ms(self.input_transfer_ns)
    }

    /// Pipeline in milliseconds.
    #[must_use]
    pub fn pipeline_ms(&self) -> f64 {
        ns_to_ms(self.pipeline_ns)
    }

    /// Output transfer in milliseconds.
    #[must_use]
    pub fn output_transfer_ms(&self) -> f64 {
        ns_to_ms(self.output_transfer_ns)
    }
}

/// The six durations of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingReport {
    /// Pixel lane.
    pub pixel: LaneTiming,
    /// Strip lane.
    pub strip: LaneTiming,
}

impl TimingReport {
    /// Build the report from a drained graph.
    ///
    /// Fails with `TimingUnavailable` naming the first operation lacking
    /// timestamps.
    pub fn from_graph(graph: &OperationGraph) -> Result<Self> {
        Ok(Self {
            pixel: LaneTiming::from_graph(graph, LaneKind::Pixel)?,
            strip: LaneTiming::from_graph(graph, LaneKind::Strip)?,
        })
    }

    /// Timing of one lane.
    #[must_use]
    pub fn lane(&self, kind: LaneKind) -> &LaneTiming {
        match kind {
            LaneKind::Pixel => &self.pixel,
            LaneKind::Strip => &self.strip,
        }
    }

    /// The six labelled durations in milliseconds, in print order.
    #[must_use]
    pub fn entries(&self) -> [(&'static str, f64); 6] {
        [
            ("Pixel input ave time: ", self.pixel.input_transfer_ms()),
            ("Strip input ave time: ", self.strip.input_transfer_ms()),
            ("Pixel pipeline ave time:", self.pixel.pipeline_ms()),
            ("Strip pipeline ave time:", self.strip.pipeline_ms()),
            ("Pixel output ave time:", self.pixel.output_transfer_ms()),
            ("Strip output ave time:", self.strip.output_transfer_ms()),
        ]
    }

    /// How long both lanes' pipelines were running at once, in nanoseconds.
    #[must_use]
    pub fn pipeline_overlap_ns(&self) -> u64 {
        let (a_start, a_end) = self.pixel.pipeline_span;
        let (b_start, b_end) = self.strip.pipeline_span;
        a_end.min(b_end).saturating_sub(a_start.max(b_start))
    }

    /// Overlap relative to the shorter pipeline (0.0 to 1.0).
    #[must_use]
    pub fn pipeline_overlap_ratio(&self) -> f64 {
        let shorter = self.pixel.pipeline_ns.min(self.strip.pipeline_ns);
        if shorter == 0 {
            return 0.0;
        }
        self.pipeline_overlap_ns() as f64 / shorter as f64
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, ms) in self.entries() {
            writeln!(f, "{} {:.3} ms", label, ms)?;
        }
        Ok(())
    }
}
