//! Dependency-ordered execution engine.
//!
//! Turns the input streams of both lanes into one graph of asynchronous
//! device operations:
//!
//! ```text
//! TRANSFER_IN -> COMPUTE_START -> COMPUTE_END -> TRANSFER_OUT
//! ```
//!
//! per lane, with every edge passed as an explicit wait-list. The channel
//! is out-of-order, so the `COMPUTE_START -> COMPUTE_END` edge is spelled
//! out as well even though nothing flows through host memory between the
//! two stages. Lanes share no edges. The engine drains once after all
//! submissions and only then reads timestamps and output buffers.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{EventHandle, OpKind};
use crate::config::{PipelineConfig, StageArgSpec};
use crate::error::{ClusterFlowError, Result};
use crate::graph::{OperationGraph, OperationRecord};
use crate::lane::{Lane, LaneKind, LaneState};
use crate::session::DeviceSession;
use crate::stream::{self, WordStream};
use crate::timing::TimingReport;

/// A lane paired with the stream it processes in one run.
#[derive(Debug)]
pub struct LaneJob<'a> {
    /// Lane to submit on.
    pub lane: &'a mut Lane,
    /// Input words.
    pub stream: &'a WordStream,
}

impl<'a> LaneJob<'a> {
    /// Pair a lane with a stream.
    pub fn new(lane: &'a mut Lane, stream: &'a WordStream) -> Self {
        Self { lane, stream }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Every submitted operation with its timestamps.
    pub graph: OperationGraph,
    /// The six durations.
    pub timing: TimingReport,
}

/// Submits the operation graph for both lanes and collects the results.
#[derive(Debug)]
pub struct ExecutionEngine<'s> {
    session: &'s DeviceSession,
    args: StageArgSpec,
    drain_timeout: Option<Duration>,
}

impl<'s> ExecutionEngine<'s> {
    /// Create an engine over an open session.
    pub fn new(session: &'s DeviceSession, config: &PipelineConfig) -> Self {
        Self {
            session,
            args: config.args,
            drain_timeout: config.drain_timeout(),
        }
    }

    /// Override the drain timeout.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Run one event through both lanes.
    ///
    /// `jobs` must hold exactly one pixel and one strip lane. Streams are
    /// validated against their lanes before anything is bound or
    /// submitted. Any failure after that marks every lane of the run
    /// `Failed`; no partial results are returned.
    pub async fn run(&self, jobs: &mut [LaneJob<'_>]) -> Result<RunOutcome> {
        check_lane_set(jobs)?;
        for job in jobs.iter() {
            stream::validate(job.stream, job.lane)?;
        }
        for job in jobs.iter_mut() {
            if job.lane.state().is_terminal() {
                job.lane.reset();
            } else if job.lane.state() != LaneState::Idle {
                return Err(ClusterFlowError::InvalidConfig(format!(
                    "{} lane is mid-run ({:?})",
                    job.lane.kind(),
                    job.lane.state()
                )));
            }
        }

        let bound = jobs.iter_mut().try_for_each(|job| {
            job.lane
                .bind_arguments(self.session, &self.args, job.stream.len())
        });
        if let Err(e) = bound {
            fail_all(jobs);
            return Err(e);
        }
        info!("Arguments bound");

        let mut graph = OperationGraph::new();
        let submitted = jobs
            .iter_mut()
            .try_for_each(|job| self.submit_lane(job, &mut graph));
        if let Err(e) = submitted {
            warn!(error = %e, "Submission failed, abandoning run");
            fail_all(jobs);
            return Err(e);
        }

        info!(operations = graph.len(), "waiting");
        if let Err(e) = self.session.drain(self.drain_timeout).await {
            fail_all(jobs);
            return Err(e);
        }
        debug!("Drain complete");

        if let Err(e) = self.collect(jobs, &mut graph) {
            fail_all(jobs);
            return Err(e);
        }

        let timing = TimingReport::from_graph(&graph)?;
        info!(
            pixel_pipeline_ms = timing.pixel.pipeline_ms(),
            strip_pipeline_ms = timing.strip.pipeline_ms(),
            overlap_ns = timing.pipeline_overlap_ns(),
            "Run complete"
        );
        Ok(RunOutcome { graph, timing })
    }

    fn submit_lane(&self, job: &mut LaneJob<'_>, graph: &mut OperationGraph) -> Result<()> {
        let kind = job.lane.kind();
        let input_buffer = job.lane.input_handle();
        let start_stage = job.lane.start_stage();
        let end_stage = job.lane.end_stage();
        let output = job.lane.output_handle();
        let payload: &[u8] = bytemuck::cast_slice(job.stream.words());

        let input = self.submit(graph, kind, OpKind::TransferIn, &[], |s, wait| {
            s.enqueue_write(input_buffer, payload, wait)
        })?;
        job.lane.advance(LaneState::InputQueued);

        let start = self.submit(graph, kind, OpKind::ComputeStart, &[input], |s, wait| {
            s.enqueue_stage(start_stage, wait)
        })?;
        let end = self.submit(graph, kind, OpKind::ComputeEnd, &[start], |s, wait| {
            s.enqueue_stage(end_stage, wait)
        })?;
        job.lane.advance(LaneState::ComputeQueued);

        self.submit(graph, kind, OpKind::TransferOut, &[end], |s, wait| {
            s.enqueue_read(output, wait)
        })?;
        job.lane.advance(LaneState::OutputQueued);
        Ok(())
    }

    fn submit<F>(
        &self,
        graph: &mut OperationGraph,
        lane: LaneKind,
        op: OpKind,
        wait: &[EventHandle],
        enqueue: F,
    ) -> Result<EventHandle>
    where
        F: FnOnce(&DeviceSession, &[EventHandle]) -> Result<EventHandle>,
    {
        let event = enqueue(self.session, wait).map_err(|e| ClusterFlowError::Submission {
            lane,
            op,
            reason: e.to_string(),
        })?;
        debug!(lane = %lane, op = %op, %event, ?wait, "Enqueued");
        graph.push(OperationRecord {
            event,
            lane,
            kind: op,
            predecessors: wait.to_vec(),
            timestamps: None,
        });
        Ok(event)
    }

    fn collect(&self, jobs: &mut [LaneJob<'_>], graph: &mut OperationGraph) -> Result<()> {
        for record in graph.records_mut() {
            let ts = self
                .session
                .timestamps(record.event)
                .map_err(|_| ClusterFlowError::TimingUnavailable {
                    lane: record.lane,
                    op: record.kind,
                })?;
            record.timestamps = Some(ts);
        }

        // Read every lane before storing any, so a failed read leaves no
        // lane holding output.
        let outputs = jobs
            .iter()
            .map(|job| {
                let bytes = self.session.read_back(job.lane.output_handle())?;
                let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
                debug!(lane = %job.lane.kind(), words = words.len(), "Output read back");
                Ok(words)
            })
            .collect::<Result<Vec<_>>>()?;

        for (job, words) in jobs.iter_mut().zip(outputs) {
            job.lane.store_output(words);
            job.lane.advance(LaneState::Done);
        }
        Ok(())
    }
}

fn check_lane_set(jobs: &[LaneJob<'_>]) -> Result<()> {
    for kind in LaneKind::ALL {
        let count = jobs.iter().filter(|j| j.lane.kind() == kind).count();
        if count != 1 {
            return Err(ClusterFlowError::InvalidConfig(format!(
                "a run needs exactly one {} lane, got {}",
                kind, count
            )));
        }
    }
    Ok(())
}

fn fail_all(jobs: &mut [LaneJob<'_>]) {
    for job in jobs.iter_mut() {
        if !job.lane.state().is_terminal() {
            job.lane.advance(LaneState::Failed);
        }
    }
}
