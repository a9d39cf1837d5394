//! Pixel and strip lanes.
//!
//! A lane is one independent processing track: its own input and output
//! buffers plus the two stages bounding its part of the accelerator
//! program. Pixel and strip are two instances of the same type, differing
//! only in geometry and stage names.

use std::fmt;

use tracing::{debug, info, warn};

use crate::backend::{AccessMode, BufferHandle, StageHandle};
use crate::config::{LaneGeometry, LaneStages, PipelineConfig, StageArgSpec};
use crate::error::{ClusterFlowError, Result};
use crate::session::DeviceSession;

/// Lane identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LaneKind {
    /// Pixel detector clusters.
    Pixel,
    /// Strip detector clusters.
    Strip,
}

impl LaneKind {
    /// Both lanes, pixel first.
    pub const ALL: [LaneKind; 2] = [LaneKind::Pixel, LaneKind::Strip];
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneKind::Pixel => write!(f, "Pixel"),
            LaneKind::Strip => write!(f, "Strip"),
        }
    }
}

/// Submission progress of a lane.
///
/// `Done` is reached only after the engine's global drain; having queued
/// the last operation is `OutputQueued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneState {
    /// Nothing submitted.
    Idle,
    /// Input transfer submitted.
    InputQueued,
    /// Both stages submitted.
    ComputeQueued,
    /// Output transfer submitted.
    OutputQueued,
    /// Drained; outputs and timestamps are valid.
    Done,
    /// A submission or completion step failed.
    Failed,
}

impl LaneState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_advance_to(self, next: LaneState) -> bool {
        use LaneState::*;
        matches!(
            (self, next),
            (Idle, InputQueued)
                | (InputQueued, ComputeQueued)
                | (ComputeQueued, OutputQueued)
                | (OutputQueued, Done)
                | (Idle | InputQueued | ComputeQueued | OutputQueued, Failed)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LaneState::Done | LaneState::Failed)
    }
}

/// One lane's buffers, stages and progress.
#[derive(Debug)]
pub struct Lane {
    kind: LaneKind,
    geometry: LaneGeometry,
    stages: LaneStages,
    input_capacity: usize,
    output_capacity: usize,
    input: BufferHandle,
    output: BufferHandle,
    start_stage: StageHandle,
    end_stage: StageHandle,
    state: LaneState,
    bound_len: Option<usize>,
    host_output: Vec<u32>,
}

impl Lane {
    /// Allocate the lane's buffers and resolve its stages.
    ///
    /// Buffers are sized once from the configured geometry and reused for
    /// the session lifetime.
    pub fn new(session: &DeviceSession, kind: LaneKind, config: &PipelineConfig) -> Result<Self> {
        let geometry = *config.geometry(kind);
        let stages = config.stages(kind).clone();
        let input_capacity = config.input_capacity(kind);
        let output_capacity = config.output_capacity(kind);

        let input = session.allocate(
            input_capacity * std::mem::size_of::<u64>(),
            AccessMode::ReadOnly,
        )?;
        let output = match session.allocate(
            output_capacity * std::mem::size_of::<u32>(),
            AccessMode::ReadWrite,
        ) {
            Ok(output) => output,
            Err(e) => {
                release_all(session, &[input]);
                return Err(e);
            }
        };
        let stages_resolved = session
            .resolve_stage(&stages.start)
            .and_then(|start| session.resolve_stage(&stages.end).map(|end| (start, end)));
        let (start_stage, end_stage) = match stages_resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                release_all(session, &[input, output]);
                return Err(e);
            }
        };

        info!(
            lane = %kind,
            input_words = input_capacity,
            output_words = output_capacity,
            fields = geometry.fields,
            start = %stages.start,
            end = %stages.end,
            "Lane ready"
        );

        Ok(Self {
            kind,
            geometry,
            stages,
            input_capacity,
            output_capacity,
            input,
            output,
            start_stage,
            end_stage,
            state: LaneState::Idle,
            bound_len: None,
            host_output: Vec::new(),
        })
    }

    /// Bind the input buffer and stream length to the start stage and the
    /// output buffer to the end stage. Other slots are left untouched.
    pub fn bind_arguments(
        &mut self,
        session: &DeviceSession,
        spec: &StageArgSpec,
        stream_len: usize,
    ) -> Result<()> {
        if stream_len > self.input_capacity {
            return Err(ClusterFlowError::CapacityExceeded {
                lane: self.kind,
                len: stream_len,
                capacity: self.input_capacity,
            });
        }
        session.bind_buffer(
            self.start_stage,
            &self.stages.start,
            spec.input_buffer_slot,
            self.input,
        )?;
        session.bind_scalar(
            self.start_stage,
            &self.stages.start,
            spec.input_len_slot,
            stream_len as u64,
        )?;
        session.bind_buffer(
            self.end_stage,
            &self.stages.end,
            spec.output_buffer_slot,
            self.output,
        )?;
        self.bound_len = Some(stream_len);
        debug!(lane = %self.kind, stream_len, "Arguments bound");
        Ok(())
    }

    /// Lane identity.
    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    /// Geometry the buffers were sized from.
    pub fn geometry(&self) -> &LaneGeometry {
        &self.geometry
    }

    /// Stage names.
    pub fn stages(&self) -> &LaneStages {
        &self.stages
    }

    /// Maximum input length in 64-bit words.
    pub fn input_capacity(&self) -> usize {
        self.input_capacity
    }

    /// Output container length in 32-bit words.
    pub fn output_capacity(&self) -> usize {
        self.output_capacity
    }

    /// Input buffer.
    pub fn input_handle(&self) -> BufferHandle {
        self.input
    }

    /// Output buffer.
    pub fn output_handle(&self) -> BufferHandle {
        self.output
    }

    /// Start stage.
    pub fn start_stage(&self) -> StageHandle {
        self.start_stage
    }

    /// End stage.
    pub fn end_stage(&self) -> StageHandle {
        self.end_stage
    }

    /// Current state.
    pub fn state(&self) -> LaneState {
        self.state
    }

    /// Stream length bound by the last `bind_arguments`.
    pub fn bound_len(&self) -> Option<usize> {
        self.bound_len
    }

    /// Output words read back by the last completed run.
    pub fn output(&self) -> &[u32] {
        &self.host_output
    }

    /// Take ownership of the output words.
    pub fn take_output(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.host_output)
    }

    pub(crate) fn advance(&mut self, next: LaneState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal lane transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Return to `Idle` so the lane can be submitted again.
    ///
    /// Output of the previous run is dropped.
    pub fn reset(&mut self) {
        self.state = LaneState::Idle;
        self.bound_len = None;
        self.host_output.clear();
    }

    /// Free both device buffers.
    ///
    /// Attempts both releases and reports the first failure.
    pub fn release(self, session: &DeviceSession) -> Result<()> {
        let input = session.release(self.input);
        let output = session.release(self.output);
        debug!(lane = %self.kind, "Lane buffers released");
        input.and(output)
    }

    pub(crate) fn store_output(&mut self, words: Vec<u32>) {
        self.host_output = words;
    }
}

fn release_all(session: &DeviceSession, buffers: &[BufferHandle]) {
    for buffer in buffers {
        if let Err(e) = session.release(*buffer) {
            warn!(?buffer, error = %e, "Failed to release buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferLayout, LaneGeometry, PipelineConfigBuilder};
    use crate::testing::{BackendCall, RecordingBackend};
    use std::sync::Arc;

    fn small_config() -> PipelineConfig {
        PipelineConfigBuilder::new()
            .with_layout(BufferLayout {
                block_words: 8,
                header_words: 2,
                input_padding_words: 4,
                max_input_clusters: 4,
            })
            .with_geometry(
                LaneKind::Pixel,
                LaneGeometry {
                    rows: 2,
                    max_clusters: 3,
                    input_rows: 3,
                    ..LaneGeometry::pixel()
                },
            )
            .build()
            .unwrap()
    }

    fn open(backend: &Arc<RecordingBackend>, config: &PipelineConfig) -> DeviceSession {
        DeviceSession::open(backend.clone(), config, b"image", "mem").unwrap()
    }

    #[test]
    fn test_state_machine() {
        use LaneState::*;
        assert!(Idle.can_advance_to(InputQueued));
        assert!(OutputQueued.can_advance_to(Done));
        assert!(ComputeQueued.can_advance_to(Failed));
        assert!(!Idle.can_advance_to(Done));
        assert!(!InputQueued.can_advance_to(Done));
        assert!(!Done.can_advance_to(Failed));
        assert!(Done.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!OutputQueued.is_terminal());
    }

    #[test]
    fn test_lane_buffers_sized_from_geometry() {
        let backend = Arc::new(RecordingBackend::new());
        let config = small_config();
        let session = open(&backend, &config);
        let lane = Lane::new(&session, LaneKind::Pixel, &config).unwrap();

        // 3 * 4 + 4
        assert_eq!(lane.input_capacity(), 16);
        // (2 * 3 + 2) / 8 + 1 = 2 blocks
        assert_eq!(lane.output_capacity(), 16);
        assert_eq!(lane.state(), LaneState::Idle);

        let allocations: Vec<_> = backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Allocate { size, access } => Some((size, access)),
                _ => None,
            })
            .collect();
        assert_eq!(
            allocations,
            vec![(16 * 8, AccessMode::ReadOnly), (16 * 4, AccessMode::ReadWrite)]
        );
    }

    #[test]
    fn test_bind_touches_only_host_slots() {
        let backend = Arc::new(RecordingBackend::new());
        let config = small_config();
        let session = open(&backend, &config);
        let mut lane = Lane::new(&session, LaneKind::Pixel, &config).unwrap();
        lane.bind_arguments(&session, &config.args, 5).unwrap();
        assert_eq!(lane.bound_len(), Some(5));

        let binds: Vec<_> = backend
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    BackendCall::BindBuffer { .. } | BackendCall::BindScalar { .. }
                )
            })
            .collect();
        assert_eq!(
            binds,
            vec![
                BackendCall::BindBuffer {
                    stage: lane.start_stage(),
                    slot: 0,
                    buffer: lane.input_handle(),
                },
                BackendCall::BindScalar {
                    stage: lane.start_stage(),
                    slot: 2,
                    value: 5,
                },
                BackendCall::BindBuffer {
                    stage: lane.end_stage(),
                    slot: 2,
                    buffer: lane.output_handle(),
                },
            ]
        );
    }

    #[test]
    fn test_bind_failure_names_stage_and_slot() {
        let backend = Arc::new(RecordingBackend::new().reject_bind_slot(2));
        let config = small_config();
        let session = open(&backend, &config);
        let mut lane = Lane::new(&session, LaneKind::Pixel, &config).unwrap();
        let err = lane.bind_arguments(&session, &config.args, 1).unwrap_err();
        match err {
            ClusterFlowError::BindFailed { stage, slot, .. } => {
                assert_eq!(stage, config.pixel_stages.start);
                assert_eq!(slot, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_stage_fails_lane() {
        let backend = Arc::new(RecordingBackend::new().with_stages(["only-one"]));
        let config = small_config();
        let session = open(&backend, &config);
        let err = Lane::new(&session, LaneKind::Strip, &config).unwrap_err();
        assert!(matches!(err, ClusterFlowError::StageNotFound(_)));
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_release_frees_both_buffers() {
        let backend = Arc::new(RecordingBackend::new());
        let config = small_config();
        let session = open(&backend, &config);
        let lane = Lane::new(&session, LaneKind::Pixel, &config).unwrap();
        let (input, output) = (lane.input_handle(), lane.output_handle());
        assert_eq!(backend.live_buffers(), 2);

        lane.release(&session).unwrap();
        assert_eq!(backend.live_buffers(), 0);
        let released: Vec<_> = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Release { .. }))
            .collect();
        assert_eq!(
            released,
            vec![
                BackendCall::Release { buffer: input },
                BackendCall::Release { buffer: output },
            ]
        );
    }
}
