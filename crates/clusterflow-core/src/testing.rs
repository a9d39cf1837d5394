//! In-memory backend that records every call.
//!
//! Used by unit and integration tests to assert call order, graph shape
//! and the absence of device interaction. Completion is synthetic: at
//! drain time each operation starts when the last event on its wait-list
//! ended, or at zero when the wait-list is empty.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{
    AccessMode, BackendKind, BufferHandle, ComputeBackend, DeviceId, DeviceInfo, EventHandle,
    OpTimestamps, PlatformInfo, StageHandle,
};
use crate::config::{DeviceClass, LaneStages};
use crate::error::{ClusterFlowError, Result};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BackendCall {
    Platforms,
    LoadProgram {
        device: String,
        bytes: usize,
    },
    Allocate {
        size: usize,
        access: AccessMode,
    },
    CreateStage {
        name: String,
    },
    BindBuffer {
        stage: StageHandle,
        slot: u32,
        buffer: BufferHandle,
    },
    BindScalar {
        stage: StageHandle,
        slot: u32,
        value: u64,
    },
    EnqueueWrite {
        buffer: BufferHandle,
        bytes: usize,
        wait: Vec<EventHandle>,
    },
    EnqueueStage {
        stage: StageHandle,
        wait: Vec<EventHandle>,
    },
    EnqueueRead {
        buffer: BufferHandle,
        wait: Vec<EventHandle>,
    },
    Drain,
    Timestamps {
        event: EventHandle,
    },
    ReadBack {
        buffer: BufferHandle,
    },
    Release {
        buffer: BufferHandle,
    },
}

impl BackendCall {
    /// Whether this call submits work to the channel.
    #[must_use]
    pub fn is_enqueue(&self) -> bool {
        matches!(
            self,
            BackendCall::EnqueueWrite { .. }
                | BackendCall::EnqueueStage { .. }
                | BackendCall::EnqueueRead { .. }
        )
    }
}

#[derive(Debug)]
struct Pending {
    event: EventHandle,
    wait: Vec<EventHandle>,
    read_of: Option<BufferHandle>,
    done: Option<OpTimestamps>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<BackendCall>,
    next_handle: u64,
    buffers: HashMap<BufferHandle, usize>,
    stages: HashMap<StageHandle, String>,
    pending: Vec<Pending>,
    enqueued: usize,
    completed_reads: HashMap<BufferHandle, usize>,
    read_backs: usize,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Recording fake for [`ComputeBackend`].
#[derive(Debug)]
pub struct RecordingBackend {
    catalog: Vec<PlatformInfo>,
    known_stages: Vec<String>,
    reject_images: bool,
    reject_bind_slot: Option<u32>,
    fail_enqueue_at: Option<usize>,
    fail_drain: bool,
    fail_read_back_at: Option<usize>,
    drain_delay: Option<Duration>,
    op_latency_ns: u64,
    state: Mutex<State>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    /// A backend exposing one Xilinx accelerator whose program contains the
    /// default pixel and strip stages.
    #[must_use]
    pub fn new() -> Self {
        let pixel = LaneStages::pixel();
        let strip = LaneStages::strip();
        Self {
            catalog: vec![PlatformInfo {
                name: "Xilinx".to_string(),
                devices: vec![
                    DeviceInfo {
                        id: DeviceId(0),
                        name: "recording_host".to_string(),
                        class: DeviceClass::Cpu,
                    },
                    DeviceInfo {
                        id: DeviceId(1),
                        name: "recording_accel_0".to_string(),
                        class: DeviceClass::Accelerator,
                    },
                ],
            }],
            known_stages: vec![pixel.start, pixel.end, strip.start, strip.end],
            reject_images: false,
            reject_bind_slot: None,
            fail_enqueue_at: None,
            fail_drain: false,
            fail_read_back_at: None,
            drain_delay: None,
            op_latency_ns: 1_000,
            state: Mutex::new(State::default()),
        }
    }

    /// Replace the device catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Vec<PlatformInfo>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Replace the stage names the loaded program exposes.
    #[must_use]
    pub fn with_stages<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_stages = names.into_iter().map(Into::into).collect();
        self
    }

    /// Fail every `load_program`.
    #[must_use]
    pub fn reject_images(mut self) -> Self {
        self.reject_images = true;
        self
    }

    /// Fail any bind to `slot`.
    #[must_use]
    pub fn reject_bind_slot(mut self, slot: u32) -> Self {
        self.reject_bind_slot = Some(slot);
        self
    }

    /// Fail the enqueue with 0-based index `index`.
    #[must_use]
    pub fn fail_enqueue_at(mut self, index: usize) -> Self {
        self.fail_enqueue_at = Some(index);
        self
    }

    /// Fail the drain.
    #[must_use]
    pub fn fail_drain(mut self) -> Self {
        self.fail_drain = true;
        self
    }

    /// Fail the `read_back` with 0-based index `index`.
    #[must_use]
    pub fn fail_read_back_at(mut self, index: usize) -> Self {
        self.fail_read_back_at = Some(index);
        self
    }

    /// Sleep this long inside the drain.
    #[must_use]
    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = Some(delay);
        self
    }

    /// Snapshot of recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Number of buffers allocated and not yet released.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of recorded enqueues.
    #[must_use]
    pub fn enqueue_count(&self) -> usize {
        self.state.lock().calls.iter().filter(|c| c.is_enqueue()).count()
    }

    fn enqueue(
        &self,
        call: BackendCall,
        wait: &[EventHandle],
        read_of: Option<BufferHandle>,
    ) -> Result<EventHandle> {
        let mut state = self.state.lock();
        let index = state.enqueued;
        state.enqueued += 1;
        state.calls.push(call);
        if self.fail_enqueue_at == Some(index) {
            return Err(ClusterFlowError::BackendError(format!(
                "injected failure on enqueue {}",
                index
            )));
        }
        if let Some(unknown) = wait
            .iter()
            .find(|w| !state.pending.iter().any(|p| p.event == **w))
        {
            return Err(ClusterFlowError::BackendError(format!(
                "wait-list references unknown {}",
                unknown
            )));
        }
        let event = EventHandle(state.handle());
        state.pending.push(Pending {
            event,
            wait: wait.to_vec(),
            read_of,
            done: None,
        });
        Ok(event)
    }
}

#[async_trait]
impl ComputeBackend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sim
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        self.state.lock().calls.push(BackendCall::Platforms);
        Ok(self.catalog.clone())
    }

    fn load_program(&self, device: &DeviceInfo, image: &[u8]) -> Result<()> {
        self.state.lock().calls.push(BackendCall::LoadProgram {
            device: device.name.clone(),
            bytes: image.len(),
        });
        if self.reject_images {
            return Err(ClusterFlowError::BackendError(
                "image rejected".to_string(),
            ));
        }
        Ok(())
    }

    fn allocate(&self, size_bytes: usize, access: AccessMode) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Allocate {
            size: size_bytes,
            access,
        });
        let handle = BufferHandle(state.handle());
        state.buffers.insert(handle, size_bytes);
        Ok(handle)
    }

    fn create_stage(&self, name: &str) -> Result<StageHandle> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::CreateStage {
            name: name.to_string(),
        });
        if !self.known_stages.iter().any(|s| s == name) {
            return Err(ClusterFlowError::StageNotFound(name.to_string()));
        }
        let handle = StageHandle(state.handle());
        state.stages.insert(handle, name.to_string());
        Ok(handle)
    }

    fn bind_buffer(&self, stage: StageHandle, slot: u32, buffer: BufferHandle) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(BackendCall::BindBuffer { stage, slot, buffer });
        if self.reject_bind_slot == Some(slot) {
            return Err(ClusterFlowError::BackendError(format!(
                "slot {} rejected",
                slot
            )));
        }
        Ok(())
    }

    fn bind_scalar(&self, stage: StageHandle, slot: u32, value: u64) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(BackendCall::BindScalar { stage, slot, value });
        if self.reject_bind_slot == Some(slot) {
            return Err(ClusterFlowError::BackendError(format!(
                "slot {} rejected",
                slot
            )));
        }
        Ok(())
    }

    fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        self.enqueue(
            BackendCall::EnqueueWrite {
                buffer,
                bytes: data.len(),
                wait: wait.to_vec(),
            },
            wait,
            None,
        )
    }

    fn enqueue_stage(&self, stage: StageHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        self.enqueue(
            BackendCall::EnqueueStage {
                stage,
                wait: wait.to_vec(),
            },
            wait,
            None,
        )
    }

    fn enqueue_read(&self, buffer: BufferHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        self.enqueue(
            BackendCall::EnqueueRead {
                buffer,
                wait: wait.to_vec(),
            },
            wait,
            Some(buffer),
        )
    }

    async fn drain(&self) -> Result<()> {
        self.state.lock().calls.push(BackendCall::Drain);
        if let Some(delay) = self.drain_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_drain {
            return Err(ClusterFlowError::Completion(
                "injected drain failure".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let State {
            pending,
            buffers,
            completed_reads,
            ..
        } = &mut *state;
        // Wait-lists only reference earlier events, so one pass in
        // submission order resolves every dependency.
        let mut ends: HashMap<EventHandle, u64> = HashMap::new();
        for op in pending.iter_mut() {
            if op.done.is_some() {
                ends.insert(op.event, op.done.map_or(0, |t| t.end_ns));
                continue;
            }
            let start_ns = op
                .wait
                .iter()
                .filter_map(|w| ends.get(w))
                .copied()
                .max()
                .unwrap_or(0);
            let ts = OpTimestamps {
                start_ns,
                end_ns: start_ns + self.op_latency_ns,
            };
            op.done = Some(ts);
            ends.insert(op.event, ts.end_ns);
            if let Some(buffer) = op.read_of {
                let size = buffers.get(&buffer).copied().unwrap_or(0);
                completed_reads.insert(buffer, size);
            }
        }
        Ok(())
    }

    fn timestamps(&self, event: EventHandle) -> Result<OpTimestamps> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Timestamps { event });
        state
            .pending
            .iter()
            .find(|p| p.event == event)
            .and_then(|p| p.done)
            .ok_or_else(|| ClusterFlowError::BackendError(format!("{} not complete", event)))
    }

    fn read_back(&self, buffer: BufferHandle) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::ReadBack { buffer });
        let index = state.read_backs;
        state.read_backs += 1;
        if self.fail_read_back_at == Some(index) {
            return Err(ClusterFlowError::BackendError(format!(
                "injected failure on read back {}",
                index
            )));
        }
        state
            .completed_reads
            .get(&buffer)
            .map(|size| vec![0u8; *size])
            .ok_or_else(|| {
                ClusterFlowError::BackendError(format!("no completed read of {:?}", buffer))
            })
    }

    fn release(&self, buffer: BufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Release { buffer });
        state.completed_reads.remove(&buffer);
        state
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| ClusterFlowError::BackendError(format!("unknown {:?}", buffer)))
    }
}
