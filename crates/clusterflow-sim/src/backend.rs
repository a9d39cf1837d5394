//! Simulated accelerator backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use clusterflow_core::backend::{
    AccessMode, BackendKind, BufferHandle, ComputeBackend, DeviceInfo, EventHandle, OpTimestamps,
    PlatformInfo, StageHandle,
};
use clusterflow_core::error::{ClusterFlowError, Result};

use crate::config::SimConfig;
use crate::image::{SimImage, SimStageSpec, StageRole};

/// Completion state of one simulated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpStatus {
    Pending,
    Complete(OpTimestamps),
    Failed(String),
}

impl OpStatus {
    fn is_finished(&self) -> bool {
        !matches!(self, OpStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy)]
enum StageArg {
    Buffer(BufferHandle),
    Scalar(u64),
}

#[derive(Debug)]
struct SimBuffer {
    size: usize,
    access: AccessMode,
    // Grown on first write; bytes past `data.len()` read as zero.
    data: Vec<u8>,
}

impl SimBuffer {
    fn snapshot(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.resize(self.size, 0);
        out
    }
}

#[derive(Debug)]
struct BoundStage {
    spec: SimStageSpec,
    args: HashMap<u32, StageArg>,
}

impl BoundStage {
    fn buffer_arg(&self, slot: u32) -> std::result::Result<BufferHandle, String> {
        match self.args.get(&slot) {
            Some(StageArg::Buffer(b)) => Ok(*b),
            Some(StageArg::Scalar(_)) => Err(format!(
                "argument {} of stage {} is a scalar, expected a buffer",
                slot, self.spec.name
            )),
            None => Err(format!(
                "argument {} of stage {} not bound",
                slot, self.spec.name
            )),
        }
    }

    fn scalar_arg(&self, slot: u32) -> std::result::Result<u64, String> {
        match self.args.get(&slot) {
            Some(StageArg::Scalar(v)) => Ok(*v),
            Some(StageArg::Buffer(_)) => Err(format!(
                "argument {} of stage {} is a buffer, expected a scalar",
                slot, self.spec.name
            )),
            None => Err(format!(
                "argument {} of stage {} not bound",
                slot, self.spec.name
            )),
        }
    }
}

#[derive(Debug)]
enum Op {
    Write { buffer: BufferHandle, data: Vec<u8> },
    Stage { stage: StageHandle },
    Read { buffer: BufferHandle },
}

#[derive(Debug, Default)]
struct SimState {
    program: Option<(DeviceInfo, SimImage)>,
    buffers: HashMap<BufferHandle, SimBuffer>,
    stages: HashMap<StageHandle, BoundStage>,
    streams: HashMap<String, Vec<u64>>,
    events: HashMap<EventHandle, watch::Receiver<OpStatus>>,
    undrained: Vec<EventHandle>,
    // Events of the last drain; their timestamps stay readable until the
    // next drain starts.
    retired: Vec<EventHandle>,
    host_reads: HashMap<BufferHandle, Vec<u8>>,
}

struct Inner {
    config: SimConfig,
    clock: Instant,
    next_handle: AtomicU64,
    submissions: AtomicUsize,
    state: Mutex<SimState>,
}

impl Inner {
    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn now_ns(&self) -> u64 {
        self.clock.elapsed().as_nanos() as u64
    }

    fn transfer_time(&self, bytes: usize) -> Duration {
        match self.config.transfer_bytes_per_us {
            0 => Duration::ZERO,
            bw => Duration::from_nanos(bytes as u64 * 1_000 / bw),
        }
    }

    fn latency(&self, op: &Op) -> Duration {
        let state = self.state.lock();
        match op {
            Op::Write { data, .. } => self.transfer_time(data.len()),
            Op::Read { buffer } => self.transfer_time(state.buffers.get(buffer).map_or(0, |b| b.size)),
            Op::Stage { stage } => state
                .stages
                .get(stage)
                .map_or(Duration::ZERO, |s| Duration::from_micros(s.spec.latency_us)),
        }
    }

    async fn execute(&self, op: Op, deps: Vec<(EventHandle, watch::Receiver<OpStatus>)>) -> OpStatus {
        for (event, mut rx) in deps {
            let status = rx
                .wait_for(OpStatus::is_finished)
                .await
                .map(|s| s.clone())
                .unwrap_or_else(|_| OpStatus::Failed("operation dropped".to_string()));
            if let OpStatus::Failed(reason) = status {
                return OpStatus::Failed(format!("waited on failed {}: {}", event, reason));
            }
        }

        let start_ns = self.now_ns();
        let latency = self.latency(&op);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let effect = {
            let mut state = self.state.lock();
            self.apply(&mut state, op)
        };
        match effect {
            Ok(()) => OpStatus::Complete(OpTimestamps {
                start_ns,
                end_ns: self.now_ns(),
            }),
            Err(reason) => OpStatus::Failed(reason),
        }
    }

    fn apply(&self, state: &mut SimState, op: Op) -> std::result::Result<(), String> {
        match op {
            Op::Write { buffer, data } => {
                let buf = state
                    .buffers
                    .get_mut(&buffer)
                    .ok_or_else(|| format!("unknown buffer {:?}", buffer))?;
                if buf.data.len() < data.len() {
                    buf.data.resize(data.len(), 0);
                }
                buf.data[..data.len()].copy_from_slice(&data);
                Ok(())
            }
            Op::Read { buffer } => {
                let copy = state
                    .buffers
                    .get(&buffer)
                    .map(SimBuffer::snapshot)
                    .ok_or_else(|| format!("unknown buffer {:?}", buffer))?;
                state.host_reads.insert(buffer, copy);
                Ok(())
            }
            Op::Stage { stage } => {
                let bound = state
                    .stages
                    .get(&stage)
                    .ok_or_else(|| format!("unknown stage {:?}", stage))?;
                if self.config.fails_stage(&bound.spec.name) {
                    return Err(format!("stage {} faulted", bound.spec.name));
                }
                match bound.spec.role {
                    StageRole::Loader => run_loader(state, stage),
                    StageRole::Writer => run_writer(state, stage),
                }
            }
        }
    }
}

fn run_loader(state: &mut SimState, stage: StageHandle) -> std::result::Result<(), String> {
    let bound = &state.stages[&stage];
    let spec = &bound.spec;
    let buffer = bound.buffer_arg(spec.buffer_slot)?;
    let len_slot = spec
        .len_slot
        .ok_or_else(|| format!("loader {} declares no length slot", spec.name))?;
    let len = bound.scalar_arg(len_slot)? as usize;
    if len > spec.capacity_words {
        return Err(format!(
            "{} received {} words, capacity is {}",
            spec.name, len, spec.capacity_words
        ));
    }

    let buf = state
        .buffers
        .get(&buffer)
        .ok_or_else(|| format!("unknown buffer {:?}", buffer))?;
    let bytes = len * std::mem::size_of::<u64>();
    if bytes > buf.size {
        return Err(format!(
            "{} reads {} bytes from a {} byte buffer",
            spec.name, bytes, buf.size
        ));
    }
    let mut raw = buf.data.get(..bytes.min(buf.data.len())).unwrap_or(&[]).to_vec();
    raw.resize(bytes, 0);
    let words: Vec<u64> = bytemuck::pod_collect_to_vec(&raw);

    let stream = spec.stream.clone();
    state.streams.insert(stream, words);
    Ok(())
}

fn run_writer(state: &mut SimState, stage: StageHandle) -> std::result::Result<(), String> {
    let bound = &state.stages[&stage];
    let spec = &bound.spec;
    let buffer = bound.buffer_arg(spec.buffer_slot)?;
    let header_words = spec.header_words;
    let name = spec.name.clone();
    let words = state.streams.remove(&spec.stream).unwrap_or_default();

    let buf = state
        .buffers
        .get_mut(&buffer)
        .ok_or_else(|| format!("unknown buffer {:?}", buffer))?;
    if !buf.access.device_writable() {
        return Err(format!("{} output buffer is not device-writable", name));
    }

    let mut out = vec![0u32; buf.size / std::mem::size_of::<u32>()];
    if let Some(count) = out.first_mut() {
        *count = words.len() as u32;
    }
    for (i, word) in words.iter().enumerate() {
        let idx = header_words + 2 * i;
        if idx + 1 >= out.len() {
            break;
        }
        out[idx] = *word as u32;
        out[idx + 1] = (*word >> 32) as u32;
    }
    buf.data = bytemuck::cast_slice(&out).to_vec();
    Ok(())
}

/// Simulated accelerator.
///
/// Operations run on tokio tasks as soon as their wait-lists resolve, so
/// two operations without an edge between them may run in either order.
/// Timestamps come from a device clock started when the backend is created.
/// Enqueues must be issued from inside a tokio runtime.
pub struct SimBackend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SimBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBackend")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// Create a simulator with the default catalog and no faults.
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    /// Create a simulator with explicit settings.
    pub fn with_config(config: SimConfig) -> Self {
        info!(
            platforms = config.platforms.len(),
            faults = config.faults.len(),
            "Initializing simulated accelerator"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                clock: Instant::now(),
                next_handle: AtomicU64::new(0),
                submissions: AtomicUsize::new(0),
                state: Mutex::new(SimState::default()),
            }),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &SimConfig {
        &self.inner.config
    }

    /// Names of the stages in the loaded image.
    pub fn stage_names(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .program
            .as_ref()
            .map(|(_, image)| image.stages.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    fn enqueue(&self, op: Op, wait: &[EventHandle]) -> Result<EventHandle> {
        let index = self.inner.submissions.fetch_add(1, Ordering::Relaxed);
        if self.inner.config.rejects_submission(index) {
            warn!(index, "Injected submission rejection");
            return Err(ClusterFlowError::BackendError(format!(
                "submission {} rejected by device",
                index
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            ClusterFlowError::BackendError(format!("simulated channel needs a tokio runtime: {}", e))
        })?;

        let mut state = self.inner.state.lock();
        match &op {
            Op::Write { buffer, data } => {
                let buf = state.buffers.get(buffer).ok_or_else(|| {
                    ClusterFlowError::BackendError(format!("unknown buffer {:?}", buffer))
                })?;
                if data.len() > buf.size {
                    return Err(ClusterFlowError::BackendError(format!(
                        "write of {} bytes exceeds {} byte buffer",
                        data.len(),
                        buf.size
                    )));
                }
            }
            Op::Read { buffer } => {
                if !state.buffers.contains_key(buffer) {
                    return Err(ClusterFlowError::BackendError(format!(
                        "unknown buffer {:?}",
                        buffer
                    )));
                }
            }
            Op::Stage { stage } => {
                if !state.stages.contains_key(stage) {
                    return Err(ClusterFlowError::BackendError(format!(
                        "unknown stage {:?}",
                        stage
                    )));
                }
            }
        }

        let deps = wait
            .iter()
            .map(|w| {
                state
                    .events
                    .get(w)
                    .cloned()
                    .map(|rx| (*w, rx))
                    .ok_or_else(|| {
                        ClusterFlowError::BackendError(format!("wait-list references unknown {}", w))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let event = EventHandle(self.inner.handle());
        let (tx, rx) = watch::channel(OpStatus::Pending);
        state.events.insert(event, rx);
        state.undrained.push(event);
        drop(state);

        debug!(%event, ?wait, "Simulated op queued");
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let status = inner.execute(op, deps).await;
            let _ = tx.send(status);
        });
        Ok(event)
    }
}

#[async_trait]
impl ComputeBackend for SimBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sim
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(self.inner.config.platforms.clone())
    }

    fn load_program(&self, device: &DeviceInfo, image: &[u8]) -> Result<()> {
        let known = self
            .inner
            .config
            .platforms
            .iter()
            .flat_map(|p| p.devices.iter())
            .any(|d| d.id == device.id);
        if !known {
            return Err(ClusterFlowError::BackendError(format!(
                "device {} is not part of this simulator",
                device.name
            )));
        }
        let image = SimImage::from_bytes(image)?;
        info!(
            device = %device.name,
            stages = image.stages.len(),
            "xclbin program done"
        );

        let mut state = self.inner.state.lock();
        state.stages.clear();
        state.streams.clear();
        state.program = Some((device.clone(), image));
        Ok(())
    }

    fn allocate(&self, size_bytes: usize, access: AccessMode) -> Result<BufferHandle> {
        if size_bytes == 0 {
            return Err(ClusterFlowError::BackendError(
                "zero-sized buffer".to_string(),
            ));
        }
        let handle = BufferHandle(self.inner.handle());
        self.inner.state.lock().buffers.insert(
            handle,
            SimBuffer {
                size: size_bytes,
                access,
                data: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn create_stage(&self, name: &str) -> Result<StageHandle> {
        let mut state = self.inner.state.lock();
        let (_, image) = state.program.as_ref().ok_or_else(|| {
            ClusterFlowError::BackendError("no program loaded".to_string())
        })?;
        let spec = image
            .stage(name)
            .cloned()
            .ok_or_else(|| ClusterFlowError::StageNotFound(name.to_string()))?;
        let handle = StageHandle(self.inner.handle());
        state.stages.insert(
            handle,
            BoundStage {
                spec,
                args: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn bind_buffer(&self, stage: StageHandle, slot: u32, buffer: BufferHandle) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.buffers.contains_key(&buffer) {
            return Err(ClusterFlowError::BackendError(format!(
                "unknown buffer {:?}",
                buffer
            )));
        }
        bind(&mut state, stage, slot, StageArg::Buffer(buffer))
    }

    fn bind_scalar(&self, stage: StageHandle, slot: u32, value: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        bind(&mut state, stage, slot, StageArg::Scalar(value))
    }

    fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        self.enqueue(
            Op::Write {
                buffer,
                data: data.to_vec(),
            },
            wait,
        )
    }

    fn enqueue_stage(&self, stage: StageHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        self.enqueue(Op::Stage { stage }, wait)
    }

    fn enqueue_read(&self, buffer: BufferHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        self.enqueue(Op::Read { buffer }, wait)
    }

    async fn drain(&self) -> Result<()> {
        let pending: Vec<(EventHandle, watch::Receiver<OpStatus>)> = {
            let mut state = self.inner.state.lock();
            let SimState {
                events,
                undrained,
                retired,
                ..
            } = &mut *state;
            for event in retired.drain(..) {
                events.remove(&event);
            }
            let batch = std::mem::take(undrained);
            retired.extend_from_slice(&batch);
            batch
                .into_iter()
                .filter_map(|e| events.get(&e).cloned().map(|rx| (e, rx)))
                .collect()
        };
        debug!(operations = pending.len(), "Draining simulated channel");

        let mut failure = None;
        for (event, mut rx) in pending {
            let status = rx
                .wait_for(OpStatus::is_finished)
                .await
                .map(|s| s.clone())
                .unwrap_or_else(|_| OpStatus::Failed("operation dropped".to_string()));
            if let OpStatus::Failed(reason) = status {
                failure.get_or_insert_with(|| format!("{} failed: {}", event, reason));
            }
        }

        match failure {
            Some(reason) => Err(ClusterFlowError::Completion(reason)),
            None => Ok(()),
        }
    }

    fn timestamps(&self, event: EventHandle) -> Result<OpTimestamps> {
        let state = self.inner.state.lock();
        let rx = state
            .events
            .get(&event)
            .ok_or_else(|| ClusterFlowError::BackendError(format!("unknown {}", event)))?;
        let status = rx.borrow().clone();
        match status {
            OpStatus::Complete(ts) => Ok(ts),
            OpStatus::Pending => Err(ClusterFlowError::BackendError(format!(
                "{} has not completed",
                event
            ))),
            OpStatus::Failed(reason) => Err(ClusterFlowError::BackendError(format!(
                "{} failed: {}",
                event, reason
            ))),
        }
    }

    fn read_back(&self, buffer: BufferHandle) -> Result<Vec<u8>> {
        self.inner
            .state
            .lock()
            .host_reads
            .get(&buffer)
            .cloned()
            .ok_or_else(|| {
                ClusterFlowError::BackendError(format!("no completed read of {:?}", buffer))
            })
    }

    fn release(&self, buffer: BufferHandle) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.host_reads.remove(&buffer);
        if state.buffers.remove(&buffer).is_none() {
            return Err(ClusterFlowError::BackendError(format!(
                "unknown buffer {:?}",
                buffer
            )));
        }
        debug!(?buffer, "Simulated buffer freed");
        Ok(())
    }
}

fn bind(state: &mut SimState, stage: StageHandle, slot: u32, arg: StageArg) -> Result<()> {
    let bound = state
        .stages
        .get_mut(&stage)
        .ok_or_else(|| ClusterFlowError::BackendError(format!("unknown stage {:?}", stage)))?;
    if slot >= bound.spec.args {
        return Err(ClusterFlowError::BackendError(format!(
            "slot {} out of range, {} takes {} arguments",
            slot, bound.spec.name, bound.spec.args
        )));
    }
    bound.args.insert(slot, arg);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimFault;
    use clusterflow_core::config::{DeviceClass, PipelineConfig};

    struct Rig {
        backend: SimBackend,
        config: PipelineConfig,
    }

    impl Rig {
        fn new(sim: SimConfig) -> Self {
            let backend = SimBackend::with_config(sim);
            let config = PipelineConfig::default();
            let device = accelerator(&backend);
            let image = SimImage::for_config(&config).to_toml().unwrap();
            backend.load_program(&device, image.as_bytes()).unwrap();
            Self { backend, config }
        }

        /// Allocate and bind one pixel lane, returning (input, output, loader, writer).
        fn pixel_lane(
            &self,
            len: usize,
            output_bytes: usize,
        ) -> (BufferHandle, BufferHandle, StageHandle, StageHandle) {
            let b = &self.backend;
            let input = b.allocate(len.max(1) * 8, AccessMode::ReadOnly).unwrap();
            let output = b.allocate(output_bytes, AccessMode::ReadWrite).unwrap();
            let loader = b.create_stage(&self.config.pixel_stages.start).unwrap();
            let writer = b.create_stage(&self.config.pixel_stages.end).unwrap();
            b.bind_buffer(loader, 0, input).unwrap();
            b.bind_scalar(loader, 2, len as u64).unwrap();
            b.bind_buffer(writer, 2, output).unwrap();
            (input, output, loader, writer)
        }
    }

    fn accelerator(backend: &SimBackend) -> DeviceInfo {
        backend
            .platforms()
            .unwrap()
            .into_iter()
            .flat_map(|p| p.devices)
            .find(|d| d.class == DeviceClass::Accelerator)
            .unwrap()
    }

    #[test]
    fn test_default_catalog_has_xilinx_accelerator() {
        let backend = SimBackend::new();
        let platforms = backend.platforms().unwrap();
        assert!(platforms.iter().any(|p| p.name.contains("Xilinx")
            && p.devices.iter().any(|d| d.class == DeviceClass::Accelerator)));
    }

    #[test]
    fn test_rejects_foreign_image() {
        let backend = SimBackend::new();
        let device = accelerator(&backend);
        let err = backend.load_program(&device, b"\x7fELF").unwrap_err();
        assert!(matches!(err, ClusterFlowError::BackendError(_)));
        assert!(backend.stage_names().is_empty());
    }

    #[test]
    fn test_unknown_stage() {
        let rig = Rig::new(SimConfig::default());
        let err = rig.backend.create_stage("EDMWriter:{TrackWriter}").unwrap_err();
        assert!(matches!(err, ClusterFlowError::StageNotFound(_)));
    }

    #[test]
    fn test_bind_outside_arg_count() {
        let rig = Rig::new(SimConfig::default());
        let writer = rig.backend.create_stage(&rig.config.pixel_stages.end).unwrap();
        let out = rig.backend.allocate(64, AccessMode::ReadWrite).unwrap();
        assert!(rig.backend.bind_buffer(writer, 3, out).is_err());
    }

    #[tokio::test]
    async fn test_loader_and_writer_move_words() {
        let rig = Rig::new(SimConfig::default());
        let b = &rig.backend;
        let words: Vec<u64> = vec![0x1111_2222_3333_4444, 0xaaaa_bbbb_cccc_dddd, 7];
        let (input, output, loader, writer) = rig.pixel_lane(words.len(), 4096);

        let w = b.enqueue_write(input, bytemuck::cast_slice(&words), &[]).unwrap();
        let s = b.enqueue_stage(loader, &[w]).unwrap();
        let e = b.enqueue_stage(writer, &[s]).unwrap();
        let r = b.enqueue_read(output, &[e]).unwrap();
        b.drain().await.unwrap();

        let out: Vec<u32> = bytemuck::pod_collect_to_vec(&b.read_back(output).unwrap());
        assert_eq!(out.len(), 1024);
        assert_eq!(out[0], 3);
        assert_eq!(&out[16..22], &[0x3333_4444, 0x1111_2222, 0xcccc_dddd, 0xaaaa_bbbb, 7, 0]);

        let ts = |ev| b.timestamps(ev).unwrap();
        assert!(ts(w).end_ns <= ts(s).start_ns);
        assert!(ts(s).end_ns <= ts(e).start_ns);
        assert!(ts(e).end_ns <= ts(r).start_ns);
    }

    #[tokio::test]
    async fn test_writer_truncates_to_buffer() {
        let rig = Rig::new(SimConfig::default());
        let b = &rig.backend;
        let words: Vec<u64> = (1..=100).collect();
        // 32 u32 words: 16 header + 8 payload pairs
        let (input, output, loader, writer) = rig.pixel_lane(words.len(), 128);

        let w = b.enqueue_write(input, bytemuck::cast_slice(&words), &[]).unwrap();
        let s = b.enqueue_stage(loader, &[w]).unwrap();
        let e = b.enqueue_stage(writer, &[s]).unwrap();
        b.enqueue_read(output, &[e]).unwrap();
        b.drain().await.unwrap();

        let out: Vec<u32> = bytemuck::pod_collect_to_vec(&b.read_back(output).unwrap());
        assert_eq!(out.len(), 32);
        assert_eq!(out[0], 100);
        assert_eq!(out[30], 8);
        assert_eq!(out[31], 0);
    }

    #[tokio::test]
    async fn test_stage_fault_fails_dependents_and_drain() {
        let config = PipelineConfig::default();
        let rig = Rig::new(
            SimConfig::default().with_fault(SimFault::FailStage(config.pixel_stages.start.clone())),
        );
        let b = &rig.backend;
        let (input, output, loader, writer) = rig.pixel_lane(1, 4096);

        let w = b.enqueue_write(input, &[0; 8], &[]).unwrap();
        let s = b.enqueue_stage(loader, &[w]).unwrap();
        let e = b.enqueue_stage(writer, &[s]).unwrap();
        let r = b.enqueue_read(output, &[e]).unwrap();

        let err = b.drain().await.unwrap_err();
        assert!(matches!(err, ClusterFlowError::Completion(msg) if msg.contains("faulted")));
        assert!(b.timestamps(w).is_ok());
        assert!(b.timestamps(r).is_err());
        assert!(b.read_back(output).is_err());
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let rig = Rig::new(SimConfig::default().with_fault(SimFault::RejectSubmission(1)));
        let b = &rig.backend;
        let (input, _, loader, _) = rig.pixel_lane(1, 4096);
        let w = b.enqueue_write(input, &[0; 8], &[]).unwrap();
        assert!(b.enqueue_stage(loader, &[w]).is_err());
        b.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_write_rejected_at_enqueue() {
        let rig = Rig::new(SimConfig::default());
        let buffer = rig.backend.allocate(8, AccessMode::ReadOnly).unwrap();
        assert!(rig.backend.enqueue_write(buffer, &[0; 16], &[]).is_err());
    }

    #[test]
    fn test_enqueue_outside_runtime_fails() {
        let rig = Rig::new(SimConfig::default());
        let buffer = rig.backend.allocate(8, AccessMode::ReadOnly).unwrap();
        let err = rig.backend.enqueue_write(buffer, &[0; 8], &[]).unwrap_err();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn test_events_of_earlier_drains_are_forgotten() {
        let rig = Rig::new(SimConfig::default());
        let b = &rig.backend;
        let (input, output, loader, writer) = rig.pixel_lane(1, 4096);
        let mut last = Vec::new();
        for _ in 0..3 {
            let w = b.enqueue_write(input, &[0; 8], &[]).unwrap();
            let s = b.enqueue_stage(loader, &[w]).unwrap();
            let e = b.enqueue_stage(writer, &[s]).unwrap();
            let r = b.enqueue_read(output, &[e]).unwrap();
            b.drain().await.unwrap();
            last = vec![w, s, e, r];
        }

        assert_eq!(b.inner.state.lock().events.len(), 4);
        for event in last {
            assert!(b.timestamps(event).is_ok());
        }
    }

    #[tokio::test]
    async fn test_release_drops_buffer_and_host_copy() {
        let rig = Rig::new(SimConfig::default());
        let b = &rig.backend;
        let buffer = b.allocate(64, AccessMode::ReadWrite).unwrap();
        b.enqueue_read(buffer, &[]).unwrap();
        b.drain().await.unwrap();
        assert!(b.read_back(buffer).is_ok());

        b.release(buffer).unwrap();
        assert!(b.read_back(buffer).is_err());
        assert!(b.enqueue_read(buffer, &[]).is_err());
        assert!(b.release(buffer).is_err());
    }

    #[tokio::test]
    async fn test_timestamps_before_completion() {
        let rig = Rig::new(SimConfig::default().with_bandwidth(1));
        let buffer = rig.backend.allocate(1 << 20, AccessMode::ReadWrite).unwrap();
        let r = rig.backend.enqueue_read(buffer, &[]).unwrap();
        assert!(rig.backend.timestamps(r).is_err());
    }
}
