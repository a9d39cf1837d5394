//! OpenCL implementation of [`ComputeBackend`].

use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

use async_trait::async_trait;
use opencl3::command_queue::{
    CommandQueue, CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, CL_QUEUE_PROFILING_ENABLE,
};
use opencl3::context::Context;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_device_type, cl_event, CL_NON_BLOCKING};
use parking_lot::Mutex;
use tracing::{debug, info};

use clusterflow_core::backend::{
    AccessMode, BackendKind, BufferHandle, ComputeBackend, DeviceId, DeviceInfo, EventHandle,
    OpTimestamps, PlatformInfo, StageHandle,
};
use clusterflow_core::config::DeviceClass;
use clusterflow_core::error::{ClusterFlowError, Result};

const CLASSES: [(DeviceClass, cl_device_type); 3] = [
    (DeviceClass::Accelerator, CL_DEVICE_TYPE_ACCELERATOR),
    (DeviceClass::Gpu, CL_DEVICE_TYPE_GPU),
    (DeviceClass::Cpu, CL_DEVICE_TYPE_CPU),
];

fn cl_err(what: &str) -> impl FnOnce(opencl3::error_codes::ClError) -> ClusterFlowError + '_ {
    move |e| ClusterFlowError::BackendError(format!("{}: {}", what, e))
}

struct Loaded {
    device: cl_device_id,
    context: Context,
    queue: Arc<SharedQueue>,
    program: Program,
}

/// Command queue that a blocking task can wait on without the state lock.
struct SharedQueue(CommandQueue);

// SAFETY: OpenCL command queues are thread-safe objects; the blocking task
// only calls clFinish on it.
unsafe impl Send for SharedQueue {}
unsafe impl Sync for SharedQueue {}

#[derive(Default)]
struct ClState {
    // Device ids seen by the last discovery, indexed by `DeviceId`.
    devices: Vec<usize>,
    loaded: Option<Loaded>,
    buffers: HashMap<BufferHandle, (Buffer<u8>, usize)>,
    kernels: HashMap<StageHandle, Kernel>,
    events: HashMap<EventHandle, Event>,
    // Host memory referenced by in-flight transfers; freed after the drain.
    staged_writes: Vec<Vec<u8>>,
    inflight_reads: Vec<(BufferHandle, Vec<u8>)>,
    host_reads: HashMap<BufferHandle, Vec<u8>>,
    next_handle: u64,
}

// SAFETY: every OpenCL object in the state is only touched behind the
// mutex, and OpenCL API calls other than clSetKernelArg are thread-safe.
unsafe impl Send for ClState {}

impl ClState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn loaded(&self) -> Result<&Loaded> {
        self.loaded
            .as_ref()
            .ok_or_else(|| ClusterFlowError::BackendError("no program loaded".to_string()))
    }

    fn wait_list(&self, wait: &[EventHandle]) -> Result<Vec<cl_event>> {
        wait.iter()
            .map(|w| {
                self.events.get(w).map(Event::get).ok_or_else(|| {
                    ClusterFlowError::BackendError(format!("wait-list references unknown {}", w))
                })
            })
            .collect()
    }

    fn record(&mut self, event: Event) -> EventHandle {
        let handle = EventHandle(self.handle());
        self.events.insert(handle, event);
        handle
    }
}

/// OpenCL device backend.
pub struct OpenClBackend {
    state: Mutex<ClState>,
}

impl std::fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClBackend")
            .field("loaded", &self.state.lock().loaded.is_some())
            .finish()
    }
}

impl OpenClBackend {
    /// Create the backend. Devices are discovered on [`ComputeBackend::platforms`].
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: Mutex::new(ClState::default()),
        })
    }
}

#[async_trait]
impl ComputeBackend for OpenClBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenCl
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        let mut state = self.state.lock();
        state.devices.clear();

        let mut out = Vec::new();
        for platform in get_platforms().map_err(cl_err("clGetPlatformIDs"))? {
            let name = platform.name().map_err(cl_err("clGetPlatformInfo"))?;
            let mut devices = Vec::new();
            for (class, cl_type) in CLASSES {
                // CL_DEVICE_NOT_FOUND is reported as an error; treat it as empty.
                let ids = platform.get_devices(cl_type).unwrap_or_default();
                for id in ids {
                    let device_name = Device::new(id)
                        .name()
                        .map_err(cl_err("clGetDeviceInfo"))?;
                    let index = state.devices.len() as u64;
                    state.devices.push(id as usize);
                    devices.push(DeviceInfo {
                        id: DeviceId(index),
                        name: device_name,
                        class,
                    });
                }
            }
            out.push(PlatformInfo { name, devices });
        }
        Ok(out)
    }

    fn load_program(&self, device: &DeviceInfo, image: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let device_id = state
            .devices
            .get(device.id.0 as usize)
            .map(|raw| *raw as cl_device_id)
            .ok_or_else(|| {
                ClusterFlowError::BackendError(format!("unknown device {}", device.name))
            })?;

        let cl_device = Device::new(device_id);
        let context = Context::from_device(&cl_device).map_err(cl_err("clCreateContext"))?;
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(
            &context,
            CL_QUEUE_PROFILING_ENABLE | CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE,
        )
        .map_err(cl_err("clCreateCommandQueue"))?;

        // SAFETY: the binary is only handed to the driver, which validates it.
        #[allow(unused_unsafe)]
        let mut program = unsafe { Program::create_from_binary(&context, &[device_id], &[image]) }
            .map_err(cl_err("clCreateProgramWithBinary"))?;
        program
            .build(&[device_id], "")
            .map_err(cl_err("clBuildProgram"))?;

        info!(device = %device.name, bytes = image.len(), "xclbin program done");
        state.kernels.clear();
        state.loaded = Some(Loaded {
            device: device_id,
            context,
            queue: Arc::new(SharedQueue(queue)),
            program,
        });
        Ok(())
    }

    fn allocate(&self, size_bytes: usize, access: AccessMode) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        let flags = match access {
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
            AccessMode::ReadWrite => CL_MEM_READ_WRITE,
        };
        let loaded = state.loaded()?;
        // SAFETY: no host pointer is passed, the driver owns the allocation.
        let buffer = unsafe {
            Buffer::<u8>::create(&loaded.context, flags, size_bytes, ptr::null_mut())
        }
        .map_err(cl_err("clCreateBuffer"))?;
        let handle = BufferHandle(state.handle());
        state.buffers.insert(handle, (buffer, size_bytes));
        Ok(handle)
    }

    fn create_stage(&self, name: &str) -> Result<StageHandle> {
        let mut state = self.state.lock();
        let loaded = state.loaded()?;
        let kernel = Kernel::create(&loaded.program, name)
            .map_err(|_| ClusterFlowError::StageNotFound(name.to_string()))?;
        let handle = StageHandle(state.handle());
        state.kernels.insert(handle, kernel);
        debug!(stage = name, ?handle, device = ?loaded_device(&state), "Kernel created");
        Ok(handle)
    }

    fn bind_buffer(&self, stage: StageHandle, slot: u32, buffer: BufferHandle) -> Result<()> {
        let state = self.state.lock();
        let kernel = kernel(&state, stage)?;
        let (buf, _) = state.buffers.get(&buffer).ok_or_else(|| {
            ClusterFlowError::BackendError(format!("unknown buffer {:?}", buffer))
        })?;
        // SAFETY: the argument is a live cl_mem of this context.
        unsafe { kernel.set_arg(slot, &buf.get()) }.map_err(cl_err("clSetKernelArg"))
    }

    fn bind_scalar(&self, stage: StageHandle, slot: u32, value: u64) -> Result<()> {
        let state = self.state.lock();
        let kernel = kernel(&state, stage)?;
        // SAFETY: the kernel declares this slot as cl_ulong.
        unsafe { kernel.set_arg(slot, &value) }.map_err(cl_err("clSetKernelArg"))
    }

    fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        let mut state = self.state.lock();
        let wait = state.wait_list(wait)?;
        let host = staged_copy(data);
        let event = {
            let ClState {
                loaded, buffers, ..
            } = &mut *state;
            let queue = &loaded
                .as_ref()
                .ok_or_else(|| ClusterFlowError::BackendError("no program loaded".to_string()))?
                .queue
                .0;
            let (buf, _) = buffers.get_mut(&buffer).ok_or_else(|| {
                ClusterFlowError::BackendError(format!("unknown buffer {:?}", buffer))
            })?;
            // SAFETY: `host` is kept in `staged_writes` until the drain.
            let write =
                unsafe { queue.enqueue_write_buffer(buf, CL_NON_BLOCKING, 0, &host, &wait) };
            write.map_err(cl_err("clEnqueueWriteBuffer"))?
        };
        state.staged_writes.push(host);
        Ok(state.record(event))
    }

    fn enqueue_stage(&self, stage: StageHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        let mut state = self.state.lock();
        let wait = state.wait_list(wait)?;
        let event = {
            let kernel = kernel(&state, stage)?;
            let queue = &state.loaded()?.queue.0;
            // SAFETY: all host-visible arguments were bound before submission.
            #[allow(deprecated)]
            let task = unsafe { queue.enqueue_task(kernel.get(), &wait) };
            task.map_err(cl_err("clEnqueueTask"))?
        };
        Ok(state.record(event))
    }

    fn enqueue_read(&self, buffer: BufferHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        let mut state = self.state.lock();
        let wait = state.wait_list(wait)?;
        let (buf, size) = state.buffers.get(&buffer).ok_or_else(|| {
            ClusterFlowError::BackendError(format!("unknown buffer {:?}", buffer))
        })?;
        let mut host = vec![0u8; *size];
        let queue = &state.loaded()?.queue.0;
        // SAFETY: `host` moves into `inflight_reads` without reallocating and
        // stays there until the drain.
        let event = unsafe { queue.enqueue_read_buffer(buf, CL_NON_BLOCKING, 0, &mut host, &wait) }
            .map_err(cl_err("clEnqueueReadBuffer"))?;
        state.inflight_reads.push((buffer, host));
        Ok(state.record(event))
    }

    async fn drain(&self) -> Result<()> {
        let queue = Arc::clone(&self.state.lock().loaded()?.queue);
        // clFinish blocks; run it off the async workers and without the
        // state lock so a caller-side timeout can fire. A dropped drain
        // leaves host copies in place until a later drain completes.
        tokio::task::spawn_blocking(move || queue.0.finish())
            .await
            .map_err(|e| ClusterFlowError::Completion(format!("clFinish task: {}", e)))?
            .map_err(|e| ClusterFlowError::Completion(format!("clFinish: {}", e)))?;

        let mut state = self.state.lock();
        state.staged_writes.clear();
        let reads = std::mem::take(&mut state.inflight_reads);
        for (buffer, host) in reads {
            state.host_reads.insert(buffer, host);
        }
        Ok(())
    }

    fn timestamps(&self, event: EventHandle) -> Result<OpTimestamps> {
        let state = self.state.lock();
        let ev = state
            .events
            .get(&event)
            .ok_or_else(|| ClusterFlowError::BackendError(format!("unknown {}", event)))?;
        Ok(OpTimestamps {
            start_ns: ev
                .profiling_command_start()
                .map_err(cl_err("clGetEventProfilingInfo"))?,
            end_ns: ev
                .profiling_command_end()
                .map_err(cl_err("clGetEventProfilingInfo"))?,
        })
    }

    fn read_back(&self, buffer: BufferHandle) -> Result<Vec<u8>> {
        self.state
            .lock()
            .host_reads
            .get(&buffer)
            .cloned()
            .ok_or_else(|| {
                ClusterFlowError::BackendError(format!("no completed read of {:?}", buffer))
            })
    }

    fn release(&self, buffer: BufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.host_reads.remove(&buffer);
        // Dropping the Buffer releases the cl_mem; commands still queued on
        // it hold their own reference.
        if state.buffers.remove(&buffer).is_none() {
            return Err(ClusterFlowError::BackendError(format!(
                "unknown buffer {:?}",
                buffer
            )));
        }
        debug!(?buffer, "Buffer released");
        Ok(())
    }
}

/// Host bytes for a write. A zero-byte write is invalid in OpenCL, and a
/// marker with an empty wait-list waits on every command already queued,
/// so an empty payload becomes a single zero byte that depends only on its
/// own wait-list.
fn staged_copy(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        vec![0]
    } else {
        data.to_vec()
    }
}

fn kernel(state: &ClState, stage: StageHandle) -> Result<&Kernel> {
    state
        .kernels
        .get(&stage)
        .ok_or_else(|| ClusterFlowError::BackendError(format!("unknown stage {:?}", stage)))
}

fn loaded_device(state: &ClState) -> Option<usize> {
    state.loaded.as_ref().map(|l| l.device as usize)
}
