//! Compute backend abstraction.
//!
//! A backend exposes one device's capability set: platform discovery,
//! program loading, buffer allocation, stage binding, and an out-of-order
//! submission channel with explicit wait-lists. Every enqueue returns
//! immediately with an [`EventHandle`]; the only blocking call is
//! [`ComputeBackend::drain`].
//!
//! Backends make no ordering promise beyond the wait-lists they are given.
//! Callers that need one operation to start after another must say so.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::config::DeviceClass;
use crate::error::{ClusterFlowError, Result};

/// Backend implementations known to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Simulated accelerator running on the host.
    #[default]
    Sim,
    /// OpenCL device (requires the `opencl` feature).
    OpenCl,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sim => write!(f, "sim"),
            BackendKind::OpenCl => write!(f, "opencl"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ClusterFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sim" | "simulated" => Ok(BackendKind::Sim),
            "opencl" | "ocl" => Ok(BackendKind::OpenCl),
            other => Err(ClusterFlowError::InvalidConfig(format!(
                "unknown backend '{}' (expected sim or opencl)",
                other
            ))),
        }
    }
}

/// Device-resident buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Bound pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageHandle(pub u64);

/// Completion event of one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(pub u64);

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// Backend-assigned device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

/// Device access granted to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Device reads only.
    ReadOnly,
    /// Device writes only.
    WriteOnly,
    /// Device reads and writes.
    ReadWrite,
}

impl AccessMode {
    /// Whether a stage may write into the buffer.
    #[must_use]
    pub fn device_writable(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// Kind of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    /// Host-to-device input copy.
    TransferIn,
    /// Start stage invocation.
    ComputeStart,
    /// End stage invocation.
    ComputeEnd,
    /// Device-to-host output copy.
    TransferOut,
}

impl OpKind {
    /// All kinds in per-lane submission order.
    pub const ALL: [OpKind; 4] = [
        OpKind::TransferIn,
        OpKind::ComputeStart,
        OpKind::ComputeEnd,
        OpKind::TransferOut,
    ];

    /// The kind this one must wait on within its lane.
    #[must_use]
    pub fn predecessor(self) -> Option<OpKind> {
        match self {
            OpKind::TransferIn => None,
            OpKind::ComputeStart => Some(OpKind::TransferIn),
            OpKind::ComputeEnd => Some(OpKind::ComputeStart),
            OpKind::TransferOut => Some(OpKind::ComputeEnd),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::TransferIn => write!(f, "TRANSFER_IN"),
            OpKind::ComputeStart => write!(f, "COMPUTE_START"),
            OpKind::ComputeEnd => write!(f, "COMPUTE_END"),
            OpKind::TransferOut => write!(f, "TRANSFER_OUT"),
        }
    }
}

/// A device reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Backend-assigned identifier.
    pub id: DeviceId,
    /// Device name.
    pub name: String,
    /// Device class.
    pub class: DeviceClass,
}

/// A platform and the devices it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Platform (vendor runtime) name.
    pub name: String,
    /// Devices on this platform.
    pub devices: Vec<DeviceInfo>,
}

/// Device-clock start and end of a completed operation, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpTimestamps {
    /// Operation start.
    pub start_ns: u64,
    /// Operation end.
    pub end_ns: u64,
}

impl OpTimestamps {
    /// Span between start and end.
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Capability set of one compute device.
///
/// Handles returned by one backend instance are meaningless to another.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Enumerate platforms and their devices.
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// Load a precompiled program image onto `device`.
    fn load_program(&self, device: &DeviceInfo, image: &[u8]) -> Result<()>;

    /// Allocate a device buffer of `size_bytes`.
    fn allocate(&self, size_bytes: usize, access: AccessMode) -> Result<BufferHandle>;

    /// Look up a stage of the loaded program by name.
    fn create_stage(&self, name: &str) -> Result<StageHandle>;

    /// Bind a buffer to a stage argument slot.
    fn bind_buffer(&self, stage: StageHandle, slot: u32, buffer: BufferHandle) -> Result<()>;

    /// Bind a scalar to a stage argument slot.
    fn bind_scalar(&self, stage: StageHandle, slot: u32, value: u64) -> Result<()>;

    /// Enqueue a non-blocking host-to-device copy of `data` to offset 0.
    fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Enqueue a single invocation of `stage`.
    fn enqueue_stage(&self, stage: StageHandle, wait: &[EventHandle]) -> Result<EventHandle>;

    /// Enqueue a non-blocking copy of the whole buffer back to the host.
    fn enqueue_read(&self, buffer: BufferHandle, wait: &[EventHandle]) -> Result<EventHandle>;

    /// Block until every submitted operation has completed.
    async fn drain(&self) -> Result<()>;

    /// Start and end of a completed operation.
    fn timestamps(&self, event: EventHandle) -> Result<OpTimestamps>;

    /// Host copy produced by the most recent completed read of `buffer`.
    fn read_back(&self, buffer: BufferHandle) -> Result<Vec<u8>>;

    /// Free a buffer and any host copy held for it. The handle is invalid
    /// afterwards.
    fn release(&self, buffer: BufferHandle) -> Result<()>;
}
