//! Device session: one device, one channel, one loaded program.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::{
    AccessMode, BufferHandle, ComputeBackend, DeviceInfo, EventHandle, OpTimestamps, PlatformInfo,
    StageHandle,
};
use crate::config::{DeviceClass, PipelineConfig};
use crate::error::{ClusterFlowError, Result};

/// Process-lifetime handle on one accelerator.
///
/// Shared read-only by every lane once opened. The backend's channel
/// orders access to device state, so the session needs no locking of
/// its own.
pub struct DeviceSession {
    backend: Arc<dyn ComputeBackend>,
    platform: String,
    device: DeviceInfo,
    image: String,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("backend", &self.backend.kind())
            .field("platform", &self.platform)
            .field("device", &self.device)
            .field("image", &self.image)
            .finish()
    }
}

impl DeviceSession {
    /// Read an image file and open a session with it.
    ///
    /// A missing or unreadable image fails before the backend is touched.
    pub fn open_path(
        backend: Arc<dyn ComputeBackend>,
        config: &PipelineConfig,
        image_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let image_path = image_path.as_ref();
        let image = std::fs::read(image_path).map_err(|e| ClusterFlowError::ProgramLoadFailed {
            image: image_path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::open(backend, config, &image, image_path.display().to_string())
    }

    /// Select a device and load `image` onto it.
    pub fn open(
        backend: Arc<dyn ComputeBackend>,
        config: &PipelineConfig,
        image: &[u8],
        label: impl Into<String>,
    ) -> Result<Self> {
        let label = label.into();
        let platforms = backend.platforms()?;
        let (platform, device) =
            select_device(&platforms, &config.platform_filter, config.device_class)?;

        info!(
            backend = %backend.kind(),
            platform = %platform,
            device = %device.name,
            "Found device"
        );

        backend
            .load_program(&device, image)
            .map_err(|e| ClusterFlowError::ProgramLoadFailed {
                image: label.clone(),
                reason: e.to_string(),
            })?;

        info!(image = %label, bytes = image.len(), "Loaded accelerator image");

        Ok(Self {
            backend,
            platform,
            device,
            image: label,
        })
    }

    /// Selected device.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Name of the platform the device belongs to.
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Label of the loaded image.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Underlying backend.
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Allocate a device buffer.
    pub fn allocate(&self, size_bytes: usize, access: AccessMode) -> Result<BufferHandle> {
        let handle = self
            .backend
            .allocate(size_bytes, access)
            .map_err(|e| ClusterFlowError::AllocationFailed {
                size: size_bytes,
                reason: e.to_string(),
            })?;
        debug!(?handle, size_bytes, ?access, "Allocated buffer");
        Ok(handle)
    }

    /// Resolve a stage of the loaded program.
    pub fn resolve_stage(&self, name: &str) -> Result<StageHandle> {
        match self.backend.create_stage(name) {
            Ok(handle) => Ok(handle),
            Err(ClusterFlowError::StageNotFound(name)) => Err(ClusterFlowError::StageNotFound(name)),
            Err(e) => Err(ClusterFlowError::StageNotFound(format!("{}: {}", name, e))),
        }
    }

    /// Bind a buffer argument.
    pub fn bind_buffer(
        &self,
        stage: StageHandle,
        stage_name: &str,
        slot: u32,
        buffer: BufferHandle,
    ) -> Result<()> {
        self.backend
            .bind_buffer(stage, slot, buffer)
            .map_err(|e| ClusterFlowError::BindFailed {
                stage: stage_name.to_string(),
                slot,
                reason: e.to_string(),
            })
    }

    /// Bind a scalar argument.
    pub fn bind_scalar(
        &self,
        stage: StageHandle,
        stage_name: &str,
        slot: u32,
        value: u64,
    ) -> Result<()> {
        self.backend
            .bind_scalar(stage, slot, value)
            .map_err(|e| ClusterFlowError::BindFailed {
                stage: stage_name.to_string(),
                slot,
                reason: e.to_string(),
            })
    }

    /// Enqueue a host-to-device copy.
    pub fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        self.backend.enqueue_write(buffer, data, wait)
    }

    /// Enqueue a stage invocation.
    pub fn enqueue_stage(&self, stage: StageHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        self.backend.enqueue_stage(stage, wait)
    }

    /// Enqueue a device-to-host copy of a whole buffer.
    pub fn enqueue_read(&self, buffer: BufferHandle, wait: &[EventHandle]) -> Result<EventHandle> {
        self.backend.enqueue_read(buffer, wait)
    }

    /// Wait for every submitted operation, optionally bounded by `timeout`.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<()> {
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.backend.drain())
                .await
                .map_err(|_| {
                    ClusterFlowError::Completion(format!("drain timed out after {:?}", limit))
                })?,
            None => self.backend.drain().await,
        };
        result.map_err(|e| match e {
            ClusterFlowError::Completion(msg) => ClusterFlowError::Completion(msg),
            other => ClusterFlowError::Completion(other.to_string()),
        })
    }

    /// Timestamps of a completed operation.
    pub fn timestamps(&self, event: EventHandle) -> Result<OpTimestamps> {
        self.backend.timestamps(event)
    }

    /// Host copy of a buffer after its read completed.
    pub fn read_back(&self, buffer: BufferHandle) -> Result<Vec<u8>> {
        self.backend.read_back(buffer)
    }

    /// Free a device buffer.
    pub fn release(&self, buffer: BufferHandle) -> Result<()> {
        self.backend.release(buffer)?;
        debug!(?buffer, "Released buffer");
        Ok(())
    }
}

/// Pick the first device of class `class` on the first platform whose
/// name contains `platform_filter`.
///
/// Platforms that match by name but expose no device of the class are
/// skipped. There is no fallback to another class.
pub fn select_device(
    platforms: &[PlatformInfo],
    platform_filter: &str,
    class: DeviceClass,
) -> Result<(String, DeviceInfo)> {
    platforms
        .iter()
        .filter(|p| p.name.contains(platform_filter))
        .find_map(|p| {
            p.devices
                .iter()
                .find(|d| d.class == class)
                .map(|d| (p.name.clone(), d.clone()))
        })
        .ok_or_else(|| ClusterFlowError::DeviceNotFound {
            platform: platform_filter.to_string(),
            class: class.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceId;
    use crate::testing::{BackendCall, RecordingBackend};

    fn device(id: u64, name: &str, class: DeviceClass) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId(id),
            name: name.to_string(),
            class,
        }
    }

    fn catalog() -> Vec<PlatformInfo> {
        vec![
            PlatformInfo {
                name: "Portable Computing Language".to_string(),
                devices: vec![device(0, "pthread", DeviceClass::Cpu)],
            },
            PlatformInfo {
                name: "Xilinx".to_string(),
                devices: vec![
                    device(1, "host", DeviceClass::Cpu),
                    device(2, "vp1552_0", DeviceClass::Accelerator),
                    device(3, "vp1552_1", DeviceClass::Accelerator),
                ],
            },
        ]
    }

    #[test]
    fn test_select_first_matching_accelerator() {
        let (platform, dev) = select_device(&catalog(), "Xilinx", DeviceClass::Accelerator).unwrap();
        assert_eq!(platform, "Xilinx");
        assert_eq!(dev.name, "vp1552_0");
    }

    #[test]
    fn test_no_fallback_to_other_class() {
        let platforms = vec![PlatformInfo {
            name: "Xilinx".to_string(),
            devices: vec![device(0, "host", DeviceClass::Cpu)],
        }];
        let err = select_device(&platforms, "Xilinx", DeviceClass::Accelerator).unwrap_err();
        assert!(matches!(err, ClusterFlowError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_no_matching_platform() {
        let err = select_device(&catalog(), "Intel", DeviceClass::Accelerator).unwrap_err();
        assert!(matches!(err, ClusterFlowError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_open_path_missing_image_touches_nothing() {
        let backend = Arc::new(RecordingBackend::new());
        let err = DeviceSession::open_path(
            backend.clone(),
            &PipelineConfig::default(),
            "/nonexistent/clusterflow.xclbin",
        )
        .unwrap_err();
        assert!(matches!(err, ClusterFlowError::ProgramLoadFailed { .. }));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_open_loads_onto_selected_device() {
        let backend = Arc::new(RecordingBackend::new());
        let session =
            DeviceSession::open(backend.clone(), &PipelineConfig::default(), b"image", "mem").unwrap();
        assert_eq!(session.platform(), "Xilinx");
        assert_eq!(session.image(), "mem");
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Platforms,
                BackendCall::LoadProgram {
                    device: session.device().name.clone(),
                    bytes: 5,
                },
            ]
        );
    }

    #[test]
    fn test_rejected_image_is_program_load_failure() {
        let backend = Arc::new(RecordingBackend::new().reject_images());
        let err = DeviceSession::open(backend.clone(), &PipelineConfig::default(), b"junk", "bad")
            .unwrap_err();
        assert!(matches!(err, ClusterFlowError::ProgramLoadFailed { .. }));
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Allocate { .. })));
    }

    #[test]
    fn test_unknown_stage() {
        let backend = Arc::new(RecordingBackend::new());
        let session =
            DeviceSession::open(backend, &PipelineConfig::default(), b"image", "mem").unwrap();
        let err = session.resolve_stage("missing").unwrap_err();
        assert!(matches!(err, ClusterFlowError::StageNotFound(name) if name == "missing"));
    }
}
