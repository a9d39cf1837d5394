//! Macro for generating unavailable backend stubs.
//!
//! When a device backend feature (e.g. `opencl`) is disabled, its crate
//! still exposes a backend type so callers compile unchanged. The stub
//! implements `ComputeBackend` and fails every call with
//! `BackendUnavailable`.

/// Generate a stub backend for a disabled feature.
///
/// # Example
///
/// ```ignore
/// clusterflow_core::unavailable_backend!(OpenClBackend, BackendKind::OpenCl, "opencl");
/// ```
#[macro_export]
macro_rules! unavailable_backend {
    ($backend:ident, $kind:expr, $name:expr) => {
        /// Stub backend when the feature is disabled.
        #[derive(Debug)]
        pub struct $backend;

        impl $backend {
            /// Creation fails when the backend is not compiled in.
            pub fn new() -> $crate::error::Result<Self> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    concat!($name, " feature not enabled").to_string(),
                ))
            }
        }

        #[async_trait::async_trait]
        impl $crate::backend::ComputeBackend for $backend {
            fn kind(&self) -> $crate::backend::BackendKind {
                $kind
            }

            fn platforms(&self) -> $crate::error::Result<Vec<$crate::backend::PlatformInfo>> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn load_program(
                &self,
                _device: &$crate::backend::DeviceInfo,
                _image: &[u8],
            ) -> $crate::error::Result<()> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn allocate(
                &self,
                _size_bytes: usize,
                _access: $crate::backend::AccessMode,
            ) -> $crate::error::Result<$crate::backend::BufferHandle> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn create_stage(
                &self,
                _name: &str,
            ) -> $crate::error::Result<$crate::backend::StageHandle> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn bind_buffer(
                &self,
                _stage: $crate::backend::StageHandle,
                _slot: u32,
                _buffer: $crate::backend::BufferHandle,
            ) -> $crate::error::Result<()> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn bind_scalar(
                &self,
                _stage: $crate::backend::StageHandle,
                _slot: u32,
                _value: u64,
            ) -> $crate::error::Result<()> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn enqueue_write(
                &self,
                _buffer: $crate::backend::BufferHandle,
                _data: &[u8],
                _wait: &[$crate::backend::EventHandle],
            ) -> $crate::error::Result<$crate::backend::EventHandle> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn enqueue_stage(
                &self,
                _stage: $crate::backend::StageHandle,
                _wait: &[$crate::backend::EventHandle],
            ) -> $crate::error::Result<$crate::backend::EventHandle> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn enqueue_read(
                &self,
                _buffer: $crate::backend::BufferHandle,
                _wait: &[$crate::backend::EventHandle],
            ) -> $crate::error::Result<$crate::backend::EventHandle> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            async fn drain(&self) -> $crate::error::Result<()> {
                Ok(())
            }

            fn timestamps(
                &self,
                _event: $crate::backend::EventHandle,
            ) -> $crate::error::Result<$crate::backend::OpTimestamps> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn read_back(
                &self,
                _buffer: $crate::backend::BufferHandle,
            ) -> $crate::error::Result<Vec<u8>> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }

            fn release(
                &self,
                _buffer: $crate::backend::BufferHandle,
            ) -> $crate::error::Result<()> {
                Err($crate::error::ClusterFlowError::BackendUnavailable(
                    $name.to_string(),
                ))
            }
        }
    };
}
