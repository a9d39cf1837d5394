//! OpenCL backend for clusterflow
//!
//! Drives real accelerator cards (Xilinx/AMD Versal and Alveo through XRT)
//! via `opencl3`. The command queue is created with profiling and
//! out-of-order execution enabled, so every dependency must be passed as a
//! wait-list.
//!
//! # Requirements
//!
//! - An OpenCL ICD loader and a vendor runtime (XRT for Xilinx devices)
//! - Build with the `opencl` feature
//!
//! Without the feature the crate still exports [`OpenClBackend`], whose
//! constructor fails with `BackendUnavailable`.

#![warn(missing_docs)]

#[cfg(feature = "opencl")]
mod device;

#[cfg(feature = "opencl")]
pub use device::OpenClBackend;

#[cfg(not(feature = "opencl"))]
mod stub {
    use clusterflow_core::backend::BackendKind;

    clusterflow_core::unavailable_backend!(OpenClBackend, BackendKind::OpenCl, "opencl");
}

#[cfg(not(feature = "opencl"))]
pub use stub::OpenClBackend;

/// Whether the OpenCL backend was compiled in.
pub const fn is_opencl_enabled() -> bool {
    cfg!(feature = "opencl")
}

#[cfg(all(test, not(feature = "opencl")))]
mod tests {
    use super::*;
    use clusterflow_core::backend::{AccessMode, BackendKind, ComputeBackend};
    use clusterflow_core::error::ClusterFlowError;

    #[test]
    fn test_stub_reports_unavailable() {
        assert!(!is_opencl_enabled());
        let err = OpenClBackend::new().unwrap_err();
        assert!(matches!(err, ClusterFlowError::BackendUnavailable(msg) if msg.contains("opencl")));
    }

    #[tokio::test]
    async fn test_stub_fails_device_calls() {
        let backend = OpenClBackend;
        assert_eq!(backend.kind(), BackendKind::OpenCl);
        assert!(backend.platforms().is_err());
        assert!(backend.allocate(8, AccessMode::ReadOnly).is_err());
        assert!(backend.drain().await.is_ok());
    }
}
