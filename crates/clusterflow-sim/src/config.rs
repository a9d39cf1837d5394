//! Simulator configuration.

use clusterflow_core::backend::{DeviceId, DeviceInfo, PlatformInfo};
use clusterflow_core::config::DeviceClass;

/// Fault injected into the simulated channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Reject the enqueue with this 0-based index.
    RejectSubmission(usize),
    /// Fail every execution of the named stage.
    FailStage(String),
}

/// Settings of a [`SimBackend`](crate::SimBackend).
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Platforms and devices reported by discovery.
    pub platforms: Vec<PlatformInfo>,
    /// Modeled transfer bandwidth in bytes per microsecond.
    pub transfer_bytes_per_us: u64,
    /// Injected faults.
    pub faults: Vec<SimFault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            platforms: default_catalog(),
            // About 8 GB/s.
            transfer_bytes_per_us: 8_000,
            faults: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the device catalog.
    #[must_use]
    pub fn with_platforms(mut self, platforms: Vec<PlatformInfo>) -> Self {
        self.platforms = platforms;
        self
    }

    /// Sets the transfer bandwidth. Zero makes transfers instantaneous.
    #[must_use]
    pub fn with_bandwidth(mut self, bytes_per_us: u64) -> Self {
        self.transfer_bytes_per_us = bytes_per_us;
        self
    }

    /// Adds a fault.
    #[must_use]
    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }

    pub(crate) fn rejects_submission(&self, index: usize) -> bool {
        self.faults
            .iter()
            .any(|f| matches!(f, SimFault::RejectSubmission(n) if *n == index))
    }

    pub(crate) fn fails_stage(&self, name: &str) -> bool {
        self.faults
            .iter()
            .any(|f| matches!(f, SimFault::FailStage(s) if s == name))
    }
}

/// One Xilinx platform with a host CPU device and an accelerator card, plus
/// a CPU-only platform that never matches the default filter.
pub fn default_catalog() -> Vec<PlatformInfo> {
    vec![
        PlatformInfo {
            name: "clusterflow host".to_string(),
            devices: vec![DeviceInfo {
                id: DeviceId(0),
                name: "host_cpu".to_string(),
                class: DeviceClass::Cpu,
            }],
        },
        PlatformInfo {
            name: "Xilinx (simulated)".to_string(),
            devices: vec![DeviceInfo {
                id: DeviceId(1),
                name: "xilinx_sim_accel_0".to_string(),
                class: DeviceClass::Accelerator,
            }],
        },
    ]
}
