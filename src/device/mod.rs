//! Compute device detection.
//!
//! Defines the `DeviceProbe` trait with one implementation per platform
//! family:
//! - Linux: NVIDIA GPUs via `nvidia-smi`
//! - macOS: Metal/OpenCL devices via the `qle-core` self-test harness,
//!   falling back to the CPU brand string
//! - anything else: unsupported
//!
//! The probe is chosen once from `std::env::consts::OS`. An
//! `EXTERNAL_COMPUTE_DEVICE` override short-circuits probing entirely.

pub mod command;
pub mod darwin;
pub mod linux;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{AppConfig, EnvSnapshot, DEVICE_OVERRIDE_VAR};
use crate::types::{ComputeDevice, Result, RunnerError};

use command::CommandRunner;
use darwin::AppleProbe;
use linux::NvidiaProbe;

/// Abstraction over per-platform accelerator discovery.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Probe the host; every call re-probes.
    async fn probe(&self) -> Result<ComputeDevice>;

    /// Platform family name for logging.
    fn platform(&self) -> &str;
}

/// Probe for hosts with no known accelerator path.
pub struct UnsupportedProbe {
    os: String,
}

impl UnsupportedProbe {
    pub fn new(os: impl Into<String>) -> Self {
        Self { os: os.into() }
    }
}

#[async_trait]
impl DeviceProbe for UnsupportedProbe {
    async fn probe(&self) -> Result<ComputeDevice> {
        Err(RunnerError::DeviceNotDetected(format!(
            "Unsupported platform for GPU detection: {}",
            self.os
        )))
    }

    fn platform(&self) -> &str {
        &self.os
    }
}

/// Pick the probe for an OS family (`std::env::consts::OS` values).
pub fn select_probe(
    os: &str,
    config: &AppConfig,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn DeviceProbe> {
    match os {
        "linux" => Box::new(NvidiaProbe::new(
            runner,
            Duration::from_secs(config.device.nvidia_timeout_secs),
        )),
        "macos" => Box::new(AppleProbe::new(
            runner,
            &config.engine.repo_root,
            config.engine.build_root(),
            &config.device.harness_name,
            Duration::from_secs(config.device.harness_timeout_secs),
            config.policy.fallback,
        )),
        other => Box::new(UnsupportedProbe::new(other)),
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Override-or-probe device detection.
pub struct DeviceDetector {
    override_tag: Option<String>,
    probe: Box<dyn DeviceProbe>,
}

impl DeviceDetector {
    pub fn new(override_tag: Option<String>, probe: Box<dyn DeviceProbe>) -> Self {
        Self {
            override_tag,
            probe,
        }
    }

    /// Detector for the current host.
    pub fn for_host(
        config: &AppConfig,
        env: &EnvSnapshot,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::new(
            env.get(DEVICE_OVERRIDE_VAR).map(str::to_string),
            select_probe(std::env::consts::OS, config, runner),
        )
    }

    pub async fn detect(&self) -> Result<ComputeDevice> {
        if let Some(tag) = &self.override_tag {
            info!(device = %tag, "Using {DEVICE_OVERRIDE_VAR} override");
            return Ok(ComputeDevice::new(tag.clone()));
        }
        let device = self.probe.probe().await?;
        info!(device = %device, platform = self.probe.platform(), "Detected compute device");
        Ok(device)
    }
}
