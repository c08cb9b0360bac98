//! NVIDIA detection via `nvidia-smi`.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::command::CommandRunner;
use super::DeviceProbe;
use crate::types::{ComputeDevice, Result, RunnerError};

const NVIDIA_SMI: &str = "nvidia-smi";

pub struct NvidiaProbe {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl NvidiaProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

#[async_trait]
impl DeviceProbe for NvidiaProbe {
    async fn probe(&self) -> Result<ComputeDevice> {
        let args = vec![
            "--query-gpu=name".to_string(),
            "--format=csv,noheader".to_string(),
        ];
        let output = self
            .runner
            .run(Path::new(NVIDIA_SMI), &args, self.timeout)
            .await
            .map_err(|e| {
                RunnerError::DeviceNotDetected(format!(
                    "No NVIDIA GPU detected via nvidia-smi ({e}) and no override set"
                ))
            })?;

        if !output.success {
            return Err(RunnerError::DeviceNotDetected(format!(
                "nvidia-smi failed: {}",
                output.stderr.trim()
            )));
        }

        let name = output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| RunnerError::DeviceNotDetected("nvidia-smi reported no GPU".into()))?;
        debug!(gpu = name, "nvidia-smi reported GPU");
        Ok(ComputeDevice::from_parts("CUDA", "NVIDIA", name))
    }

    fn platform(&self) -> &str {
        "linux"
    }
}
