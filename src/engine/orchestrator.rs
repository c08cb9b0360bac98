//! Run orchestration: resolve → detect → patch → launch → restore.
//!
//! Every patched file is owned by a [`PatchSet`] local to the run future,
//! so restore happens on normal return, on error, on panic and when the
//! future is dropped mid-run.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::environment::LaunchEnvironment;
use super::launcher::{EngineLauncher, ProcessLauncher};
use super::locator::{locate_python_wrapper, ExecutableLocator};
use crate::config::{AppConfig, EnvSnapshot, USE_PYTHON_VAR};
use crate::device::command::TokioCommandRunner;
use crate::device::DeviceDetector;
use crate::patch::{device_patches, ConfigPatcher, PatchSet};
use crate::types::{
    ComputeDevice, EngineCommand, ExecutableLocation, Result, RunOutcome, RunRequest, RunResult,
    RunnerError,
};

/// Resolved engine command plus the environment it needs.
pub type ResolvedCommand = (EngineCommand, Option<LaunchEnvironment>);

pub struct RunOrchestrator {
    config: AppConfig,
    env: EnvSnapshot,
    /// Directory the legacy ladder and wrapper lookup are relative to.
    working_dir: PathBuf,
    detector: DeviceDetector,
    launcher: Box<dyn EngineLauncher>,
    patcher: ConfigPatcher,
    resolved: Option<ResolvedCommand>,
}

impl RunOrchestrator {
    pub fn new(config: AppConfig, env: EnvSnapshot, working_dir: impl Into<PathBuf>) -> Self {
        let detector = DeviceDetector::for_host(&config, &env, Arc::new(TokioCommandRunner));
        let patcher = ConfigPatcher::new(&config.patch);
        Self {
            config,
            env,
            working_dir: working_dir.into(),
            detector,
            launcher: Box::new(ProcessLauncher),
            patcher,
            resolved: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Box<dyn EngineLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_detector(mut self, detector: DeviceDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Locate the native executable.
    pub fn locate(&self) -> Result<ExecutableLocation> {
        ExecutableLocator::from_config(&self.config, &self.env, &self.working_dir).locate()
    }

    /// Detect the compute device (re-probes on every call).
    pub async fn detect(&self) -> Result<ComputeDevice> {
        self.detector.detect().await
    }

    /// Engine command for this host, resolved once and cached.
    pub fn resolve_command(&mut self) -> Result<ResolvedCommand> {
        if let Some(resolved) = &self.resolved {
            return Ok(resolved.clone());
        }

        let resolved = if self.env.flag(USE_PYTHON_VAR) {
            let script = locate_python_wrapper(&self.working_dir)?;
            let command = EngineCommand::PythonWrapper {
                interpreter: self.config.engine.python.clone(),
                script,
            };
            (command, None)
        } else {
            let location = self.locate()?;
            let environment = LaunchEnvironment::prepare(
                &location,
                &self.config.engine.library_path_var(),
                &self.env,
            );
            (EngineCommand::Native(location), Some(environment))
        };

        self.resolved = Some(resolved.clone());
        Ok(resolved)
    }

    /// Run the engine once for `request`.
    ///
    /// A detection failure with acceleration requested is not an error: the
    /// run is skipped and nothing is modified. A non-zero engine exit code
    /// becomes `RunFailure` after every patched file has been restored.
    pub async fn run(&mut self, request: &RunRequest) -> Result<RunOutcome> {
        let (command, environment) = self.resolve_command()?;

        // ---- Device phase
        let device = if request.use_accelerator {
            match self.detector.detect().await {
                Ok(device) => Some(device),
                Err(e) => {
                    warn!(
                        config = %request.primary_config.display(),
                        error = %e,
                        "No compute device available, skipping accelerated run"
                    );
                    return Ok(RunOutcome::Skipped {
                        reason: e.to_string(),
                    });
                }
            }
        } else {
            None
        };

        // ---- Patch phase
        let mut patches = PatchSet::new();
        if let Some(device) = &device {
            let edits = device_patches(device, &self.config.patch);
            for path in request.config_set() {
                if !path.is_file() {
                    debug!(file = %path.display(), "Config file absent, not patching");
                    continue;
                }
                patches.push(self.patcher.patch(path, &edits)?);
            }
        }

        // ---- Invoke
        let started_at = Utc::now();
        let timer = Instant::now();
        let exit_code = if request.dry_run {
            info!(
                program = %command.program().display(),
                config = %request.primary_config.display(),
                patched = ?patches.paths().collect::<Vec<_>>(),
                "Dry run, engine not started"
            );
            0
        } else {
            self.launcher
                .launch(&command, &request.primary_config, environment.as_ref())
                .await?
        };
        let elapsed_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);

        // ---- Finalize
        let failed = patches.restore_all();
        if failed > 0 {
            warn!(failed, "Some configuration files could not be restored");
        }

        if exit_code != 0 {
            error!(
                config = %request.primary_config.display(),
                exit_code,
                elapsed_ms,
                "VRE run failed"
            );
            return Err(RunnerError::RunFailure { code: exit_code });
        }

        info!(
            config = %request.primary_config.display(),
            device = device.as_ref().map(ComputeDevice::tag).unwrap_or("none"),
            elapsed_ms,
            "VRE run completed"
        );
        Ok(RunOutcome::Completed(RunResult {
            exit_code,
            device_used: device,
            invoked: !request.dry_run,
            started_at,
            elapsed_ms,
        }))
    }
}
