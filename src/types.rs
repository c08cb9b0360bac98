//! Core types used throughout VRE-RUNNER.
//!
//! Defines executable locations, compute device tags, parameter patches,
//! run requests/results, and the crate-wide error enum.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Executable location
// ---------------------------------------------------------------------------

/// Which signal produced the engine executable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    /// `VRE_EXECUTABLE` named the file directly.
    ExplicitOverride,
    /// A CMake configure preset pointed at the binary directory.
    Preset,
    /// Found by scanning the immediate subdirectories of the build root.
    BuildScan,
    /// One of the hard-coded relative paths from older build layouts.
    LegacyHeuristic,
}

impl fmt::Display for LocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationSource::ExplicitOverride => write!(f, "explicit override"),
            LocationSource::Preset => write!(f, "cmake preset"),
            LocationSource::BuildScan => write!(f, "build scan"),
            LocationSource::LegacyHeuristic => write!(f, "legacy heuristic"),
        }
    }
}

/// Resolved on-disk location of the VRE executable. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutableLocation {
    path: PathBuf,
    source: LocationSource,
}

impl ExecutableLocation {
    pub fn new(path: impl Into<PathBuf>, source: LocationSource) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> LocationSource {
        self.source
    }
}

/// How the engine is actually started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// The native `vre` binary.
    Native(ExecutableLocation),
    /// `<interpreter> <script> <config>`, used when the examples are
    /// driven through the Python wrapper instead of the native binary.
    PythonWrapper { interpreter: PathBuf, script: PathBuf },
}

impl EngineCommand {
    /// Program to spawn.
    pub fn program(&self) -> &Path {
        match self {
            EngineCommand::Native(location) => location.path(),
            EngineCommand::PythonWrapper { interpreter, .. } => interpreter,
        }
    }

    /// Arguments placed before the configuration path.
    pub fn leading_args(&self) -> Vec<&OsStr> {
        match self {
            EngineCommand::Native(_) => Vec::new(),
            EngineCommand::PythonWrapper { script, .. } => vec![script.as_os_str()],
        }
    }
}

// ---------------------------------------------------------------------------
// Compute device
// ---------------------------------------------------------------------------

/// Accelerator identifier in `<API>/<Vendor>/<Model>` form,
/// e.g. `CUDA/NVIDIA/A100` or `Metal/Apple/Apple M4 Max`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ComputeDevice {
    tag: String,
}

impl ComputeDevice {
    /// Wrap a tag verbatim. Used for overrides and harness-reported names.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn from_parts(api: &str, vendor: &str, model: &str) -> Self {
        Self {
            tag: format!("{api}/{vendor}/{}", model.trim()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn api(&self) -> Option<&str> {
        self.tag.splitn(3, '/').next().filter(|s| !s.is_empty())
    }

    pub fn vendor(&self) -> Option<&str> {
        self.tag.splitn(3, '/').nth(1).filter(|s| !s.is_empty())
    }

    pub fn model(&self) -> Option<&str> {
        self.tag.splitn(3, '/').nth(2).filter(|s| !s.is_empty())
    }

    /// True when the tag has an alphabetic API, an alphanumeric vendor
    /// (spaces allowed) and a non-empty model.
    pub fn is_well_formed(&self) -> bool {
        let api_ok = self
            .api()
            .is_some_and(|a| a.chars().all(|c| c.is_ascii_alphabetic()));
        let vendor_ok = self
            .vendor()
            .is_some_and(|v| v.chars().all(|c| c.is_ascii_alphanumeric() || c == ' '));
        api_ok && vendor_ok && self.model().is_some()
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

// ---------------------------------------------------------------------------
// Patching
// ---------------------------------------------------------------------------

/// "Set every `Parameter` whose name is in `names` to `value`; create the
/// entry under the parameter container when a name has no match."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterPatch {
    pub names: BTreeSet<String>,
    pub value: String,
}

impl ParameterPatch {
    pub fn new<I, S>(names: I, value: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            value: value.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run request / result
// ---------------------------------------------------------------------------

/// A single engine run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub primary_config: PathBuf,
    pub auxiliary_configs: Vec<PathBuf>,
    pub use_accelerator: bool,
    /// Go through locate/detect/patch/restore but do not start the engine.
    pub dry_run: bool,
}

impl RunRequest {
    pub fn new(primary_config: impl Into<PathBuf>) -> Self {
        Self {
            primary_config: primary_config.into(),
            ..Default::default()
        }
    }

    pub fn with_auxiliary(mut self, path: impl Into<PathBuf>) -> Self {
        self.auxiliary_configs.push(path.into());
        self
    }

    pub fn with_accelerator(mut self, enabled: bool) -> Self {
        self.use_accelerator = enabled;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Primary config followed by the auxiliaries, each path at most once.
    pub fn config_set(&self) -> Vec<&Path> {
        let mut out: Vec<&Path> = Vec::with_capacity(1 + self.auxiliary_configs.len());
        for path in std::iter::once(&self.primary_config).chain(&self.auxiliary_configs) {
            if path.as_os_str().is_empty() || out.contains(&path.as_path()) {
                continue;
            }
            out.push(path.as_path());
        }
        out
    }
}

/// Outcome of a completed engine run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub exit_code: i32,
    pub device_used: Option<ComputeDevice>,
    /// False for dry runs.
    pub invoked: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What `RunOrchestrator::run` produced when it did not fail.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunResult),
    /// Acceleration was requested but no device could be detected.
    Skipped { reason: String },
}

impl RunOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            RunOutcome::Completed(r) => Some(r),
            RunOutcome::Skipped { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for VRE-RUNNER.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("VRE executable not found ({} candidate paths checked)", searched.len())]
    ExecutableNotFound { searched: Vec<PathBuf> },

    #[error("vre_wrapper.py not found ({} candidate paths checked)", searched.len())]
    WrapperNotFound { searched: Vec<PathBuf> },

    #[error("No compute device detected: {0}")]
    DeviceNotDetected(String),

    #[error("Unusable presets manifest {}: {message}", path.display())]
    PresetManifest { path: PathBuf, message: String },

    #[error("Build directory scan failed ({}): {source}", path.display())]
    BuildScan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid library search path: {0}")]
    LibraryPath(String),

    #[error("Configuration file I/O error ({}): {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration {}: {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    #[error("Failed to launch {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine run failed with exit code {code}")]
    RunFailure { code: i32 },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
