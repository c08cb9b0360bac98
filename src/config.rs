//! Configuration loading from TOML plus a captured view of the process
//! environment.
//!
//! Reads `vre-runner.toml` (every section optional) and deserializes into
//! strongly-typed structs. Environment variables are captured once into an
//! [`EnvSnapshot`] so the rest of the crate never reads process-global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::RunnerError;

/// Names the engine executable explicitly.
pub const EXECUTABLE_OVERRIDE_VAR: &str = "VRE_EXECUTABLE";
/// Accepted preset-name variables, highest priority first.
pub const PRESET_VARS: [&str; 3] = ["VRE_CMAKE_PRESET", "CMAKE_BUILD_PRESET", "CMAKE_PRESET"];
/// Bypasses device probing with a verbatim tag.
pub const DEVICE_OVERRIDE_VAR: &str = "EXTERNAL_COMPUTE_DEVICE";
/// `1` routes runs through `vre_wrapper.py` instead of the native binary.
pub const USE_PYTHON_VAR: &str = "VRE_EXAMPLES_USE_PYTHON";

// ---------------------------------------------------------------------------
// File configuration
// ---------------------------------------------------------------------------

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub device: DeviceConfig,
    pub patch: PatchConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Source tree root: holds `CMakePresets.json` and the `build` directory.
    pub repo_root: PathBuf,
    /// Defaults to `vre.exe` on Windows, `vre` elsewhere.
    pub binary_name: Option<String>,
    pub build_dir: PathBuf,
    pub presets_file: PathBuf,
    /// Defaults to the platform's native-library search variable.
    pub library_path_var: Option<String>,
    /// Interpreter used for `vre_wrapper.py` runs.
    pub python: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            binary_name: None,
            build_dir: PathBuf::from("build"),
            presets_file: PathBuf::from("CMakePresets.json"),
            library_path_var: None,
            python: PathBuf::from(if cfg!(windows) { "python" } else { "python3" }),
        }
    }
}

impl EngineConfig {
    pub fn binary_name(&self) -> String {
        match &self.binary_name {
            Some(name) => name.clone(),
            None if cfg!(windows) => "vre.exe".to_string(),
            None => "vre".to_string(),
        }
    }

    pub fn library_path_var(&self) -> String {
        match &self.library_path_var {
            Some(var) => var.clone(),
            None => default_library_path_var(std::env::consts::OS).to_string(),
        }
    }

    pub fn build_root(&self) -> PathBuf {
        self.repo_root.join(&self.build_dir)
    }

    pub fn presets_path(&self) -> PathBuf {
        self.repo_root.join(&self.presets_file)
    }
}

/// Native-library search variable for an OS family.
pub fn default_library_path_var(os: &str) -> &'static str {
    match os {
        "macos" | "ios" => "DYLD_LIBRARY_PATH",
        "windows" => "PATH",
        _ => "LD_LIBRARY_PATH",
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub nvidia_timeout_secs: u64,
    pub harness_timeout_secs: u64,
    /// Self-test binary that reports compute-environment devices.
    pub harness_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            nvidia_timeout_secs: 2,
            harness_timeout_secs: 20,
            harness_name: "qle-core".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PatchConfig {
    /// Parameters that receive the device tag.
    pub device_names: Vec<String>,
    /// Boolean parameters forced on whenever a device tag is patched in.
    pub enable_names: Vec<String>,
    pub enable_value: String,
    pub backup_suffix: String,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            device_names: vec![
                "ExternalComputeDevice".to_string(),
                "xvaCgExternalComputeDevice".to_string(),
            ],
            enable_names: vec![
                "UseExternalComputeDevice".to_string(),
                "xvaCgUseExternalComputeDevice".to_string(),
            ],
            enable_value: "true".to_string(),
            backup_suffix: ".bak_gpu_patch".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PolicyConfig {
    pub fallback: FallbackPolicy,
}

/// What to do when an intermediate lookup or probe step fails but a later
/// step could still succeed.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Log a warning and move on to the next step.
    #[default]
    Warn,
    /// Surface the failure as a typed error.
    Strict,
}

impl FallbackPolicy {
    /// Either swallow `err` with a warning or hand it back to the caller.
    pub fn absorb(self, err: RunnerError) -> crate::types::Result<()> {
        match self {
            FallbackPolicy::Warn => {
                warn!(error = %err, "Falling back to next lookup step");
                Ok(())
            }
            FallbackPolicy::Strict => Err(err),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Like [`AppConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

// ---------------------------------------------------------------------------
// Environment snapshot
// ---------------------------------------------------------------------------

/// Environment variables captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment. Non-UTF-8 entries are skipped.
    pub fn capture() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Value of `key`; empty values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// First set variable among `keys`.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }
}
