//! VRE executable locator.
//!
//! Resolves the engine binary from, in order: the `VRE_EXECUTABLE`
//! override, a CMake configure preset, a scan of the build root, and
//! finally the relative paths used by older build layouts. The first
//! source that yields an existing file wins.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{
    AppConfig, EnvSnapshot, FallbackPolicy, EXECUTABLE_OVERRIDE_VAR, PRESET_VARS,
};
use crate::types::{ExecutableLocation, LocationSource, Result, RunnerError};

/// Token in `binaryDir` that CMake expands to the source tree.
const SOURCE_DIR_TOKEN: &str = "${sourceDir}";

/// Wrapper script used when `VRE_EXAMPLES_USE_PYTHON=1`.
const PYTHON_WRAPPER: &str = "vre_wrapper.py";

// ---------------------------------------------------------------------------
// Legacy layouts
// ---------------------------------------------------------------------------

/// Relative directories holding the binary in pre-preset POSIX builds.
const POSIX_LADDER: &[&str] = &[
    "../../App/build",
    "../../../App/build",
    "../../build/App",
    "../../../build/App",
    "../../../../build/App",
    "../../App",
    "../../../App",
    "../../../build/vre/App",
    "../../../../build/vre/App",
];

const WINDOWS_X64_LADDER: &[&str] = &[
    r"..\..\App\bin\x64\Release",
    r"..\..\..\App\bin\x64\Release",
    r"..\..\build\App",
    r"..\..\..\build\App",
    r"..\..\..\build\vre\App",
    r"..\..\..\..\build\vre\App",
    r"..\..\..\build\vre\App\RelWithDebInfo",
    r"..\..\..\..\build\vre\App\RelWithDebInfo",
    r"..\..\build\App\Release",
    r"..\..\..\build\App\Release",
];

const WINDOWS_X86_LADDER: &[&str] = &[
    r"..\..\App\bin\Win32\Release",
    r"..\..\..\App\bin\Win32\Release",
    r"..\..\build\App",
    r"..\..\..\build\App",
];

/// Legacy directory ladder for an OS family and CPU architecture.
pub fn legacy_ladder(os: &str, arch: &str) -> &'static [&'static str] {
    match os {
        "windows" if arch.ends_with("64") => WINDOWS_X64_LADDER,
        "windows" => WINDOWS_X86_LADDER,
        _ => POSIX_LADDER,
    }
}

// ---------------------------------------------------------------------------
// Presets manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PresetManifest {
    #[serde(default, rename = "configurePresets")]
    configure_presets: Vec<ConfigurePreset>,
}

#[derive(Debug, Deserialize)]
struct ConfigurePreset {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "binaryDir")]
    binary_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

pub struct ExecutableLocator {
    override_path: Option<PathBuf>,
    preset: Option<String>,
    repo_root: PathBuf,
    presets_path: PathBuf,
    build_root: PathBuf,
    binary_name: String,
    /// Base for the legacy relative paths (the example's directory).
    working_dir: PathBuf,
    ladder: &'static [&'static str],
    policy: FallbackPolicy,
}

impl ExecutableLocator {
    pub fn from_config(config: &AppConfig, env: &EnvSnapshot, working_dir: &Path) -> Self {
        Self {
            override_path: env.get(EXECUTABLE_OVERRIDE_VAR).map(PathBuf::from),
            preset: env.first_of(&PRESET_VARS).map(str::to_string),
            repo_root: config.engine.repo_root.clone(),
            presets_path: config.engine.presets_path(),
            build_root: config.engine.build_root(),
            binary_name: config.engine.binary_name(),
            working_dir: working_dir.to_path_buf(),
            ladder: legacy_ladder(std::env::consts::OS, std::env::consts::ARCH),
            policy: config.policy.fallback,
        }
    }

    /// Replace the legacy ladder (used when targeting another layout).
    pub fn with_ladder(mut self, ladder: &'static [&'static str]) -> Self {
        self.ladder = ladder;
        self
    }

    /// Resolve the executable or fail with `ExecutableNotFound`.
    pub fn locate(&self) -> Result<ExecutableLocation> {
        let mut searched = Vec::new();

        if let Some(path) = &self.override_path {
            if path.is_file() {
                return Ok(self.found(path.clone(), LocationSource::ExplicitOverride));
            }
            warn!(
                path = %path.display(),
                "{EXECUTABLE_OVERRIDE_VAR} does not name an existing file"
            );
            searched.push(path.clone());
            return Err(RunnerError::ExecutableNotFound { searched });
        }

        if let Some(path) = self.preset_candidate(&mut searched)? {
            return Ok(self.found(path, LocationSource::Preset));
        }

        if let Some(path) = self.scan_candidate(&mut searched)? {
            return Ok(self.found(path, LocationSource::BuildScan));
        }

        for dir in self.ladder {
            let candidate = self.working_dir.join(dir).join(&self.binary_name);
            if candidate.is_file() {
                return Ok(self.found(candidate, LocationSource::LegacyHeuristic));
            }
            searched.push(candidate);
        }

        warn!(candidates = searched.len(), "VRE executable not found");
        Err(RunnerError::ExecutableNotFound { searched })
    }

    fn found(&self, path: PathBuf, source: LocationSource) -> ExecutableLocation {
        info!(path = %path.display(), source = %source, "Using VRE executable");
        ExecutableLocation::new(path, source)
    }

    fn preset_candidate(&self, searched: &mut Vec<PathBuf>) -> Result<Option<PathBuf>> {
        let Some(preset) = self.preset.as_deref() else {
            return Ok(None);
        };
        if !self.presets_path.is_file() {
            debug!(path = %self.presets_path.display(), "No presets manifest");
            return Ok(None);
        }

        let manifest = match fs::read_to_string(&self.presets_path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str::<PresetManifest>(&s).map_err(|e| e.to_string()))
        {
            Ok(m) => m,
            Err(message) => {
                self.policy.absorb(RunnerError::PresetManifest {
                    path: self.presets_path.clone(),
                    message,
                })?;
                return Ok(None);
            }
        };

        let binary_dir = manifest
            .configure_presets
            .iter()
            .find(|p| p.name.as_deref() == Some(preset))
            .and_then(|p| p.binary_dir.as_deref());
        let Some(binary_dir) = binary_dir else {
            debug!(preset, "Preset not found or has no binaryDir");
            return Ok(None);
        };

        let expanded = binary_dir.replace(SOURCE_DIR_TOKEN, &self.repo_root.to_string_lossy());
        let candidate = self
            .repo_root
            .join(expanded)
            .join("App")
            .join(&self.binary_name);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        debug!(preset, candidate = %candidate.display(), "Preset binary missing");
        searched.push(candidate);
        Ok(None)
    }

    fn scan_candidate(&self, searched: &mut Vec<PathBuf>) -> Result<Option<PathBuf>> {
        if !self.build_root.is_dir() {
            return Ok(None);
        }
        let entries = match fs::read_dir(&self.build_root) {
            Ok(entries) => entries,
            Err(source) => {
                self.policy.absorb(RunnerError::BuildScan {
                    path: self.build_root.clone(),
                    source,
                })?;
                return Ok(None);
            }
        };

        let mut subdirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        subdirs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        for dir in subdirs {
            let candidate = dir.join("App").join(&self.binary_name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
            searched.push(candidate);
        }
        Ok(None)
    }
}

/// Find `vre_wrapper.py` one or two levels above the example directory.
pub fn locate_python_wrapper(working_dir: &Path) -> Result<PathBuf> {
    let candidates = [
        working_dir.join("..").join(PYTHON_WRAPPER),
        working_dir.join("..").join("..").join(PYTHON_WRAPPER),
    ];
    match candidates.iter().find(|c| c.is_file()) {
        Some(script) => {
            info!(script = %script.display(), "Using Python wrapper");
            Ok(script.clone())
        }
        None => Err(RunnerError::WrapperNotFound {
            searched: candidates.to_vec(),
        }),
    }
}
