//! Apple GPU detection.
//!
//! First asks the `qle-core` self-test harness which compute-environment
//! devices it can initialise, preferring Metal over OpenCL. If the harness
//! is missing or reports nothing usable, the CPU brand string is matched
//! against known Apple silicon to synthesize a best-guess OpenCL tag.

use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

use super::command::CommandRunner;
use super::DeviceProbe;
use crate::config::FallbackPolicy;
use crate::types::{ComputeDevice, Result, RunnerError};

const HARNESS_ARGS: [&str; 5] = [
    "--run_test=@qle.computeenvironment.testEnvironmentInit",
    "-l",
    "message",
    "-r",
    "confirm",
];

const SYSCTL: &str = "sysctl";
const BRAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Device API prefixes in order of preference.
const PREFERRED_APIS: [&str; 2] = ["Metal/", "OpenCL/"];

/// Known Apple silicon as (chip, variant). Variants come before the bare
/// chip so "M3 Max" is not reported as "M3".
const KNOWN_APPLE_CHIPS: &[(&str, &str)] = &[
    ("M4", "Max"),
    ("M4", "Pro"),
    ("M4", ""),
    ("M3", "Ultra"),
    ("M3", "Max"),
    ("M3", "Pro"),
    ("M3", ""),
    ("M2", "Ultra"),
    ("M2", "Max"),
    ("M2", "Pro"),
    ("M2", ""),
    ("M1", "Ultra"),
    ("M1", "Max"),
    ("M1", "Pro"),
    ("M1", ""),
];

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid regex"))
}

fn device_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"device '([^']+)'").expect("valid regex"))
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Unique `device '<name>'` tokens from harness output, in order of
/// appearance, after removing terminal colour codes.
pub fn parse_harness_devices(output: &str) -> Vec<String> {
    let plain = ansi_escape().replace_all(output, "");
    let mut devices: Vec<String> = Vec::new();
    for caps in device_token().captures_iter(&plain) {
        let name = caps[1].to_string();
        if !devices.contains(&name) {
            devices.push(name);
        }
    }
    devices
}

/// First Metal device, else first OpenCL device. Tokens that are not
/// `<API>/<Vendor>/<Model>` are skipped.
pub fn preferred_device(devices: &[String]) -> Option<ComputeDevice> {
    let usable: Vec<ComputeDevice> = devices
        .iter()
        .map(|d| ComputeDevice::new(d.clone()))
        .filter(|d| {
            let ok = d.is_well_formed();
            if !ok {
                debug!(token = d.tag(), "Ignoring malformed device token");
            }
            ok
        })
        .collect();
    PREFERRED_APIS
        .iter()
        .find_map(|prefix| usable.iter().find(|d| d.tag().starts_with(prefix)).cloned())
}

/// Best-guess tag from `machdep.cpu.brand_string`.
pub fn match_known_chip(brand: &str) -> Option<ComputeDevice> {
    let tokens: Vec<&str> = brand.split_whitespace().collect();
    KNOWN_APPLE_CHIPS
        .iter()
        .find(|(chip, variant)| {
            tokens.contains(chip) && (variant.is_empty() || tokens.contains(variant))
        })
        .map(|(chip, variant)| {
            let model = format!("Apple {chip} {variant}");
            ComputeDevice::from_parts("OpenCL", "Apple", &model)
        })
}

/// Find the self-test harness: any `QuantExt/test/<name>[.exe]` under the
/// build root (sorted for determinism), then the in-source locations.
pub fn locate_harness(
    repo_root: &Path,
    build_root: &Path,
    name: &str,
) -> Option<PathBuf> {
    let file_names = [name.to_string(), format!("{name}.exe")];

    let mut found = Vec::new();
    if build_root.is_dir() {
        collect_harnesses(build_root, &file_names, &mut found);
    }
    found.sort();

    let legacy = [
        repo_root.join("QuantExt").join("test").join(name),
        repo_root.join("QuantExt").join("test").join(&file_names[1]),
        repo_root.join("..").join("QuantExt").join("test").join(name),
    ];
    let harness = found
        .into_iter()
        .chain(legacy)
        .find(|c| c.is_file())
        .map(|c| std::path::absolute(&c).unwrap_or(c));

    match &harness {
        Some(path) => debug!(path = %path.display(), "Found self-test harness"),
        None => debug!(build_root = %build_root.display(), "No self-test harness available"),
    }
    harness
}

fn collect_harnesses(dir: &Path, file_names: &[String], found: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(kind) = entry.file_type() else {
            continue;
        };
        if kind.is_dir() {
            collect_harnesses(&path, file_names, found);
        } else if is_harness_path(&path, file_names) {
            found.push(path);
        }
    }
}

fn is_harness_path(path: &Path, file_names: &[String]) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| file_names.iter().any(|f| f == n));
    let mut parents = path.ancestors().skip(1).filter_map(|p| p.file_name());
    name_ok
        && parents.next().is_some_and(|p| p == "test")
        && parents.next().is_some_and(|p| p == "QuantExt")
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

pub struct AppleProbe {
    runner: Arc<dyn CommandRunner>,
    repo_root: PathBuf,
    build_root: PathBuf,
    harness_name: String,
    /// Located on first probe; the build tree walk is not free.
    harness: OnceLock<Option<PathBuf>>,
    harness_timeout: Duration,
    policy: FallbackPolicy,
}

impl AppleProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        repo_root: impl Into<PathBuf>,
        build_root: impl Into<PathBuf>,
        harness_name: impl Into<String>,
        harness_timeout: Duration,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            runner,
            repo_root: repo_root.into(),
            build_root: build_root.into(),
            harness_name: harness_name.into(),
            harness: OnceLock::new(),
            harness_timeout,
            policy,
        }
    }

    /// Use `harness` instead of searching for it.
    pub fn with_harness(mut self, harness: Option<PathBuf>) -> Self {
        self.harness = OnceLock::from(harness);
        self
    }

    fn harness(&self) -> Option<&Path> {
        self.harness
            .get_or_init(|| locate_harness(&self.repo_root, &self.build_root, &self.harness_name))
            .as_deref()
    }

    async fn harness_device(&self) -> Result<Option<ComputeDevice>> {
        let Some(harness) = self.harness() else {
            return Ok(None);
        };
        let args: Vec<String> = HARNESS_ARGS.iter().map(|a| a.to_string()).collect();
        match self.runner.run(harness, &args, self.harness_timeout).await {
            Ok(output) => {
                let devices = parse_harness_devices(&output.combined());
                debug!(?devices, "Self-test harness reported devices");
                Ok(preferred_device(&devices))
            }
            Err(e) => {
                self.policy.absorb(RunnerError::DeviceNotDetected(format!(
                    "self-test harness {} failed: {e}",
                    harness.display()
                )))?;
                Ok(None)
            }
        }
    }

    async fn brand_device(&self) -> Result<Option<ComputeDevice>> {
        let args = vec!["-n".to_string(), "machdep.cpu.brand_string".to_string()];
        match self.runner.run(Path::new(SYSCTL), &args, BRAND_TIMEOUT).await {
            Ok(output) if output.success => {
                let brand = output.stdout.trim();
                debug!(brand, "CPU brand string");
                Ok(match_known_chip(brand))
            }
            Ok(output) => {
                self.policy.absorb(RunnerError::DeviceNotDetected(format!(
                    "sysctl failed: {}",
                    output.stderr.trim()
                )))?;
                Ok(None)
            }
            Err(e) => {
                self.policy
                    .absorb(RunnerError::DeviceNotDetected(format!("sysctl failed: {e}")))?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl DeviceProbe for AppleProbe {
    async fn probe(&self) -> Result<ComputeDevice> {
        if let Some(device) = self.harness_device().await? {
            return Ok(device);
        }
        if let Some(device) = self.brand_device().await? {
            info!(device = %device, "Guessed device from CPU brand string");
            return Ok(device);
        }
        Err(RunnerError::DeviceNotDetected(
            "No Apple GPU detected and no EXTERNAL_COMPUTE_DEVICE override set".into(),
        ))
    }

    fn platform(&self) -> &str {
        "macos"
    }
}
