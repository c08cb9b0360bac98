//! Child-process environment for the native engine.
//!
//! The VRE shared libraries sit next to the executable or one level above
//! the `App` directory, so both are prepended to whatever the inherited
//! library search variable already holds.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::EnvSnapshot;
use crate::types::{ExecutableLocation, Result, RunnerError};

/// Library search path to hand to the engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnvironment {
    pub var: String,
    pub search_paths: Vec<PathBuf>,
}

impl LaunchEnvironment {
    /// Executable dir, its parent, then the inherited entries; first-seen
    /// order, duplicates and empty entries dropped.
    pub fn prepare(location: &ExecutableLocation, var: &str, env: &EnvSnapshot) -> Self {
        let exe = std::path::absolute(location.path()).unwrap_or_else(|_| location.path().to_path_buf());
        let exe_dir = exe.parent().map(Path::to_path_buf);
        let library_root = exe_dir.as_deref().and_then(Path::parent).map(Path::to_path_buf);

        let inherited = env
            .get(var)
            .map(|v| std::env::split_paths(v).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut search_paths: Vec<PathBuf> = Vec::new();
        for p in exe_dir.into_iter().chain(library_root).chain(inherited) {
            if p.as_os_str().is_empty() || search_paths.contains(&p) {
                continue;
            }
            search_paths.push(p);
        }

        let prepared = Self {
            var: var.to_string(),
            search_paths,
        };
        info!(var, value = %prepared.joined_lossy(), "Prepared library search path");
        prepared
    }

    /// Serialized value for the variable.
    pub fn joined(&self) -> Result<OsString> {
        std::env::join_paths(&self.search_paths)
            .map_err(|e| RunnerError::LibraryPath(e.to_string()))
    }

    fn joined_lossy(&self) -> String {
        self.joined()
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Set the variable on the child command. Nothing else is touched.
    pub fn apply(&self, cmd: &mut tokio::process::Command) -> Result<()> {
        cmd.env(&self.var, self.joined()?);
        Ok(())
    }
}
