//! Engine process launcher.
//!
//! Starts `<program> [leading args] <config>` and reports the exit code.
//! No timeout is applied; cancelling a long engine run is the caller's call.
//! Dropping the launch future kills the child.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

use super::environment::LaunchEnvironment;
use crate::types::{EngineCommand, Result, RunnerError};

/// Exit code reported when the child ended without one (killed by a signal).
pub const NO_EXIT_CODE: i32 = -1;

/// Abstraction over starting the engine, so runs can be simulated.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Run the engine to completion and return its exit code.
    async fn launch(
        &self,
        command: &EngineCommand,
        config: &Path,
        environment: Option<&LaunchEnvironment>,
    ) -> Result<i32>;
}

/// Launches the engine as a real child process with inherited stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(
        &self,
        command: &EngineCommand,
        config: &Path,
        environment: Option<&LaunchEnvironment>,
    ) -> Result<i32> {
        let program = command.program();
        let mut cmd = Command::new(program);
        cmd.args(command.leading_args()).arg(config).kill_on_drop(true);
        if let Some(env) = environment {
            env.apply(&mut cmd)?;
        }

        info!(program = %program.display(), config = %config.display(), "Launching VRE");
        let status = cmd.status().await.map_err(|source| RunnerError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

        match status.code() {
            Some(code) => Ok(code),
            None => {
                warn!(status = %status, "VRE terminated without an exit code");
                Ok(NO_EXIT_CODE)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn sh(script: &Path) -> EngineCommand {
        EngineCommand::PythonWrapper {
            interpreter: "/bin/sh".into(),
            script: script.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        fs::write(&script, "exit 3\n").unwrap();

        let code = ProcessLauncher
            .launch(&sh(&script), &dir.path().join("vre.xml"), None)
            .await
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_config_path_and_environment_are_passed() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("vre.xml");
        let script = dir.path().join("engine.sh");
        fs::write(
            &script,
            format!(
                "[ \"$1\" = '{}' ] || exit 10\n[ \"$VRE_TEST_LIBS\" = /a:/b ] || exit 11\nexit 0\n",
                config.display()
            ),
        )
        .unwrap();
        let env = LaunchEnvironment {
            var: "VRE_TEST_LIBS".into(),
            search_paths: vec!["/a".into(), "/b".into()],
        };

        let code = ProcessLauncher
            .launch(&sh(&script), &config, Some(&env))
            .await
            .unwrap();
        assert_eq!(code, 0);

        let code = ProcessLauncher
            .launch(&sh(&script), &config, None)
            .await
            .unwrap();
        assert_eq!(code, 11);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let command = EngineCommand::PythonWrapper {
            interpreter: "/definitely/not/here".into(),
            script: "x".into(),
        };
        let err = ProcessLauncher
            .launch(&command, Path::new("vre.xml"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_dropped_launch_kills_engine() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = dir.path().join("engine.sh");
        fs::write(&script, format!("sleep 1\ntouch '{}'\n", marker.display())).unwrap();

        let command = sh(&script);
        let config = dir.path().join("vre.xml");
        let launch = ProcessLauncher.launch(&command, &config, None);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(200), launch).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
