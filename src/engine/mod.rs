//! Engine side of a run: finding the VRE binary, preparing its library
//! search path, starting it, and orchestrating a full patched run.

pub mod environment;
pub mod launcher;
pub mod locator;
pub mod orchestrator;

pub use environment::LaunchEnvironment;
pub use launcher::{EngineLauncher, ProcessLauncher};
pub use locator::ExecutableLocator;
pub use orchestrator::RunOrchestrator;
