//! Full runs through `RunOrchestrator` with `/bin/sh` standing in for the
//! engine. The Python-wrapper mode is used so the "engine" is a plain
//! script file that needs no exec bit.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use vre_runner::config::{
    AppConfig, EnvSnapshot, DEVICE_OVERRIDE_VAR, EXECUTABLE_OVERRIDE_VAR, USE_PYTHON_VAR,
};
use vre_runner::device::{DeviceDetector, UnsupportedProbe};
use vre_runner::engine::RunOrchestrator;
use vre_runner::types::{RunRequest, RunnerError};

const ORE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ORE>
  <Setup>
    <Parameter name="asofDate">2016-02-05</Parameter>
    <Parameter name="pricingEnginesFile">pricingengine.xml</Parameter>
  </Setup>
  <Analytics>
    <Analytic type="xvaSensitivity">
      <Parameter name="xvaCgExternalComputeDevice">OpenCL/Apple/Apple M1</Parameter>
    </Analytic>
  </Analytics>
</ORE>
"#;

const PRICING_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PricingEngines>
  <GlobalParameters>
    <Parameters>
      <Parameter name="UseExternalComputeDevice">false</Parameter>
    </Parameters>
  </GlobalParameters>
</PricingEngines>
"#;

struct Example {
    _root: TempDir,
    work: PathBuf,
    ore: PathBuf,
    pricing: PathBuf,
}

impl Example {
    /// `<tmp>/Examples/Example_1/Input/{ore,pricingengine}.xml` with the
    /// wrapper at `<tmp>/Examples/vre_wrapper.py`.
    fn new(wrapper: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let examples = root.path().join("Examples");
        let work = examples.join("Example_1");
        fs::create_dir_all(work.join("Input")).unwrap();
        fs::write(examples.join("vre_wrapper.py"), wrapper).unwrap();

        let ore = work.join("Input/ore.xml");
        let pricing = work.join("Input/pricingengine.xml");
        fs::write(&ore, ORE_XML).unwrap();
        fs::write(&pricing, PRICING_XML).unwrap();
        Self {
            _root: root,
            work,
            ore,
            pricing,
        }
    }

    fn orchestrator(&self, device: Option<&str>) -> RunOrchestrator {
        let mut config = AppConfig::default();
        config.engine.python = PathBuf::from("/bin/sh");
        let mut env = EnvSnapshot::default().with(USE_PYTHON_VAR, "1");
        if let Some(tag) = device {
            env = env.with(DEVICE_OVERRIDE_VAR, tag);
        }
        RunOrchestrator::new(config, env, &self.work)
    }

    fn request(&self) -> RunRequest {
        RunRequest::new(&self.ore)
            .with_auxiliary(&self.pricing)
            .with_accelerator(true)
    }

    fn assert_pristine(&self) {
        assert_eq!(fs::read_to_string(&self.ore).unwrap(), ORE_XML);
        assert_eq!(fs::read_to_string(&self.pricing).unwrap(), PRICING_XML);
        for path in [&self.ore, &self.pricing] {
            assert!(!sidecar(path).exists(), "backup left behind for {}", path.display());
        }
    }
}

fn sidecar(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak_gpu_patch");
    PathBuf::from(name)
}

/// Exits 12 unless both configs carry the device tag and enable flags.
const REQUIRE_PATCH: &str = r#"grep -q '<Parameter name="xvaCgExternalComputeDevice">CUDA/NVIDIA/A100</Parameter>' "$1" || exit 12
grep -q '<Parameter name="xvaCgUseExternalComputeDevice">true</Parameter>' "$1" || exit 12
grep -q '<Parameter name="UseExternalComputeDevice">true</Parameter>' "$(dirname "$1")/pricingengine.xml" || exit 12
"#;

#[tokio::test]
async fn test_accelerated_run_sees_patched_config() {
    let ex = Example::new(&format!("{REQUIRE_PATCH}exit 0\n"));
    let mut orch = ex.orchestrator(Some("CUDA/NVIDIA/A100"));

    let outcome = orch.run(&ex.request()).await.unwrap();
    let result = outcome.result().unwrap();
    assert!(result.is_success());
    assert!(result.invoked);
    assert_eq!(
        result.device_used.as_ref().map(|d| d.tag()),
        Some("CUDA/NVIDIA/A100")
    );
    ex.assert_pristine();
}

#[tokio::test]
async fn test_failed_run_restores_both_files() {
    let ex = Example::new(&format!("{REQUIRE_PATCH}exit 3\n"));
    let mut orch = ex.orchestrator(Some("CUDA/NVIDIA/A100"));

    let err = orch.run(&ex.request()).await.unwrap_err();
    assert!(matches!(err, RunnerError::RunFailure { code: 3 }));
    ex.assert_pristine();
}

#[tokio::test]
async fn test_unaccelerated_run_passes_original_config() {
    let ex = Example::new("grep -q 'CUDA/NVIDIA' \"$1\" && exit 13\nexit 0\n");
    let mut orch = ex.orchestrator(Some("CUDA/NVIDIA/A100"));

    let outcome = orch
        .run(&RunRequest::new(&ex.ore).with_auxiliary(&ex.pricing))
        .await
        .unwrap();
    assert!(outcome.result().unwrap().device_used.is_none());
    ex.assert_pristine();
}

#[tokio::test]
async fn test_no_device_skips_run() {
    let ex = Example::new("exit 1\n");
    let mut orch = ex
        .orchestrator(None)
        .with_detector(DeviceDetector::new(None, Box::new(UnsupportedProbe::new("plan9"))));

    let outcome = orch.run(&ex.request()).await.unwrap();
    assert!(outcome.is_skipped());
    ex.assert_pristine();
}

#[tokio::test]
async fn test_dry_run_never_starts_engine() {
    let ex = Example::new("exit 5\n");
    let mut orch = ex.orchestrator(Some("CUDA/NVIDIA/A100"));

    let outcome = orch.run(&ex.request().with_dry_run(true)).await.unwrap();
    assert!(!outcome.result().unwrap().invoked);
    ex.assert_pristine();
}

#[tokio::test]
async fn test_missing_wrapper_is_fatal() {
    let ex = Example::new("exit 0\n");
    fs::remove_file(ex.work.join("../vre_wrapper.py")).unwrap();
    let mut orch = ex.orchestrator(Some("CUDA/NVIDIA/A100"));

    let err = orch.run(&ex.request()).await.unwrap_err();
    assert!(matches!(err, RunnerError::WrapperNotFound { .. }));
    ex.assert_pristine();
}

#[tokio::test]
async fn test_missing_executable_override_fails_before_any_work() {
    let ex = Example::new("exit 0\n");
    let env = EnvSnapshot::default()
        .with(EXECUTABLE_OVERRIDE_VAR, ex.work.join("bin/vre").to_string_lossy())
        .with(DEVICE_OVERRIDE_VAR, "CUDA/NVIDIA/A100");
    let mut orch = RunOrchestrator::new(AppConfig::default(), env, &ex.work);

    let err = orch.run(&ex.request()).await.unwrap_err();
    match err {
        RunnerError::ExecutableNotFound { searched } => {
            assert_eq!(searched, vec![ex.work.join("bin/vre")]);
        }
        other => panic!("unexpected error: {other}"),
    }
    ex.assert_pristine();
}

#[tokio::test]
async fn test_native_engine_gets_library_search_path() {
    // `/bin/sh` as the native engine; the "config" is the script it runs.
    let ex = Example::new("exit 0\n");
    let script = ex.work.join("check_env.sh");
    fs::write(
        &script,
        "[ \"$VRE_IT_LIBS\" = /bin:/:/x:/y ] || exit 21\nexit 0\n",
    )
    .unwrap();

    let mut config = AppConfig::default();
    config.engine.library_path_var = Some("VRE_IT_LIBS".to_string());
    let env = EnvSnapshot::default()
        .with(EXECUTABLE_OVERRIDE_VAR, "/bin/sh")
        .with("VRE_IT_LIBS", "/x:/y:/x");
    let mut orch = RunOrchestrator::new(config, env, &ex.work);

    let outcome = orch.run(&RunRequest::new(&script)).await.unwrap();
    assert!(outcome.result().unwrap().is_success());
}

#[tokio::test]
async fn test_cancelled_run_stops_engine_and_restores() {
    let ex = Example::new("sleep 1\ncp \"$1\" \"$(dirname \"$1\")/seen.xml\"\n");
    let mut orch = ex.orchestrator(Some("CUDA/NVIDIA/A100"));
    let request = ex.request();

    let timed_out =
        tokio::time::timeout(std::time::Duration::from_millis(200), orch.run(&request)).await;
    assert!(timed_out.is_err());
    ex.assert_pristine();

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert!(!ex.work.join("Input/seen.xml").exists());
}

#[tokio::test]
async fn test_malformed_auxiliary_restores_earlier_patches() {
    let ex = Example::new("touch \"$(dirname \"$1\")/started\"\nexit 0\n");
    let broken = "<PricingEngines><Product></PricingEngines>\n";
    fs::write(&ex.pricing, broken).unwrap();
    let mut orch = ex.orchestrator(Some("CUDA/NVIDIA/A100"));

    let err = orch.run(&ex.request()).await.unwrap_err();
    assert!(matches!(err, RunnerError::ConfigParse { .. }));
    assert_eq!(fs::read_to_string(&ex.ore).unwrap(), ORE_XML);
    assert_eq!(fs::read_to_string(&ex.pricing).unwrap(), broken);
    assert!(!sidecar(&ex.ore).exists());
    assert!(!sidecar(&ex.pricing).exists());
    assert!(!ex.work.join("Input/started").exists());
}
