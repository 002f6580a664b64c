#![forbid(unsafe_code)]

mod logging;
pub mod multiplexer;
pub mod probe;
pub mod suites;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ft_device::{DeviceBackend, DeviceEnvironment};
use ft_runtime::EvidenceEntry;
use serde::Deserialize;
use serde_json::{Value, json};

pub use logging::{STRUCTURED_LOG_SCHEMA_VERSION, StructuredCaseLog, mode_label};
pub use multiplexer::{
    CaseContext, CaseOutcome, CaseResult, ClassReport, DerivedTemplate, Expectation,
    FailureRegistry, GeneratedCase, GeneratedTestClass, HarnessError, TemplateCase,
    TestFailure, TestTemplate, bind, copy_tests, derive, derive_with_patches,
    instantiate_device_type_tests, run_class,
};
pub use probe::{
    PROBE_INPUT_SEED, ProbeError, ProbeReport, RandomScale, RngProbe,
    expect_functionalization_unsupported, scenario_autograd_function, scenario_cpu_negative,
    scenario_forward, scenario_restore_after_two_draws, scenario_set_get_rng_state,
};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub output_path: PathBuf,
    pub env: DeviceEnvironment,
}

impl HarnessConfig {
    /// Fixture and artifact paths relative to this crate, with the device
    /// environment read from the process. An unparsable
    /// `FT_CUDA_CAPABILITY` leaves only the host backend available.
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            output_path: repo_root.join("artifacts/device_suites/device_suites.jsonl"),
            env: DeviceEnvironment::detect().unwrap_or(DeviceEnvironment::cpu_only()),
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: DeviceEnvironment) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn failure_registry_path(&self) -> PathBuf {
        self.fixture_root
            .join(suites::DYNAMIC_SHAPES_FAILURES_FIXTURE)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSuiteSummary {
    pub output_path: PathBuf,
    pub classes: usize,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub skipped_entries: usize,
    pub backends: Vec<String>,
}

impl DeviceSuiteSummary {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed_entries > 0)
    }
}

pub fn load_failure_registry(config: &HarnessConfig) -> Result<FailureRegistry, String> {
    let path = config.failure_registry_path();
    load_fixture::<FailureRegistry>(&path)?
        .validated()
        .map_err(|error| format!("invalid failure registry {}: {error}", path.display()))
}

/// Builds every suite and runs the classes bound to one of `backends`.
pub fn run_device_suites(
    config: &HarnessConfig,
    backends: &[DeviceBackend],
) -> Result<Vec<ClassReport>, String> {
    let registry = load_failure_registry(config)?;
    let classes =
        suites::all_classes(&registry, &config.env).map_err(|error| error.to_string())?;
    Ok(classes
        .iter()
        .filter(|class| backends.contains(&class.backend()))
        .map(|class| run_class(class, &config.env))
        .collect())
}

/// Runs the suites and writes one JSONL line per case to `output_path`.
pub fn emit_device_suite_logs(
    config: &HarnessConfig,
    output_path: &Path,
    backends: &[DeviceBackend],
) -> Result<DeviceSuiteSummary, String> {
    let reports = run_device_suites(config, backends)?;
    let logs = reports
        .iter()
        .flat_map(|report| report.results.iter())
        .map(|result| &result.forensic_log)
        .collect::<Vec<_>>();

    let mut lines = String::new();
    for entry in &logs {
        let line = serde_json::to_string(entry)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create device suite output dir {}: {error}",
                parent.display()
            )
        })?;
    }
    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write device suite log {}: {error}",
            output_path.display()
        )
    })?;

    let (total, passed) = summarize_passes(reports.iter().flat_map(|report| {
        report
            .results
            .iter()
            .map(|result| !result.outcome.is_failure())
    }));
    let skipped_entries = logs.iter().filter(|entry| entry.outcome == "skip").count();

    Ok(DeviceSuiteSummary {
        output_path: output_path.to_path_buf(),
        classes: reports.len(),
        log_entries: logs.len(),
        failed_entries: total - passed,
        skipped_entries,
        backends: backends.iter().map(|backend| backend.id().to_string()).collect(),
    })
}

pub(crate) fn runtime_evidence_field(entries: &[EvidenceEntry]) -> Value {
    let mut kind_counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in entries {
        kind_counts
            .entry(entry.kind.label().to_string())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    json!({
        "total_entries": entries.len(),
        "kind_counts": kind_counts,
        "entries": entries
            .iter()
            .map(|entry| {
                json!({
                    "ts_unix_ms": entry.ts_unix_ms,
                    "kind": entry.kind.label(),
                    "summary": entry.summary,
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}
