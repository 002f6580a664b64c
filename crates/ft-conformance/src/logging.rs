use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "ft-conformance-log-v1";

/// One JSONL line per executed case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_unix_ms: u64,
    pub suite_id: String,
    pub test_id: String,
    pub fixture_id: String,
    pub scenario_id: String,
    pub mode: String,
    pub seed: u64,
    pub input_digest: String,
    pub output_digest: String,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub duration_ms: u64,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        class_name: &str,
        case_name: &str,
        mode: &str,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: String,
    ) -> Self {
        let test_id = format!("{class_name}::{case_name}");
        let scenario_id = format!("{suite_id}/{mode}:{case_name}");
        let input_digest = digest_hex(&[suite_id, class_name, case_name, mode]);
        let output_digest = digest_hex(&[test_id.as_str(), outcome, reason_code.as_str()]);
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms: now_unix_ms(),
            seed: deterministic_seed(&[suite_id, test_id.as_str()]),
            suite_id: suite_id.to_string(),
            test_id,
            fixture_id: fixture_id.to_string(),
            scenario_id,
            mode: mode.to_string(),
            input_digest,
            output_digest,
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            duration_ms: 0,
            outcome: outcome.to_string(),
            reason_code,
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(fields);
        self
    }
}

/// Label for a backend id plus the patches active on a case, e.g.
/// `cpu[dynamo.dynamic_shapes=true]`.
#[must_use]
pub fn mode_label(backend: &str, patches: &[String]) -> String {
    if patches.is_empty() {
        return backend.to_string();
    }
    format!("{backend}[{}]", patches.join(","))
}

fn deterministic_seed(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    parts.hash(&mut hasher);
    hasher.finish()
}

fn digest_hex(parts: &[&str]) -> String {
    format!("det64:{:016x}", deterministic_seed(parts))
}

fn env_fingerprint() -> String {
    let capability = std::env::var("FT_CUDA_CAPABILITY").unwrap_or_else(|_| "default".to_string());
    let asan = std::env::var("FT_TEST_WITH_ASAN").unwrap_or_else(|_| "0".to_string());
    digest_hex(&[
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION"),
        capability.as_str(),
        asan.as_str(),
    ])
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::{StructuredCaseLog, mode_label};

    fn sample() -> StructuredCaseLog {
        StructuredCaseLog::new(
            "dynamic_shapes",
            "dynamic_shapes_failures.json",
            "DynamicShapesCpuTests",
            "test_add_dynamic_shapes_cpu",
            "cpu[dynamo.dynamic_shapes=true]",
            vec!["crates/ft-conformance/fixtures/dynamic_shapes_failures.json".to_string()],
            "cargo run -p ft-conformance --bin run_device_suites -- --device cpu".to_string(),
            "pass",
            "passed".to_string(),
        )
    }

    #[test]
    fn seed_and_digests_are_stable_per_case() {
        let first = sample();
        let second = sample();
        assert_eq!(first.seed, second.seed);
        assert_eq!(first.input_digest, second.input_digest);
        assert_eq!(first.output_digest, second.output_digest);
        assert_eq!(first.test_id, "DynamicShapesCpuTests::test_add_dynamic_shapes_cpu");
        assert!(first.input_digest.starts_with("det64:"));
    }

    #[test]
    fn extra_fields_flatten_into_the_envelope() {
        let mut extra = BTreeMap::new();
        extra.insert("expectation".to_string(), json!("pass"));
        let log = sample().with_extra_fields(extra).with_duration_ms(7);

        let line = serde_json::to_string(&log).expect("log should serialize");
        let raw: Value = serde_json::from_str(&line).expect("line should parse");
        assert_eq!(raw["expectation"], json!("pass"));
        assert_eq!(raw["duration_ms"], json!(7));
        assert_eq!(raw["schema_version"], json!("ft-conformance-log-v1"));

        let decoded: StructuredCaseLog = serde_json::from_str(&line).expect("log should decode");
        assert_eq!(decoded, log);
    }

    #[test]
    fn mode_label_lists_active_patches() {
        assert_eq!(mode_label("cuda", &[]), "cuda");
        assert_eq!(
            mode_label("cpu", &["dynamo.dynamic_shapes=true".to_string()]),
            "cpu[dynamo.dynamic_shapes=true]"
        );
    }
}
