use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::Instant;

use ft_core::Device;
use ft_device::{DeviceBackend, DeviceEnvironment, DeviceError};
use ft_runtime::EvidenceEntry;
use ft_runtime::config::{self, ConfigError, ConfigPatch};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::logging::{StructuredCaseLog, mode_label};
use crate::runtime_evidence_field;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    Configuration(String),
    UnknownRegistryEntry { test: String, template: String },
    DuplicateCase { name: String },
    Fixture(String),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(reason) => write!(f, "configuration error: {reason}"),
            Self::UnknownRegistryEntry { test, template } => write!(
                f,
                "failure registry names {test}, which template {template} does not define"
            ),
            Self::DuplicateCase { name } => write!(f, "duplicate test case {name}"),
            Self::Fixture(reason) => write!(f, "fixture error: {reason}"),
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<ConfigError> for HarnessError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<DeviceError> for HarnessError {
    fn from(value: DeviceError) -> Self {
        Self::Configuration(value.to_string())
    }
}

/// What a running case sees: its device and a sink for runtime evidence.
#[derive(Debug)]
pub struct CaseContext {
    device: Device,
    evidence: RefCell<Vec<EvidenceEntry>>,
}

impl CaseContext {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            evidence: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn attach_evidence(&self, entries: &[EvidenceEntry]) {
        self.evidence.borrow_mut().extend_from_slice(entries);
    }

    #[must_use]
    pub fn evidence(&self) -> Vec<EvidenceEntry> {
        self.evidence.borrow().clone()
    }
}

pub type CaseBody = dyn Fn(&CaseContext) -> Result<(), String>;

#[derive(Clone)]
pub struct TemplateCase {
    name: String,
    only_on: Option<Device>,
    patches: Vec<ConfigPatch>,
    body: Rc<CaseBody>,
}

impl fmt::Debug for TemplateCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCase")
            .field("name", &self.name)
            .field("only_on", &self.only_on)
            .field("patches", &self.patches)
            .finish_non_exhaustive()
    }
}

impl TemplateCase {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&CaseContext) -> Result<(), String> + 'static,
    {
        Self {
            name: name.into(),
            only_on: None,
            patches: Vec::new(),
            body: Rc::new(body),
        }
    }

    /// Restricts the case to one device; elsewhere it is bound as a skip.
    #[must_use]
    pub fn only_on(mut self, device: Device) -> Self {
        self.only_on = Some(device);
        self
    }

    #[must_use]
    pub fn with_patch(mut self, patch: ConfigPatch) -> Self {
        self.patches.push(patch);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn restricted_to(&self) -> Option<Device> {
        self.only_on
    }

    #[must_use]
    pub fn patches(&self) -> &[ConfigPatch] {
        &self.patches
    }

    /// Runs the body with this case's patches applied. The previous values
    /// are back in place when this returns or unwinds.
    pub fn run(&self, ctx: &CaseContext) -> Result<(), String> {
        let _patches = config::patch_all(&self.patches).map_err(|error| error.to_string())?;
        (self.body)(ctx)
    }

    fn renamed(&self, name: String) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }
}

/// Named, ordered set of device-generic cases. Never mutated once built;
/// derivation produces a new template.
#[derive(Debug, Clone)]
pub struct TestTemplate {
    name: String,
    cases: Vec<TemplateCase>,
}

pub type DerivedTemplate = TestTemplate;

impl TestTemplate {
    pub fn new(name: impl Into<String>, cases: Vec<TemplateCase>) -> Result<Self, HarnessError> {
        let mut seen = BTreeSet::new();
        for case in &cases {
            if !seen.insert(case.name.as_str()) {
                return Err(HarnessError::DuplicateCase {
                    name: case.name.clone(),
                });
            }
            for patch in &case.patches {
                patch.validate()?;
            }
        }
        Ok(Self {
            name: name.into(),
            cases,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cases(&self) -> &[TemplateCase] {
        &self.cases
    }

    #[must_use]
    pub fn case(&self, name: &str) -> Option<&TemplateCase> {
        self.cases.iter().find(|case| case.name == name)
    }

    #[must_use]
    pub fn case_names(&self) -> Vec<&str> {
        self.cases.iter().map(|case| case.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

pub fn derive(
    template: &TestTemplate,
    class_prefix: &str,
    fn_suffix: &str,
    patch: ConfigPatch,
) -> Result<DerivedTemplate, HarnessError> {
    derive_with_patches(template, class_prefix, fn_suffix, &[patch])
}

/// Copies `template` under `{class_prefix}{name}` with every case renamed to
/// `{case}{fn_suffix}`. `patches` wrap each case outside its own patches.
pub fn derive_with_patches(
    template: &TestTemplate,
    class_prefix: &str,
    fn_suffix: &str,
    patches: &[ConfigPatch],
) -> Result<DerivedTemplate, HarnessError> {
    for patch in patches {
        patch.validate()?;
    }
    let cases = template
        .cases
        .iter()
        .map(|case| {
            let mut derived = case.renamed(format!("{}{fn_suffix}", case.name));
            derived.patches = patches
                .iter()
                .cloned()
                .chain(case.patches.iter().cloned())
                .collect();
            derived
        })
        .collect();
    TestTemplate::new(format!("{class_prefix}{}", template.name), cases)
}

/// Registry entry: an expected failure on the listed backends, or a skip
/// when `is_skip` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub backends: BTreeSet<String>,
    #[serde(default)]
    pub is_skip: bool,
}

impl TestFailure {
    #[must_use]
    pub fn xfail(backends: &[&str]) -> Self {
        Self {
            backends: backends.iter().map(|id| (*id).to_string()).collect(),
            is_skip: false,
        }
    }

    #[must_use]
    pub fn skip(backends: &[&str]) -> Self {
        Self {
            is_skip: true,
            ..Self::xfail(backends)
        }
    }

    #[must_use]
    pub fn applies_to(&self, backend_id: &str) -> bool {
        self.backends.contains(backend_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRegistry {
    #[serde(default)]
    failures: BTreeMap<String, TestFailure>,
}

impl FailureRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        test: impl Into<String>,
        failure: TestFailure,
    ) -> Result<(), HarnessError> {
        for backend in &failure.backends {
            DeviceBackend::parse(backend)?;
        }
        self.failures.insert(test.into(), failure);
        Ok(())
    }

    pub fn with_xfail(mut self, test: &str, backends: &[&str]) -> Result<Self, HarnessError> {
        self.insert(test, TestFailure::xfail(backends))?;
        Ok(self)
    }

    pub fn with_skip(mut self, test: &str, backends: &[&str]) -> Result<Self, HarnessError> {
        self.insert(test, TestFailure::skip(backends))?;
        Ok(self)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, HarnessError> {
        let parsed: Self = serde_json::from_str(raw).map_err(|error| {
            HarnessError::Fixture(format!("failed parsing failure registry: {error}"))
        })?;
        parsed.validated()
    }

    /// Re-checks backend ids on a registry built by deserialization.
    pub fn validated(self) -> Result<Self, HarnessError> {
        let mut registry = Self::new();
        for (test, failure) in self.failures {
            registry.insert(test, failure)?;
        }
        Ok(registry)
    }

    #[must_use]
    pub fn lookup(&self, test: &str, backend_id: &str) -> Option<&TestFailure> {
        self.failures
            .get(test)
            .filter(|failure| failure.applies_to(backend_id))
    }

    /// Every entry must name a case of `template`.
    pub fn validate_against(&self, template: &TestTemplate) -> Result<(), HarnessError> {
        for test in self.failures.keys() {
            if template.case(test).is_none() {
                return Err(HarnessError::UnknownRegistryEntry {
                    test: test.clone(),
                    template: template.name.clone(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Pass,
    ExpectedFailure,
    Skip { reason: String },
}

impl Expectation {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::ExpectedFailure => "xfail",
            Self::Skip { .. } => "skip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedCase {
    expectation: Expectation,
    case: TemplateCase,
}

impl GeneratedCase {
    #[must_use]
    pub fn name(&self) -> &str {
        self.case.name()
    }

    #[must_use]
    pub fn expectation(&self) -> &Expectation {
        &self.expectation
    }

    #[must_use]
    pub fn patches(&self) -> &[ConfigPatch] {
        self.case.patches()
    }
}

/// Concrete per-backend test table, keyed by case name.
#[derive(Debug, Clone)]
pub struct GeneratedTestClass {
    name: String,
    backend: DeviceBackend,
    fixture_id: Option<String>,
    cases: BTreeMap<String, GeneratedCase>,
}

impl GeneratedTestClass {
    #[must_use]
    pub fn new(name: impl Into<String>, backend: DeviceBackend) -> Self {
        Self {
            name: name.into(),
            backend,
            fixture_id: None,
            cases: BTreeMap::new(),
        }
    }

    /// Fixture file the case expectations came from, for log provenance.
    #[must_use]
    pub fn with_fixture(mut self, fixture_id: impl Into<String>) -> Self {
        self.fixture_id = Some(fixture_id.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn backend(&self) -> DeviceBackend {
        self.backend
    }

    pub fn cases(&self) -> impl Iterator<Item = &GeneratedCase> {
        self.cases.values()
    }

    #[must_use]
    pub fn case(&self, name: &str) -> Option<&GeneratedCase> {
        self.cases.get(name)
    }

    #[must_use]
    pub fn case_names(&self) -> Vec<&str> {
        self.cases.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// `None` means the case is omitted (registry skip).
fn expectation_for(
    case: &TemplateCase,
    registry_name: &str,
    backend: &DeviceBackend,
    registry: &FailureRegistry,
    env: &DeviceEnvironment,
) -> Option<Expectation> {
    let failure = registry.lookup(registry_name, backend.id());
    if failure.is_some_and(|failure| failure.is_skip) {
        return None;
    }
    if let Some(reason) = backend.unavailable_reason(env) {
        return Some(Expectation::Skip { reason });
    }
    if let Some(device) = case.only_on {
        if device != backend.device() {
            return Some(Expectation::Skip {
                reason: format!("only runs on {device}"),
            });
        }
    }
    Some(if failure.is_some() {
        Expectation::ExpectedFailure
    } else {
        Expectation::Pass
    })
}

/// Materializes `derived` for one backend as `{template}{BACKEND}`, keeping
/// case names unchanged.
pub fn bind(
    derived: &DerivedTemplate,
    backend_id: &str,
    registry: &FailureRegistry,
    env: &DeviceEnvironment,
) -> Result<GeneratedTestClass, HarnessError> {
    let backend = DeviceBackend::parse(backend_id)?;
    registry.validate_against(derived)?;

    let mut class = GeneratedTestClass::new(
        format!("{}{}", derived.name, backend_id.to_uppercase()),
        backend,
    );
    for case in &derived.cases {
        if let Some(expectation) = expectation_for(case, &case.name, &backend, registry, env) {
            class.cases.insert(
                case.name.clone(),
                GeneratedCase {
                    expectation,
                    case: case.clone(),
                },
            );
        }
    }
    Ok(class)
}

/// Installs `{case}_{backend_suffix}` for every case of `source` into
/// `target`. Registry entries are keyed by the source case name. Running it
/// twice leaves `target` unchanged.
pub fn copy_tests(
    source: &TestTemplate,
    target: &mut GeneratedTestClass,
    backend_suffix: &str,
    registry: &FailureRegistry,
    env: &DeviceEnvironment,
) -> Result<(), HarnessError> {
    let backend = DeviceBackend::parse(backend_suffix)?;
    if backend != target.backend {
        return Err(HarnessError::Configuration(format!(
            "suffix {backend_suffix} does not match class {} bound to {}",
            target.name,
            target.backend.id()
        )));
    }
    registry.validate_against(source)?;

    for case in &source.cases {
        let name = format!("{}_{backend_suffix}", case.name);
        match expectation_for(case, &case.name, &backend, registry, env) {
            Some(expectation) => {
                let case = case.renamed(name.clone());
                target
                    .cases
                    .insert(name, GeneratedCase { expectation, case });
            }
            None => {
                target.cases.remove(&name);
            }
        }
    }
    Ok(())
}

/// One unpatched class per backend, `{template}{BACKEND}`, with cases named
/// `{case}_{backend}`. `only_for` limits the backends instantiated.
pub fn instantiate_device_type_tests(
    template: &TestTemplate,
    backends: &[DeviceBackend],
    only_for: Option<&[&str]>,
    env: &DeviceEnvironment,
) -> Result<Vec<GeneratedTestClass>, HarnessError> {
    let allowed = only_for
        .map(|ids| {
            ids.iter()
                .map(|id| DeviceBackend::parse(id))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;
    let registry = FailureRegistry::new();

    let mut classes = Vec::new();
    for backend in backends {
        if allowed
            .as_ref()
            .is_some_and(|allowed| !allowed.contains(backend))
        {
            continue;
        }
        let mut class = GeneratedTestClass::new(
            format!("{}{}", template.name, backend.id().to_uppercase()),
            *backend,
        );
        copy_tests(template, &mut class, backend.id(), &registry, env)?;
        classes.push(class);
    }
    Ok(classes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed { reason: String },
    ExpectedFailure { reason: String },
    UnexpectedSuccess,
    Skipped { reason: String },
}

impl CaseOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed { .. } => "failed",
            Self::ExpectedFailure { .. } => "expected_failure",
            Self::UnexpectedSuccess => "unexpected_success",
            Self::Skipped { .. } => "skipped",
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::UnexpectedSuccess)
    }

    fn log_outcome(&self) -> &'static str {
        match self {
            Self::Passed | Self::ExpectedFailure { .. } => "pass",
            Self::Skipped { .. } => "skip",
            Self::Failed { .. } | Self::UnexpectedSuccess => "fail",
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason }
            | Self::ExpectedFailure { reason }
            | Self::Skipped { reason } => Some(reason),
            Self::Passed | Self::UnexpectedSuccess => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseResult {
    pub name: String,
    pub outcome: CaseOutcome,
    pub forensic_log: StructuredCaseLog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassReport {
    pub class_name: String,
    pub backend: String,
    pub results: Vec<CaseResult>,
}

impl ClassReport {
    fn count(&self, predicate: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::Passed))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::Failed { .. }))
    }

    #[must_use]
    pub fn expected_failures(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::ExpectedFailure { .. }))
    }

    #[must_use]
    pub fn unexpected_successes(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::UnexpectedSuccess))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::Skipped { .. }))
    }

    #[must_use]
    pub fn is_green(&self) -> bool {
        self.results.iter().all(|result| !result.outcome.is_failure())
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_green())
    }

    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&CaseOutcome> {
        self.results
            .iter()
            .find(|result| result.name == name)
            .map(|result| &result.outcome)
    }
}

/// Executes every case of `class` in name order. Panics inside a case body
/// are caught and reported as failures.
#[must_use]
pub fn run_class(class: &GeneratedTestClass, env: &DeviceEnvironment) -> ClassReport {
    let backend = class.backend;
    let results = class
        .cases
        .values()
        .map(|generated| {
            let started = Instant::now();
            let ctx = CaseContext::new(backend.device());
            let outcome = match (backend.unavailable_reason(env), &generated.expectation) {
                (Some(reason), _) => CaseOutcome::Skipped { reason },
                (None, Expectation::Skip { reason }) => CaseOutcome::Skipped {
                    reason: reason.clone(),
                },
                (None, expectation) => {
                    let result = catch_unwind(AssertUnwindSafe(|| generated.case.run(&ctx)))
                        .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())));
                    match (expectation, result) {
                        (Expectation::ExpectedFailure, Ok(())) => CaseOutcome::UnexpectedSuccess,
                        (Expectation::ExpectedFailure, Err(reason)) => {
                            CaseOutcome::ExpectedFailure { reason }
                        }
                        (_, Ok(())) => CaseOutcome::Passed,
                        (_, Err(reason)) => CaseOutcome::Failed { reason },
                    }
                }
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let forensic_log = case_log(class, generated, &outcome, &ctx.evidence(), duration_ms);
            CaseResult {
                name: generated.name().to_string(),
                outcome,
                forensic_log,
            }
        })
        .collect();

    ClassReport {
        class_name: class.name.clone(),
        backend: backend.id().to_string(),
        results,
    }
}

fn case_log(
    class: &GeneratedTestClass,
    generated: &GeneratedCase,
    outcome: &CaseOutcome,
    evidence: &[EvidenceEntry],
    duration_ms: u64,
) -> StructuredCaseLog {
    let patches = generated
        .patches()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let fixture_id = class.fixture_id.as_deref().unwrap_or("inline");
    let artifact_refs = class
        .fixture_id
        .iter()
        .map(|fixture| format!("crates/ft-conformance/fixtures/{fixture}"))
        .collect();

    let mut extra = BTreeMap::new();
    extra.insert("class_name".to_string(), json!(class.name));
    extra.insert("backend".to_string(), json!(class.backend.id()));
    extra.insert(
        "expectation".to_string(),
        json!(generated.expectation.label()),
    );
    extra.insert("case_outcome".to_string(), json!(outcome.label()));
    extra.insert("patches".to_string(), json!(patches));
    if let Some(reason) = outcome.reason() {
        extra.insert("detail".to_string(), Value::String(reason.to_string()));
    }
    extra.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(evidence),
    );

    StructuredCaseLog::new(
        &class.name,
        fixture_id,
        &class.name,
        generated.name(),
        &mode_label(class.backend.id(), &patches),
        artifact_refs,
        format!(
            "cargo run -p ft-conformance --bin run_device_suites -- --device {}",
            class.backend.id()
        ),
        outcome.log_outcome(),
        outcome.label().to_string(),
    )
    .with_duration_ms(duration_ms)
    .with_extra_fields(extra)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("panicked: {message}");
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("panicked: {message}");
    }
    "panicked with a non-string payload".to_string()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use ft_core::Device;
    use ft_device::{Capability, DeviceBackend, DeviceEnvironment};
    use ft_runtime::config::{self, CPP_WRAPPER, ConfigPatch, DYNAMIC_SHAPES};
    use proptest::prelude::*;

    use super::{
        CaseOutcome, Expectation, FailureRegistry, GeneratedTestClass, HarnessError,
        TemplateCase, TestTemplate, bind, copy_tests, derive, instantiate_device_type_tests,
        run_class,
    };

    fn gpu_env() -> DeviceEnvironment {
        DeviceEnvironment::with_accelerator(Capability { major: 8, minor: 0 })
    }

    fn dynamic_patch() -> ConfigPatch {
        ConfigPatch::for_key(DYNAMIC_SHAPES, true)
    }

    fn passing(name: &str) -> TemplateCase {
        TemplateCase::new(name, |_| Ok(()))
    }

    fn template(names: &[&str]) -> TestTemplate {
        TestTemplate::new(
            "CommonTemplate",
            names.iter().map(|name| passing(name)).collect(),
        )
        .expect("template should build")
    }

    #[test]
    fn derived_case_sees_patch_only_while_running() {
        let observed = Rc::new(Cell::new(None));
        let seen = Rc::clone(&observed);
        let base = TestTemplate::new(
            "CommonTemplate",
            vec![TemplateCase::new("test_flag", move |_| {
                seen.set(Some(config::flag(DYNAMIC_SHAPES)));
                Ok(())
            })],
        )
        .expect("template should build");
        let derived = derive(&base, "DynamicShapes", "_dynamic_shapes", dynamic_patch())
            .expect("derive should succeed");

        assert_eq!(derived.name(), "DynamicShapesCommonTemplate");
        assert_eq!(derived.case_names(), vec!["test_flag_dynamic_shapes"]);
        assert_eq!(base.case_names(), vec!["test_flag"]);

        let class = bind(&derived, "cpu", &FailureRegistry::new(), &gpu_env())
            .expect("bind should succeed");
        let report = run_class(&class, &gpu_env());
        assert_eq!(report.passed(), 1);
        assert_eq!(observed.get(), Some(true));
        assert!(!config::flag(DYNAMIC_SHAPES));
    }

    #[test]
    fn patch_is_restored_after_failure_and_panic() {
        let base = TestTemplate::new(
            "CommonTemplate",
            vec![
                TemplateCase::new("test_err", |_| Err("boom".to_string())),
                TemplateCase::new("test_panic", |_| panic!("kaboom")),
            ],
        )
        .expect("template should build");
        let derived = derive(&base, "DynamicShapes", "_dynamic_shapes", dynamic_patch())
            .expect("derive should succeed");
        let class = bind(&derived, "cpu", &FailureRegistry::new(), &gpu_env())
            .expect("bind should succeed");

        let report = run_class(&class, &gpu_env());
        assert_eq!(report.failed(), 2);
        assert_eq!(report.exit_code(), 1);
        match report.outcome("test_panic_dynamic_shapes") {
            Some(CaseOutcome::Failed { reason }) => assert!(reason.contains("kaboom")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!config::flag(DYNAMIC_SHAPES));
    }

    #[test]
    fn unknown_patch_key_is_a_configuration_error() {
        let err = derive(
            &template(&["test_a"]),
            "Bogus",
            "_bogus",
            ConfigPatch::new("dynamo", "not_a_flag", true),
        )
        .expect_err("unknown key must be rejected");
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn duplicate_case_names_are_rejected() {
        let err = TestTemplate::new("Dup", vec![passing("test_a"), passing("test_a")])
            .expect_err("duplicates must be rejected");
        assert_eq!(
            err,
            HarnessError::DuplicateCase {
                name: "test_a".to_string()
            }
        );
    }

    #[test]
    fn unavailable_backend_binds_every_case_as_skip() {
        let class = bind(
            &template(&["test_a", "test_b"]),
            "cuda",
            &FailureRegistry::new(),
            &DeviceEnvironment::cpu_only(),
        )
        .expect("bind should succeed");
        assert_eq!(class.name(), "CommonTemplateCUDA");
        assert!(
            class
                .cases()
                .all(|case| matches!(case.expectation(), Expectation::Skip { .. }))
        );
        let report = run_class(&class, &DeviceEnvironment::cpu_only());
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn registry_xfail_and_skip_apply_per_backend() {
        let derived = template(&["test_a", "test_b", "test_c"]);
        let registry = FailureRegistry::new()
            .with_xfail("test_a", &["cpu"])
            .and_then(|registry| registry.with_skip("test_b", &["cpu"]))
            .expect("registry should build");

        let cpu = bind(&derived, "cpu", &registry, &gpu_env()).expect("cpu bind");
        assert_eq!(cpu.case_names(), vec!["test_a", "test_c"]);
        assert_eq!(
            cpu.case("test_a").map(|case| case.expectation().clone()),
            Some(Expectation::ExpectedFailure)
        );

        let cuda = bind(&derived, "cuda", &registry, &gpu_env()).expect("cuda bind");
        assert_eq!(cuda.case_names(), vec!["test_a", "test_b", "test_c"]);
        assert!(
            cuda.cases()
                .all(|case| *case.expectation() == Expectation::Pass)
        );
    }

    #[test]
    fn xfail_that_passes_is_an_unexpected_success() {
        let derived = TestTemplate::new(
            "CommonTemplate",
            vec![
                passing("test_fixed"),
                TemplateCase::new("test_broken", |_| Err("still broken".to_string())),
            ],
        )
        .expect("template should build");
        let registry = FailureRegistry::new()
            .with_xfail("test_fixed", &["cpu"])
            .and_then(|registry| registry.with_xfail("test_broken", &["cpu"]))
            .expect("registry should build");
        let class = bind(&derived, "cpu", &registry, &gpu_env()).expect("bind");

        let report = run_class(&class, &gpu_env());
        assert_eq!(report.unexpected_successes(), 1);
        assert_eq!(report.expected_failures(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn unknown_backend_ids_are_rejected() {
        let err = bind(
            &template(&["test_a"]),
            "tpu",
            &FailureRegistry::new(),
            &gpu_env(),
        )
        .expect_err("tpu is unknown");
        assert!(matches!(err, HarnessError::Configuration(_)));

        let err = FailureRegistry::new()
            .with_xfail("test_a", &["tpu"])
            .expect_err("registry must reject tpu");
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn registry_entry_for_missing_test_is_rejected() {
        let registry = FailureRegistry::new()
            .with_xfail("test_missing", &["cpu"])
            .expect("registry should build");
        let err = bind(&template(&["test_a"]), "cpu", &registry, &gpu_env())
            .expect_err("missing test must be rejected");
        assert_eq!(
            err,
            HarnessError::UnknownRegistryEntry {
                test: "test_missing".to_string(),
                template: "CommonTemplate".to_string()
            }
        );
    }

    #[test]
    fn registry_json_round_trips_defaults() {
        let registry = FailureRegistry::from_json_str(
            r#"{"failures": {"test_a": {"backends": ["cpu"]}}}"#,
        )
        .expect("registry json should parse");
        let failure = registry.lookup("test_a", "cpu").expect("entry should exist");
        assert!(!failure.is_skip);
        assert!(registry.lookup("test_a", "cuda").is_none());

        let err = FailureRegistry::from_json_str(r#"{"failures": {"test_a": {"backends": ["xpu"]}}}"#)
            .expect_err("unknown backend in json must fail");
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn copy_tests_is_idempotent_and_suffixes_names() {
        let source = template(&["test_a", "test_b"]);
        let registry = FailureRegistry::new()
            .with_skip("test_b", &["cpu"])
            .expect("registry should build");
        let mut target = GeneratedTestClass::new("DynamicShapesCpuTests", DeviceBackend::cpu());

        copy_tests(&source, &mut target, "cpu", &registry, &gpu_env()).expect("first copy");
        let first = target.case_names().join(",");
        copy_tests(&source, &mut target, "cpu", &registry, &gpu_env()).expect("second copy");
        assert_eq!(target.case_names().join(","), first);
        assert_eq!(target.case_names(), vec!["test_a_cpu"]);

        let err = copy_tests(&source, &mut target, "cuda", &registry, &gpu_env())
            .expect_err("suffix must match the class backend");
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn only_on_cases_skip_elsewhere() {
        let base = TestTemplate::new(
            "TestInductorDynamic",
            vec![
                passing("test_everywhere"),
                passing("test_gpu_only").only_on(Device::Cuda),
            ],
        )
        .expect("template should build");
        let classes = instantiate_device_type_tests(&base, &DeviceBackend::all(), None, &gpu_env())
            .expect("instantiate should succeed");
        assert_eq!(classes.len(), 2);

        let cpu = &classes[0];
        assert_eq!(cpu.name(), "TestInductorDynamicCPU");
        assert!(matches!(
            cpu.case("test_gpu_only_cpu").map(|case| case.expectation()),
            Some(Expectation::Skip { .. })
        ));
        let cuda = &classes[1];
        assert_eq!(
            cuda.case("test_gpu_only_cuda").map(|case| case.expectation().clone()),
            Some(Expectation::Pass)
        );
    }

    #[test]
    fn only_for_filters_backends() {
        let classes = instantiate_device_type_tests(
            &template(&["test_a"]),
            &DeviceBackend::all(),
            Some(&["cuda"]),
            &gpu_env(),
        )
        .expect("instantiate should succeed");
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].backend(), DeviceBackend::cuda());

        let err = instantiate_device_type_tests(
            &template(&["test_a"]),
            &DeviceBackend::all(),
            Some(&["npu"]),
            &gpu_env(),
        )
        .expect_err("unknown only_for id must fail");
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn case_patches_apply_inside_derived_patch() {
        let observed = Rc::new(Cell::new(None));
        let seen = Rc::clone(&observed);
        let base = TestTemplate::new(
            "CommonTemplate",
            vec![
                TemplateCase::new("test_wrapper", move |_| {
                    seen.set(Some((
                        config::flag(DYNAMIC_SHAPES),
                        config::flag(CPP_WRAPPER),
                    )));
                    Ok(())
                })
                .with_patch(ConfigPatch::for_key(CPP_WRAPPER, true)),
            ],
        )
        .expect("template should build");
        let derived = derive(&base, "DynamicShapes", "_dynamic_shapes", dynamic_patch())
            .expect("derive should succeed");
        let class = bind(&derived, "cpu", &FailureRegistry::new(), &gpu_env()).expect("bind");
        let report = run_class(&class, &gpu_env());
        assert_eq!(report.passed(), 1);
        assert_eq!(report.outcome("test_wrapper_dynamic_shapes"), Some(&CaseOutcome::Passed));
        assert_eq!(observed.get(), Some((true, true)));
        assert!(!config::flag(CPP_WRAPPER));
    }

    #[test]
    fn forensic_logs_carry_case_identity() {
        let derived = derive(
            &template(&["test_a"]),
            "DynamicShapes",
            "_dynamic_shapes",
            dynamic_patch(),
        )
        .expect("derive should succeed");
        let class = bind(&derived, "cpu", &FailureRegistry::new(), &gpu_env())
            .expect("bind")
            .with_fixture("dynamic_shapes_failures.json");
        let report = run_class(&class, &gpu_env());
        let log = &report.results[0].forensic_log;
        assert_eq!(log.outcome, "pass");
        assert_eq!(log.mode, "cpu[dynamo.dynamic_shapes=true]");
        assert_eq!(log.fixture_id, "dynamic_shapes_failures.json");
        assert!(log.extra_fields.contains_key("runtime_evidence"));
    }

    proptest! {
        #[test]
        fn bind_preserves_method_set_minus_skips(
            names in proptest::collection::btree_set("test_[a-z]{1,8}", 1..8),
            marks in proptest::collection::vec(0_u8..3, 8),
            marked_backend in prop_oneof![Just("cpu"), Just("cuda")],
            cuda_available in any::<bool>(),
        ) {
            let names = names.iter().map(String::as_str).collect::<Vec<_>>();
            let derived = derive(&template(&names), "DynamicShapes", "_dynamic_shapes", dynamic_patch())
                .expect("derive should succeed");

            let mut registry = FailureRegistry::new();
            let mut skipped = Vec::new();
            let mut xfailed = Vec::new();
            for (name, mark) in derived.case_names().into_iter().zip(&marks) {
                match mark {
                    1 => {
                        registry = registry.with_skip(name, &[marked_backend]).expect("skip entry");
                        skipped.push(name.to_string());
                    }
                    2 => {
                        registry = registry.with_xfail(name, &[marked_backend]).expect("xfail entry");
                        xfailed.push(name.to_string());
                    }
                    _ => {}
                }
            }

            let env = if cuda_available { gpu_env() } else { DeviceEnvironment::cpu_only() };
            for backend in ["cpu", "cuda"] {
                let class = bind(&derived, backend, &registry, &env)
                    .expect("bind should succeed");
                let mut expected = derived
                    .case_names()
                    .into_iter()
                    .filter(|name| {
                        backend != marked_backend || !skipped.iter().any(|skip| skip.as_str() == *name)
                    })
                    .collect::<Vec<_>>();
                expected.sort_unstable();
                prop_assert_eq!(class.case_names(), expected);
                for name in &xfailed {
                    prop_assert!(class.case(name).is_some(), "xfail entry removed {}", name);
                }
            }
        }
    }
}
