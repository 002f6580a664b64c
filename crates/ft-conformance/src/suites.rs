//! Concrete test tables: RNG functionalization, the device-generic compiler
//! parity template and its dynamic-shapes derivation.

use ft_api::{ApiError, CompiledFunction, Computation, Frame, Session, Value, compile};
use ft_core::{DType, DenseTensor, Device};
use ft_device::{DeviceBackend, DeviceEnvironment};
use ft_runtime::config::{
    self, AUTOTUNE_POINTWISE, CPP_MIN_CHUNK_SIZE, CPP_WRAPPER, ConfigPatch, DYNAMIC_SHAPES,
    IMPLICIT_FALLBACKS, INDUCTOR_DEBUG,
};

use crate::multiplexer::{
    CaseContext, DerivedTemplate, FailureRegistry, GeneratedTestClass, HarnessError,
    TemplateCase, TestTemplate, copy_tests, derive, instantiate_device_type_tests,
};
use crate::probe::{
    ProbeReport, scenario_autograd_function, scenario_cpu_negative, scenario_forward,
    scenario_restore_after_two_draws, scenario_set_get_rng_state,
};

pub const DYNAMIC_SHAPES_FAILURES_FIXTURE: &str = "dynamic_shapes_failures.json";

const INPUT_SEED: u64 = 2023;
const RUN_SEED: u64 = 7;

fn api(error: ApiError) -> String {
    error.to_string()
}

fn probe_case(
    name: &str,
    scenario: fn(Device) -> Result<ProbeReport, crate::probe::ProbeError>,
) -> TemplateCase {
    TemplateCase::new(name, move |ctx: &CaseContext| {
        let report = scenario(ctx.device()).map_err(|error| error.to_string())?;
        ctx.attach_evidence(&report.evidence);
        Ok(())
    })
}

pub fn functionalization_template() -> Result<TestTemplate, HarnessError> {
    TestTemplate::new(
        "TestFunctionalizationRngOps",
        vec![
            probe_case("test_forward", scenario_forward),
            probe_case("test_autograd_function", scenario_autograd_function),
            probe_case("test_set_get_rng_state", scenario_set_get_rng_state),
            probe_case(
                "test_restore_after_two_draws",
                scenario_restore_after_two_draws,
            ),
        ],
    )
}

pub fn negative_template() -> Result<TestTemplate, HarnessError> {
    TestTemplate::new(
        "NegativeTest",
        vec![TemplateCase::new("test_on_cpu", |_: &CaseContext| {
            scenario_cpu_negative().map_err(|error| error.to_string())
        })],
    )
}

/// Functionalization cases instantiated for cuda only, plus the cpu-only
/// negative test.
pub fn functionalization_classes(
    env: &DeviceEnvironment,
) -> Result<Vec<GeneratedTestClass>, HarnessError> {
    let mut classes = instantiate_device_type_tests(
        &functionalization_template()?,
        &DeviceBackend::all(),
        Some(&["cuda"]),
        env,
    )?;
    classes.extend(instantiate_device_type_tests(
        &negative_template()?,
        &DeviceBackend::all(),
        Some(&["cpu"]),
        env,
    )?);
    Ok(classes)
}

type ComputationFn = fn(&mut dyn Frame, &[Value]) -> Result<Value, ApiError>;

fn input(inputs: &[Value], index: usize) -> Result<Value, ApiError> {
    inputs
        .get(index)
        .copied()
        .ok_or(ApiError::UnknownValue(Value(index)))
}

fn add_inputs(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    frame.add(input(inputs, 0)?, input(inputs, 1)?)
}

fn neg_product(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let product = frame.mul(input(inputs, 0)?, input(inputs, 1)?)?;
    frame.neg(product)
}

fn sin_plus_cos(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let s = frame.sin(x)?;
    let c = frame.cos(x)?;
    frame.add(s, c)
}

fn scale_by_total(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let total = frame.sum(x)?;
    let expanded = frame.expand_as(total, x)?;
    frame.mul(expanded, x)
}

fn shift_by_one(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let ones = frame.ones_like(x)?;
    frame.add(ones, x)
}

fn sin_times_self(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let s = frame.sin(x)?;
    frame.mul(s, x)
}

fn noisy_scale(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let noise = frame.rand_like(x)?;
    frame.mul(noise, x)
}

fn leaves(
    session: &mut Session,
    shapes: &[&[usize]],
) -> Result<Vec<Value>, ApiError> {
    shapes
        .iter()
        .map(|shape| session.rand(shape, DType::F32, false))
        .collect()
}

fn detach_all(
    session: &mut Session,
    inputs: &[Value],
    requires_grad: bool,
) -> Result<Vec<Value>, ApiError> {
    inputs
        .iter()
        .map(|input| session.detach_clone(*input, requires_grad))
        .collect()
}

fn gradients(
    session: &mut Session,
    out: Value,
    inputs: &[Value],
    requires_grad: bool,
) -> Result<Vec<Option<DenseTensor>>, ApiError> {
    if !requires_grad {
        return Ok(Vec::new());
    }
    let total = session.sum(out)?;
    session.backward(total)?;
    Ok(inputs
        .iter()
        .map(|input| session.grad(*input).cloned())
        .collect())
}

fn ensure_bitwise(what: &str, expected: &DenseTensor, actual: &DenseTensor) -> Result<(), String> {
    if expected.bitwise_eq(actual) {
        return Ok(());
    }
    Err(format!(
        "{what} mismatch: eager={:?} compiled={:?}",
        expected.values(),
        actual.values()
    ))
}

/// Runs `computation` eagerly and through `compiled` on fresh copies of
/// `inputs`, both from the same seed, and requires bit-identical outputs and
/// input gradients.
fn check_call(
    session: &mut Session,
    compiled: &mut CompiledFunction,
    computation: &Computation,
    inputs: &[Value],
    requires_grad: bool,
) -> Result<(), String> {
    let eager_inputs = detach_all(session, inputs, requires_grad).map_err(api)?;
    session.manual_seed(RUN_SEED);
    let expected = session.run(computation, &eager_inputs).map_err(api)?;
    let expected_grads =
        gradients(session, expected, &eager_inputs, requires_grad).map_err(api)?;

    let compiled_inputs = detach_all(session, inputs, requires_grad).map_err(api)?;
    session.manual_seed(RUN_SEED);
    let actual = compiled.call(session, &compiled_inputs).map_err(api)?;
    let actual_grads = gradients(session, actual, &compiled_inputs, requires_grad).map_err(api)?;

    ensure_bitwise(
        "output",
        session.tensor_of(expected).map_err(api)?,
        session.tensor_of(actual).map_err(api)?,
    )?;
    for (idx, (expected, actual)) in expected_grads.iter().zip(&actual_grads).enumerate() {
        match (expected, actual) {
            (Some(expected), Some(actual)) => {
                ensure_bitwise(&format!("grad[{idx}]"), expected, actual)?;
            }
            (None, None) => {}
            _ => return Err(format!("grad[{idx}] reached only one of eager and compiled")),
        }
    }
    Ok(())
}

fn with_session<F>(ctx: &CaseContext, body: F) -> Result<(), String>
where
    F: FnOnce(&mut Session) -> Result<(), String>,
{
    let mut session = Session::new(ctx.device());
    session.manual_seed(INPUT_SEED);
    let result = body(&mut session);
    ctx.attach_evidence(session.evidence());
    result
}

fn parity_case(
    name: &str,
    shapes: &'static [&'static [usize]],
    requires_grad: bool,
    computation: ComputationFn,
) -> TemplateCase {
    let case_name = name.to_string();
    TemplateCase::new(name, move |ctx: &CaseContext| {
        with_session(ctx, |session| {
            let inputs = leaves(session, shapes).map_err(api)?;
            let mut compiled = compile(computation, None).named(case_name.clone());
            check_call(session, &mut compiled, &computation, &inputs, requires_grad)
        })
    })
}

/// One compiled function fed two shapes of equal rank. Dynamic shapes reuse
/// the first compilation; static shapes specialize again.
fn shape_change_case(ctx: &CaseContext) -> Result<(), String> {
    with_session(ctx, |session| {
        let mut compiled = compile(sin_plus_cos, None).named("shape_change");
        for shape in [&[4_usize][..], &[7][..]] {
            let inputs = leaves(session, &[shape]).map_err(api)?;
            check_call(session, &mut compiled, &sin_plus_cos, &inputs, false)?;
        }
        let expected = if config::flag(DYNAMIC_SHAPES) { 1 } else { 2 };
        if compiled.compile_count() != expected {
            return Err(format!(
                "expected {expected} compilation(s), found {}",
                compiled.compile_count()
            ));
        }
        Ok(())
    })
}

/// Device-generic compiler parity cases.
pub fn common_template() -> Result<TestTemplate, HarnessError> {
    TestTemplate::new(
        "CommonTemplate",
        vec![
            parity_case("test_add", &[&[8], &[8]], false, add_inputs),
            parity_case("test_neg_mul", &[&[3, 4], &[3, 4]], true, neg_product),
            parity_case("test_sin_cos", &[&[16]], true, sin_plus_cos),
            parity_case("test_sum_expand", &[&[2, 5]], true, scale_by_total),
            parity_case("test_ones_like", &[&[6]], false, shift_by_one),
            parity_case("test_backward_sin_mul", &[&[4, 4]], true, sin_times_self),
            parity_case("test_rand_like", &[&[10]], true, noisy_scale),
            parity_case("test_cpp_wrapper", &[&[8], &[8]], false, add_inputs)
                .with_patch(ConfigPatch::for_key(CPP_WRAPPER, true)),
            TemplateCase::new("test_shape_change", shape_change_case),
        ],
    )
}

pub fn dynamic_shapes_template() -> Result<DerivedTemplate, HarnessError> {
    derive(
        &common_template()?,
        "DynamicShapes",
        "_dynamic_shapes",
        ConfigPatch::for_key(DYNAMIC_SHAPES, true),
    )
}

/// `DynamicShapesCpuTests`, plus `DynamicShapesCudaTests` when the
/// accelerator can run.
pub fn dynamic_shapes_classes(
    registry: &FailureRegistry,
    env: &DeviceEnvironment,
) -> Result<Vec<GeneratedTestClass>, HarnessError> {
    let derived = dynamic_shapes_template()?;
    let mut classes = Vec::new();

    let mut cpu = GeneratedTestClass::new("DynamicShapesCpuTests", DeviceBackend::cpu())
        .with_fixture(DYNAMIC_SHAPES_FAILURES_FIXTURE);
    copy_tests(&derived, &mut cpu, "cpu", registry, env)?;
    classes.push(cpu);

    let cuda_backend = DeviceBackend::cuda();
    if cuda_backend.is_available(env) {
        let mut cuda = GeneratedTestClass::new("DynamicShapesCudaTests", cuda_backend)
            .with_fixture(DYNAMIC_SHAPES_FAILURES_FIXTURE);
        copy_tests(&derived, &mut cuda, "cuda", registry, env)?;
        classes.push(cuda);
    }
    Ok(classes)
}

fn inductor_patches(case: TemplateCase) -> TemplateCase {
    case.with_patch(ConfigPatch::for_key(INDUCTOR_DEBUG, false))
        .with_patch(ConfigPatch::for_key(CPP_MIN_CHUNK_SIZE, 1_i64))
        .with_patch(ConfigPatch::for_key(AUTOTUNE_POINTWISE, false))
        .with_patch(ConfigPatch::for_key(IMPLICIT_FALLBACKS, false))
}

/// Calls one `compile(dynamic=true)` function with several shapes and
/// requires parity plus the given number of compilations.
fn dynamic_reuse(
    ctx: &CaseContext,
    name: &str,
    shapes: &[&[usize]],
    expected_compiles: usize,
) -> Result<(), String> {
    with_session(ctx, |session| {
        let mut compiled = compile(scale_by_total, Some(true)).named(name);
        for shape in shapes {
            let inputs = leaves(session, &[*shape]).map_err(api)?;
            check_call(session, &mut compiled, &scale_by_total, &inputs, true)?;
        }
        if compiled.compile_count() != expected_compiles {
            return Err(format!(
                "expected {expected_compiles} compilation(s), found {}",
                compiled.compile_count()
            ));
        }
        Ok(())
    })
}

pub fn inductor_dynamic_template() -> Result<TestTemplate, HarnessError> {
    TestTemplate::new(
        "TestInductorDynamic",
        vec![
            inductor_patches(TemplateCase::new("test_reuse_dynamic", |ctx: &CaseContext| {
                dynamic_reuse(ctx, "reuse_dynamic", &[&[10], &[17], &[3]], 1)
            })),
            inductor_patches(
                TemplateCase::new("test_rank_change_dynamic", |ctx: &CaseContext| {
                    dynamic_reuse(ctx, "rank_change_dynamic", &[&[2, 24], &[5, 7], &[9]], 2)
                })
                .only_on(Device::Cuda),
            ),
        ],
    )
}

pub fn inductor_dynamic_classes(
    env: &DeviceEnvironment,
) -> Result<Vec<GeneratedTestClass>, HarnessError> {
    instantiate_device_type_tests(&inductor_dynamic_template()?, &DeviceBackend::all(), None, env)
}

/// Every generated class, in execution order.
pub fn all_classes(
    registry: &FailureRegistry,
    env: &DeviceEnvironment,
) -> Result<Vec<GeneratedTestClass>, HarnessError> {
    let mut classes = functionalization_classes(env)?;
    classes.extend(dynamic_shapes_classes(registry, env)?);
    classes.extend(inductor_dynamic_classes(env)?);
    Ok(classes)
}
