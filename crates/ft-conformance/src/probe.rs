use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use ft_api::{
    ApiError, CompileError, Computation, CustomFunction, Frame, FunctionCtx, Session, Value,
    aot_function,
};
use ft_core::{DType, DenseTensor, Device};
use ft_graph::{Graph, NopObserver, OpKind};
use ft_rng::PhiloxState;
use ft_runtime::EvidenceEntry;
use ft_runtime::config::{self, ConfigPatch, FUNCTIONALIZE_RNG_OPS};

/// Seed used to draw probe inputs before the per-seed loop starts.
pub const PROBE_INPUT_SEED: u64 = 0x5eed;

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeError {
    Assertion {
        probe: String,
        seed: Option<u64>,
        reason: String,
    },
    Compile(CompileError),
    Execution(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assertion {
                probe,
                seed: Some(seed),
                reason,
            } => write!(f, "probe {probe} failed at seed {seed}: {reason}"),
            Self::Assertion {
                probe,
                seed: None,
                reason,
            } => write!(f, "probe {probe} failed: {reason}"),
            Self::Compile(error) => write!(f, "compilation failed: {error}"),
            Self::Execution(reason) => write!(f, "execution failed: {reason}"),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<ApiError> for ProbeError {
    fn from(value: ApiError) -> Self {
        match value {
            ApiError::Compile(error) => Self::Compile(error),
            other => Self::Execution(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub name: String,
    pub device: Device,
    pub seeds: Vec<u64>,
    pub forward_draws: usize,
    pub backward_draws: Option<usize>,
    pub elements_compared: usize,
    pub gradients_compared: bool,
    pub evidence: Vec<EvidenceEntry>,
}

/// Runs a random-consuming computation eagerly and through `aot_function`
/// under the same seed, and requires bit-identical results plus an exact
/// number of `philox_rand` nodes in each captured graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RngProbe {
    name: String,
    device: Device,
    seeds: Vec<u64>,
    input_shape: Vec<usize>,
    dtype: DType,
    requires_grad: bool,
    forward_draws: usize,
    backward_draws: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
struct Observed {
    output: DenseTensor,
    grad: Option<DenseTensor>,
    rng_after: Option<PhiloxState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DrawCounts {
    forward: Option<usize>,
    backward: Option<usize>,
}

impl RngProbe {
    #[must_use]
    pub fn new(name: impl Into<String>, device: Device) -> Self {
        Self {
            name: name.into(),
            device,
            seeds: (0..10).collect(),
            input_shape: vec![10],
            dtype: DType::F32,
            requires_grad: false,
            forward_draws: 0,
            backward_draws: None,
        }
    }

    #[must_use]
    pub fn seeds(mut self, seeds: impl IntoIterator<Item = u64>) -> Self {
        self.seeds = seeds.into_iter().collect();
        self
    }

    #[must_use]
    pub fn input_shape(mut self, shape: &[usize]) -> Self {
        self.input_shape = shape.to_vec();
        self
    }

    #[must_use]
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    #[must_use]
    pub fn requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    #[must_use]
    pub fn expect_forward_draws(mut self, count: usize) -> Self {
        self.forward_draws = count;
        self
    }

    #[must_use]
    pub fn expect_backward_draws(mut self, count: usize) -> Self {
        self.backward_draws = Some(count);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run<F>(&self, computation: F) -> Result<ProbeReport, ProbeError>
    where
        F: Fn(&mut dyn Frame, &[Value]) -> Result<Value, ApiError> + 'static,
    {
        if self.seeds.is_empty() {
            return Err(self.assertion(None, "no seeds configured".to_string()));
        }
        let computation: Rc<Computation> = Rc::new(computation);
        let _functionalize = config::patch(&ConfigPatch::for_key(FUNCTIONALIZE_RNG_OPS, true))
            .map_err(|error| ProbeError::Execution(error.to_string()))?;

        let mut session = Session::new(self.device);
        session.manual_seed(PROBE_INPUT_SEED);
        let input = session.rand(&self.input_shape, self.dtype, false)?;

        let mut elements_compared = 0;
        let mut forward_draws = 0;
        let mut backward_draws = None;
        for &seed in &self.seeds {
            session.manual_seed(seed);
            let eager = self.run_eager(&mut session, computation.as_ref(), input, seed)?;

            session.manual_seed(seed);
            let (compiled, counts) = self.run_compiled(&mut session, &computation, input, seed)?;

            self.compare(seed, &eager, &compiled)?;
            self.check_counts(seed, counts)?;
            elements_compared += eager.output.numel();
            forward_draws = counts.forward.unwrap_or_default();
            backward_draws = counts.backward;
        }

        Ok(ProbeReport {
            name: self.name.clone(),
            device: self.device,
            seeds: self.seeds.clone(),
            forward_draws,
            backward_draws,
            elements_compared,
            gradients_compared: self.requires_grad,
            evidence: session.evidence().to_vec(),
        })
    }

    fn run_eager(
        &self,
        session: &mut Session,
        computation: &Computation,
        input: Value,
        seed: u64,
    ) -> Result<Observed, ProbeError> {
        let x = session.detach_clone(input, self.requires_grad)?;
        let out = session.run(computation, &[x])?;
        self.observe(session, x, out, seed)
    }

    fn run_compiled(
        &self,
        session: &mut Session,
        computation: &Rc<Computation>,
        input: Value,
        seed: u64,
    ) -> Result<(Observed, DrawCounts), ProbeError> {
        let forward = Rc::new(Cell::new(None));
        let backward = Rc::new(Cell::new(None));
        let shared = Rc::clone(computation);
        let mut compiled = aot_function(
            move |frame, inputs| shared(frame, inputs),
            philox_recorder(&forward),
            philox_recorder(&backward),
        )
        .named(self.name.clone());

        let x = session.detach_clone(input, self.requires_grad)?;
        let out = compiled.call(session, &[x])?;
        let observed = self.observe(session, x, out, seed)?;
        Ok((
            observed,
            DrawCounts {
                forward: forward.get(),
                backward: backward.get(),
            },
        ))
    }

    fn observe(
        &self,
        session: &mut Session,
        x: Value,
        out: Value,
        seed: u64,
    ) -> Result<Observed, ProbeError> {
        let output = session.tensor_of(out)?.clone();
        let grad = if self.requires_grad {
            let total = session.sum(out)?;
            session.backward(total)?;
            let grad = session.grad(x).cloned().ok_or_else(|| {
                self.assertion(Some(seed), "backward produced no input gradient".to_string())
            })?;
            Some(grad)
        } else {
            None
        };
        Ok(Observed {
            output,
            grad,
            rng_after: Session::get_rng_state(session).philox(),
        })
    }

    fn compare(&self, seed: u64, eager: &Observed, compiled: &Observed) -> Result<(), ProbeError> {
        if !eager.output.bitwise_eq(&compiled.output) {
            return Err(self.assertion(
                Some(seed),
                format!(
                    "output mismatch: {}",
                    first_difference(&eager.output, &compiled.output)
                ),
            ));
        }
        if let (Some(eager_grad), Some(compiled_grad)) = (&eager.grad, &compiled.grad) {
            if !eager_grad.bitwise_eq(compiled_grad) {
                return Err(self.assertion(
                    Some(seed),
                    format!(
                        "gradient mismatch: {}",
                        first_difference(eager_grad, compiled_grad)
                    ),
                ));
            }
        }
        if eager.rng_after != compiled.rng_after {
            return Err(self.assertion(
                Some(seed),
                format!(
                    "generator position diverged: eager={:?} compiled={:?}",
                    eager.rng_after, compiled.rng_after
                ),
            ));
        }
        Ok(())
    }

    fn check_counts(&self, seed: u64, counts: DrawCounts) -> Result<(), ProbeError> {
        match counts.forward {
            Some(found) if found == self.forward_draws => {}
            Some(found) => {
                return Err(self.assertion(
                    Some(seed),
                    format!(
                        "forward graph has {found} philox_rand node(s), expected {}",
                        self.forward_draws
                    ),
                ));
            }
            None => {
                return Err(self.assertion(
                    Some(seed),
                    "forward graph was never captured".to_string(),
                ));
            }
        }

        // A captured backward graph is always counted; without a declared
        // count it must be draw-free.
        match (counts.backward, self.backward_draws) {
            (None, None) => Ok(()),
            (Some(found), expected) if found == expected.unwrap_or(0) => Ok(()),
            (Some(found), Some(expected)) => Err(self.assertion(
                Some(seed),
                format!("backward graph has {found} philox_rand node(s), expected {expected}"),
            )),
            (Some(found), None) => Err(self.assertion(
                Some(seed),
                format!(
                    "backward graph has {found} philox_rand node(s) but no backward count was declared"
                ),
            )),
            (None, Some(expected)) => Err(self.assertion(
                Some(seed),
                format!(
                    "expected {expected} philox_rand node(s) in the backward graph, but no backward graph was captured"
                ),
            )),
        }
    }

    fn assertion(&self, seed: Option<u64>, reason: String) -> ProbeError {
        ProbeError::Assertion {
            probe: self.name.clone(),
            seed,
            reason,
        }
    }
}

fn philox_recorder(
    slot: &Rc<Cell<Option<usize>>>,
) -> impl FnMut(&Graph) -> Result<(), String> + 'static {
    let slot = Rc::clone(slot);
    move |graph: &Graph| {
        slot.set(Some(graph.count(OpKind::PhiloxRand)));
        Ok(())
    }
}

fn first_difference(lhs: &DenseTensor, rhs: &DenseTensor) -> String {
    if lhs.meta() != rhs.meta() {
        return format!("meta {:?} vs {:?}", lhs.meta(), rhs.meta());
    }
    lhs.values()
        .iter()
        .zip(rhs.values())
        .enumerate()
        .find(|(_, (lhs, rhs))| lhs.to_bits() != rhs.to_bits())
        .map_or_else(
            || "values differ".to_string(),
            |(idx, (lhs, rhs))| format!("index {idx}: eager={lhs} compiled={rhs}"),
        )
}

/// Compiles `computation` on `device` with RNG functionalization on and
/// succeeds only if the compiler rejects it as unsupported.
pub fn expect_functionalization_unsupported<F>(
    name: &str,
    device: Device,
    computation: F,
) -> Result<(), ProbeError>
where
    F: Fn(&mut dyn Frame, &[Value]) -> Result<Value, ApiError> + 'static,
{
    let _functionalize = config::patch(&ConfigPatch::for_key(FUNCTIONALIZE_RNG_OPS, true))
        .map_err(|error| ProbeError::Execution(error.to_string()))?;
    let mut session = Session::new(device);
    session.manual_seed(PROBE_INPUT_SEED);
    let x = session.rand(&[10], DType::F32, false)?;

    let mut compiled = aot_function(computation, NopObserver, NopObserver).named(name);
    let rejected = |reason: String| ProbeError::Assertion {
        probe: name.to_string(),
        seed: None,
        reason,
    };
    match compiled.call(&mut session, &[x]) {
        Err(ApiError::Compile(CompileError::RngFunctionalizationUnsupported { .. })) => Ok(()),
        Ok(_) => Err(rejected(format!(
            "compilation on {device} succeeded, expected rng functionalization to be rejected"
        ))),
        Err(other) => Err(rejected(format!(
            "expected rng functionalization to be rejected, got: {other}"
        ))),
    }
}

fn input(inputs: &[Value], index: usize) -> Result<Value, ApiError> {
    inputs
        .get(index)
        .copied()
        .ok_or(ApiError::UnknownValue(Value(index)))
}

/// `rand_like(x) * x`, then `rand_like(x) * a`.
pub fn two_draw_scale(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let first = frame.rand_like(x)?;
    let a = frame.mul(first, x)?;
    let second = frame.rand_like(x)?;
    frame.mul(second, a)
}

/// Snapshot, one draw, restore, two draws. The second draw repeats the first.
pub fn restore_then_two_draws(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let state = frame.get_rng_state()?;
    let first = frame.rand_like(x)?;
    let a = frame.mul(first, x)?;
    frame.set_rng_state(state)?;
    let second = frame.rand_like(x)?;
    let a = frame.mul(second, a)?;
    let third = frame.rand_like(x)?;
    frame.mul(third, a)
}

/// Snapshot, two draws, restore, one draw.
pub fn two_draws_then_restore(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    let x = input(inputs, 0)?;
    let state = frame.get_rng_state()?;
    let first = frame.rand_like(x)?;
    let a = frame.mul(first, x)?;
    let second = frame.rand_like(x)?;
    let a = frame.mul(second, a)?;
    frame.set_rng_state(state)?;
    let third = frame.rand_like(x)?;
    frame.mul(third, a)
}

/// Custom function drawing once in forward (`rand_like(x) * x`) and once in
/// backward (`grad * rand_like(grad) * cos(x)`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomScale;

impl CustomFunction for RandomScale {
    fn name(&self) -> &str {
        "random_scale"
    }

    fn forward(
        &self,
        frame: &mut dyn Frame,
        ctx: &mut FunctionCtx,
        inputs: &[Value],
    ) -> Result<Value, ApiError> {
        let x = input(inputs, 0)?;
        ctx.save_for_backward(&[x]);
        let noise = frame.rand_like(x)?;
        frame.mul(noise, x)
    }

    fn backward(
        &self,
        frame: &mut dyn Frame,
        saved: &[Value],
        grad_output: Value,
    ) -> Result<Vec<Option<Value>>, ApiError> {
        let x = input(saved, 0)?;
        let noise = frame.rand_like(grad_output)?;
        let scaled = frame.mul(grad_output, noise)?;
        let slope = frame.cos(x)?;
        Ok(vec![Some(frame.mul(scaled, slope)?)])
    }
}

pub fn random_scale(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
    frame.apply_custom(Rc::new(RandomScale), inputs)
}

pub fn scenario_forward(device: Device) -> Result<ProbeReport, ProbeError> {
    RngProbe::new("test_forward", device)
        .seeds(0..10)
        .input_shape(&[10])
        .expect_forward_draws(2)
        .run(two_draw_scale)
}

pub fn scenario_autograd_function(device: Device) -> Result<ProbeReport, ProbeError> {
    RngProbe::new("test_autograd_function", device)
        .seeds([123])
        .input_shape(&[16, 16])
        .requires_grad(true)
        .expect_forward_draws(1)
        .expect_backward_draws(1)
        .run(random_scale)
}

pub fn scenario_set_get_rng_state(device: Device) -> Result<ProbeReport, ProbeError> {
    RngProbe::new("test_set_get_rng_state", device)
        .seeds(0..10)
        .input_shape(&[10])
        .expect_forward_draws(3)
        .run(restore_then_two_draws)
}

pub fn scenario_restore_after_two_draws(device: Device) -> Result<ProbeReport, ProbeError> {
    RngProbe::new("test_restore_after_two_draws", device)
        .seeds(0..10)
        .input_shape(&[10])
        .expect_forward_draws(3)
        .run(two_draws_then_restore)
}

pub fn scenario_cpu_negative() -> Result<(), ProbeError> {
    expect_functionalization_unsupported("test_on_cpu", Device::Cpu, two_draw_scale)
}
