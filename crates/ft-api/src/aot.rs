//! Ahead-of-time capture of computations into forward and backward graphs.
//!
//! Compilation happens on the first call for each guard signature: the
//! computation is traced into a forward graph, its gradient rules are
//! replayed into a backward graph that reads the forward values it needs as
//! extra outputs, random draws are optionally functionalized, and both graphs
//! are shown to the caller's observers before anything executes.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use ft_autograd::{GradFn, NodeId as TapeNode};
use ft_core::{DType, DenseTensor, Device, TensorMeta};
use ft_dispatch::Op;
use ft_graph::{
    Graph, GraphBuilder, GraphError, GraphObserver, NodeId as GraphNode, NopObserver, OpKind,
    functionalize_rng, interpret,
};
use ft_rng::DeviceGenerator;
use ft_runtime::{EvidenceKind, config};

use crate::{ApiError, CustomFunction, Frame, FunctionCtx, Session, StateHandle, Value};

/// Signature every eager or compiled computation shares.
pub type Computation = dyn Fn(&mut dyn Frame, &[Value]) -> Result<Value, ApiError>;

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Random draws were asked to become functional on a device whose
    /// generator has no counter-based mode.
    RngFunctionalizationUnsupported { device: Device },
    Unsupported { reason: String },
    Observer { graph: String, reason: String },
    Trace { reason: String },
    Graph(GraphError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RngFunctionalizationUnsupported { device } => write!(
                f,
                "rng functionalization is unsupported on {device}: generator is not counter-based"
            ),
            Self::Unsupported { reason } => write!(f, "unsupported configuration: {reason}"),
            Self::Observer { graph, reason } => {
                write!(f, "{graph} graph observer rejected capture: {reason}")
            }
            Self::Trace { reason } => write!(f, "tracing failed: {reason}"),
            Self::Graph(error) => write!(f, "graph error: {error}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<GraphError> for CompileError {
    fn from(value: GraphError) -> Self {
        match value {
            GraphError::RngFunctionalizationUnsupported { device } => {
                Self::RngFunctionalizationUnsupported { device }
            }
            other => Self::Graph(other),
        }
    }
}

fn trace_error(error: ApiError) -> CompileError {
    match error {
        ApiError::Compile(error) => error,
        ApiError::Graph(error) => error.into(),
        other => CompileError::Trace {
            reason: other.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy)]
struct Traced {
    node: GraphNode,
    requires_grad: bool,
}

#[derive(Debug)]
enum GradRecord {
    Builtin {
        op: Op,
        inputs: Vec<Value>,
        output: Value,
    },
    Custom {
        function: Rc<dyn CustomFunction>,
        inputs: Vec<Value>,
        saved: Vec<Value>,
        output: Value,
    },
}

/// Records ops into a graph instead of executing them.
#[derive(Debug)]
struct TracingFrame {
    name: String,
    builder: GraphBuilder,
    values: Vec<Traced>,
    states: Vec<GraphNode>,
    records: Vec<GradRecord>,
    grad_mode: bool,
}

impl TracingFrame {
    fn new(name: impl Into<String>, device: Device, grad_mode: bool) -> Self {
        let name = name.into();
        Self {
            builder: GraphBuilder::new(name.clone(), device),
            name,
            values: Vec::new(),
            states: Vec::new(),
            records: Vec::new(),
            grad_mode,
        }
    }

    fn input(&mut self, meta: TensorMeta, requires_grad: bool) -> Value {
        let node = self.builder.placeholder(meta);
        self.push(Traced {
            node,
            requires_grad,
        })
    }

    fn push(&mut self, traced: Traced) -> Value {
        self.values.push(traced);
        Value(self.values.len() - 1)
    }

    fn traced(&self, value: Value) -> Result<Traced, ApiError> {
        self.values
            .get(value.0)
            .copied()
            .ok_or(ApiError::UnknownValue(value))
    }

    fn node(&self, value: Value) -> Result<GraphNode, ApiError> {
        Ok(self.traced(value)?.node)
    }
}

impl Frame for TracingFrame {
    fn device(&self) -> Device {
        self.builder.device()
    }

    fn meta(&self, value: Value) -> Result<TensorMeta, ApiError> {
        Ok(self.builder.meta(self.node(value)?)?.clone())
    }

    fn apply(&mut self, op: Op, args: &[Value]) -> Result<Value, ApiError> {
        let mut nodes = Vec::with_capacity(args.len());
        let mut any_grad = false;
        for arg in args {
            let traced = self.traced(*arg)?;
            nodes.push(traced.node);
            any_grad |= traced.requires_grad;
        }
        let node = self.builder.compute(op, &nodes)?;
        let requires_grad = self.grad_mode && any_grad && op.is_differentiable();
        let output = self.push(Traced {
            node,
            requires_grad,
        });
        if requires_grad {
            self.records.push(GradRecord::Builtin {
                op,
                inputs: args.to_vec(),
                output,
            });
        }
        Ok(output)
    }

    fn rand_like(&mut self, like: Value) -> Result<Value, ApiError> {
        let like = self.node(like)?;
        let node = self.builder.rand_like(like)?;
        Ok(self.push(Traced {
            node,
            requires_grad: false,
        }))
    }

    fn get_rng_state(&mut self) -> Result<StateHandle, ApiError> {
        let node = self.builder.get_rng_state();
        self.states.push(node);
        Ok(StateHandle(self.states.len() - 1))
    }

    fn set_rng_state(&mut self, state: StateHandle) -> Result<(), ApiError> {
        let node = *self
            .states
            .get(state.0)
            .ok_or(ApiError::UnknownState(state))?;
        self.builder.set_rng_state(node)?;
        Ok(())
    }

    fn apply_custom(
        &mut self,
        function: Rc<dyn CustomFunction>,
        inputs: &[Value],
    ) -> Result<Value, ApiError> {
        let mut any_grad = false;
        for input in inputs {
            any_grad |= self.traced(*input)?.requires_grad;
        }
        let requires_grad = self.grad_mode && any_grad;

        // The forward body is inlined with history off; its gradient comes
        // from the function's own backward.
        let previous = std::mem::replace(&mut self.grad_mode, false);
        let mut ctx = FunctionCtx::default();
        let result = function.forward(self, &mut ctx, inputs);
        self.grad_mode = previous;

        let node = self.node(result?)?;
        let output = self.push(Traced {
            node,
            requires_grad,
        });
        if requires_grad {
            self.records.push(GradRecord::Custom {
                function,
                inputs: inputs.to_vec(),
                saved: ctx.saved().to_vec(),
                output,
            });
        }
        Ok(output)
    }
}

/// Replays the recorded gradient rules of a forward trace, newest first,
/// into a separate backward trace.
struct BackwardTracer<'f> {
    forward: &'f TracingFrame,
    frame: TracingFrame,
    imported: BTreeMap<GraphNode, Value>,
    saved: Vec<GraphNode>,
}

impl BackwardTracer<'_> {
    /// Makes a forward value available to the backward graph as an input.
    fn import(&mut self, value: Value) -> Result<Value, ApiError> {
        let node = self.forward.node(value)?;
        if let Some(local) = self.imported.get(&node) {
            return Ok(*local);
        }
        let meta = self.forward.builder.meta(node)?.clone();
        let local = self.frame.input(meta, false);
        self.imported.insert(node, local);
        self.saved.push(node);
        Ok(local)
    }

    fn builtin_vjp(
        &mut self,
        op: Op,
        inputs: &[Value],
        grad: Value,
    ) -> Result<Vec<Option<Value>>, ApiError> {
        Ok(match op {
            Op::Add => vec![Some(grad), Some(grad)],
            Op::Mul => {
                let lhs = self.import(inputs[0])?;
                let rhs = self.import(inputs[1])?;
                vec![
                    Some(self.frame.mul(grad, rhs)?),
                    Some(self.frame.mul(grad, lhs)?),
                ]
            }
            Op::Neg => vec![Some(self.frame.neg(grad)?)],
            Op::Cos => {
                let input = self.import(inputs[0])?;
                let sin = self.frame.sin(input)?;
                let neg_sin = self.frame.neg(sin)?;
                vec![Some(self.frame.mul(grad, neg_sin)?)]
            }
            Op::Sin => {
                let input = self.import(inputs[0])?;
                let cos = self.frame.cos(input)?;
                vec![Some(self.frame.mul(grad, cos)?)]
            }
            Op::Sum => {
                let input = self.import(inputs[0])?;
                vec![Some(self.frame.expand_as(grad, input)?)]
            }
            Op::ExpandAs => vec![Some(self.frame.sum(grad)?), None],
            Op::OnesLike => vec![None],
        })
    }
}

#[derive(Debug)]
struct BackwardPlan {
    graph: Rc<Graph>,
    /// Forward nodes appended to the forward outputs, in backward input order.
    saved: Vec<GraphNode>,
    /// Backward output index per forward input.
    slots: Vec<Option<usize>>,
}

fn trace_backward(
    forward: &TracingFrame,
    inputs: &[Value],
    output: Value,
) -> Result<Option<BackwardPlan>, ApiError> {
    if !forward.traced(output)?.requires_grad {
        return Ok(None);
    }
    let name = format!("{}.backward", forward.name);
    let mut tracer = BackwardTracer {
        forward,
        frame: TracingFrame::new(name, forward.device(), false),
        imported: BTreeMap::new(),
        saved: Vec::new(),
    };
    let grad_output = tracer.frame.input(forward.meta(output)?, false);

    let mut grads: BTreeMap<Value, Value> = BTreeMap::new();
    grads.insert(output, grad_output);

    for record in forward.records.iter().rev() {
        let (record_inputs, contributions) = match record {
            GradRecord::Builtin { op, inputs, output } => {
                let Some(grad) = grads.get(output).copied() else {
                    continue;
                };
                (inputs, tracer.builtin_vjp(*op, inputs, grad)?)
            }
            GradRecord::Custom {
                function,
                inputs,
                saved,
                output,
            } => {
                let Some(grad) = grads.get(output).copied() else {
                    continue;
                };
                let saved = saved
                    .iter()
                    .map(|value| tracer.import(*value))
                    .collect::<Result<Vec<_>, _>>()?;
                let contributions = function.backward(&mut tracer.frame, &saved, grad)?;
                if contributions.len() != inputs.len() {
                    return Err(ApiError::CustomFunction {
                        name: function.name().to_string(),
                        reason: format!(
                            "backward returned {} gradient(s) for {} input(s)",
                            contributions.len(),
                            inputs.len()
                        ),
                    });
                }
                (inputs, contributions)
            }
        };

        for (input, contribution) in record_inputs.iter().zip(contributions) {
            if !forward.traced(*input)?.requires_grad {
                continue;
            }
            let Some(contribution) = contribution else {
                continue;
            };
            let total = match grads.remove(input) {
                Some(existing) => tracer.frame.add(existing, contribution)?,
                None => contribution,
            };
            grads.insert(*input, total);
        }
    }

    let mut outputs = Vec::new();
    let mut slots = Vec::with_capacity(inputs.len());
    for input in inputs {
        match grads.get(input) {
            Some(grad) if forward.traced(*input)?.requires_grad => {
                slots.push(Some(outputs.len()));
                outputs.push(tracer.frame.node(*grad)?);
            }
            _ => slots.push(None),
        }
    }

    let BackwardTracer { frame, saved, .. } = tracer;
    let graph = frame.builder.finish(outputs)?;
    Ok(Some(BackwardPlan {
        graph: Rc::new(graph),
        saved,
        slots,
    }))
}

#[derive(Debug)]
struct Artifact {
    forward: Graph,
    backward: Option<BackwardPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InputGuard {
    Static {
        meta: TensorMeta,
        requires_grad: bool,
    },
    Dynamic {
        rank: usize,
        dtype: DType,
        device: Device,
        requires_grad: bool,
    },
}

impl InputGuard {
    fn new(meta: &TensorMeta, requires_grad: bool, dynamic: bool) -> Self {
        if dynamic {
            Self::Dynamic {
                rank: meta.rank(),
                dtype: meta.dtype(),
                device: meta.device(),
                requires_grad,
            }
        } else {
            Self::Static {
                meta: meta.clone(),
                requires_grad,
            }
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    guards: Vec<InputGuard>,
    artifact: Rc<Artifact>,
}

/// Tape node that runs a compiled backward graph.
#[derive(Debug)]
struct CompiledBackward {
    name: String,
    graph: Rc<Graph>,
    saved: Vec<DenseTensor>,
    slots: Vec<Option<usize>>,
}

impl GradFn for CompiledBackward {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(
        &self,
        generator: &mut DeviceGenerator,
        grad_output: &DenseTensor,
    ) -> Result<Vec<Option<DenseTensor>>, String> {
        let mut inputs = Vec::with_capacity(self.saved.len() + 1);
        inputs.push(grad_output.clone());
        inputs.extend(self.saved.iter().cloned());
        let outputs =
            interpret(&self.graph, &inputs, generator).map_err(|error| error.to_string())?;
        self.slots
            .iter()
            .map(|slot| match slot {
                None => Ok(None),
                Some(idx) => outputs
                    .get(*idx)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| format!("backward graph has no output {idx}")),
            })
            .collect()
    }
}

/// A computation wrapped for ahead-of-time capture.
///
/// Each distinct input signature compiles once. Signatures are exact shapes
/// unless dynamic shapes are on, in which case only rank, dtype and device
/// are guarded.
pub struct CompiledFunction {
    name: String,
    computation: Rc<Computation>,
    fw_observer: Box<dyn GraphObserver>,
    bw_observer: Box<dyn GraphObserver>,
    dynamic: Option<bool>,
    cache: Vec<CacheEntry>,
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("dynamic", &self.dynamic)
            .field("compile_count", &self.cache.len())
            .finish()
    }
}

/// Wraps `computation` so its forward and backward graphs are captured and
/// shown to the observers on first call.
pub fn aot_function<F, FW, BW>(computation: F, fw_observer: FW, bw_observer: BW) -> CompiledFunction
where
    F: Fn(&mut dyn Frame, &[Value]) -> Result<Value, ApiError> + 'static,
    FW: GraphObserver + 'static,
    BW: GraphObserver + 'static,
{
    CompiledFunction {
        name: "compiled".to_string(),
        computation: Rc::new(computation),
        fw_observer: Box::new(fw_observer),
        bw_observer: Box::new(bw_observer),
        dynamic: None,
        cache: Vec::new(),
    }
}

/// `aot_function` without observers. `dynamic` overrides
/// `dynamo.dynamic_shapes` for this function when set.
pub fn compile<F>(computation: F, dynamic: Option<bool>) -> CompiledFunction
where
    F: Fn(&mut dyn Frame, &[Value]) -> Result<Value, ApiError> + 'static,
{
    let mut compiled = aot_function(computation, NopObserver, NopObserver);
    compiled.dynamic = dynamic;
    compiled
}

impl CompiledFunction {
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.cache.len()
    }

    pub fn call(&mut self, session: &mut Session, inputs: &[Value]) -> Result<Value, ApiError> {
        let mut tensors = Vec::with_capacity(inputs.len());
        let mut signature = Vec::with_capacity(inputs.len());
        for input in inputs {
            let tensor = session.tensor_of(*input)?.clone();
            signature.push((tensor.meta().clone(), session.requires_grad(*input)?));
            tensors.push(tensor);
        }

        let dynamic = self
            .dynamic
            .unwrap_or_else(|| config::flag(config::DYNAMIC_SHAPES));
        let guards = signature
            .iter()
            .map(|(meta, requires_grad)| InputGuard::new(meta, *requires_grad, dynamic))
            .collect::<Vec<_>>();

        let cached = self
            .cache
            .iter()
            .find(|entry| entry.guards == guards)
            .map(|entry| Rc::clone(&entry.artifact));
        let artifact = match cached {
            Some(artifact) => artifact,
            None => {
                let artifact = Rc::new(self.compile_artifact(session.device(), &signature, dynamic)?);
                self.record_compile(session, &artifact, dynamic);
                self.cache.push(CacheEntry {
                    guards,
                    artifact: Rc::clone(&artifact),
                });
                artifact
            }
        };

        let outputs = interpret(&artifact.forward, &tensors, &mut session.rng)?;
        let Some((output, saved)) = outputs.split_first() else {
            return Err(CompileError::Trace {
                reason: "forward graph has no outputs".to_string(),
            }
            .into());
        };

        let nodes = inputs
            .iter()
            .map(|input| TapeNode(input.0))
            .collect::<Vec<_>>();
        let out = match &artifact.backward {
            Some(plan) => {
                let grad_fn = CompiledBackward {
                    name: format!("{}.backward", self.name),
                    graph: Rc::clone(&plan.graph),
                    saved: saved.to_vec(),
                    slots: plan.slots.clone(),
                };
                session.tape.custom(&nodes, output.clone(), Rc::new(grad_fn))?
            }
            None => session.tape.leaf(output.clone(), false),
        };
        Ok(Value(out.0))
    }

    fn compile_artifact(
        &mut self,
        device: Device,
        signature: &[(TensorMeta, bool)],
        dynamic: bool,
    ) -> Result<Artifact, CompileError> {
        if dynamic && device == Device::Cpu && config::flag(config::CPP_WRAPPER) {
            return Err(CompileError::Unsupported {
                reason: "cpp_wrapper cannot compile dynamic shapes for cpu".to_string(),
            });
        }

        let mut tracer = TracingFrame::new(self.name.clone(), device, true);
        let inputs = signature
            .iter()
            .map(|(meta, requires_grad)| tracer.input(meta.clone(), *requires_grad))
            .collect::<Vec<_>>();
        let output = {
            let frame: &mut dyn Frame = &mut tracer;
            (self.computation)(frame, &inputs).map_err(trace_error)?
        };
        let backward = trace_backward(&tracer, &inputs, output).map_err(trace_error)?;

        let mut outputs = vec![tracer.node(output).map_err(trace_error)?];
        if let Some(plan) = &backward {
            outputs.extend(plan.saved.iter().copied());
        }
        let mut forward = tracer.builder.finish(outputs)?;
        let mut backward = backward;

        if config::flag(config::FUNCTIONALIZE_RNG_OPS) {
            forward = functionalize_rng(&forward)?;
            if let Some(plan) = backward.as_mut() {
                plan.graph = Rc::new(functionalize_rng(&plan.graph)?);
            }
        }

        self.fw_observer
            .observe(&forward)
            .map_err(|reason| CompileError::Observer {
                graph: "forward".to_string(),
                reason,
            })?;
        if let Some(plan) = &backward {
            self.bw_observer
                .observe(&plan.graph)
                .map_err(|reason| CompileError::Observer {
                    graph: "backward".to_string(),
                    reason,
                })?;
        }

        Ok(Artifact { forward, backward })
    }

    fn record_compile(&self, session: &mut Session, artifact: &Artifact, dynamic: bool) {
        let backward = artifact.backward.as_ref().map(|plan| plan.graph.as_ref());
        session.record(
            EvidenceKind::Compile,
            format!(
                "compiled={} dynamic={dynamic} fw_nodes={} fw_philox_rand={} bw_nodes={} bw_philox_rand={}",
                self.name,
                artifact.forward.nodes().len(),
                artifact.forward.count(OpKind::PhiloxRand),
                backward.map_or(0, |graph| graph.nodes().len()),
                backward.map_or(0, |graph| graph.count(OpKind::PhiloxRand)),
            ),
        );
        if config::flag(config::INDUCTOR_DEBUG) {
            session.record(EvidenceKind::Compile, artifact.forward.to_string());
            if let Some(graph) = backward {
                session.record(EvidenceKind::Compile, graph.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use ft_core::{DType, Device};
    use ft_graph::{CountOps, Graph, OpKind};
    use ft_runtime::{ConfigPatch, EvidenceKind, config};

    use super::{CompileError, aot_function, compile};
    use crate::{ApiError, CustomFunction, Frame, FunctionCtx, Session, Value};

    fn two_draws(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
        let x = inputs[0];
        let r0 = frame.rand_like(x)?;
        let a = frame.mul(r0, x)?;
        let r1 = frame.rand_like(x)?;
        frame.mul(r1, a)
    }

    fn smooth(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
        let x = inputs[0];
        let y = inputs[1];
        let c = frame.cos(x)?;
        let s = frame.sin(y)?;
        let p = frame.mul(c, s)?;
        let q = frame.mul(p, x)?;
        frame.add(q, y)
    }

    #[derive(Debug)]
    struct NoisyScale;

    impl CustomFunction for NoisyScale {
        fn name(&self) -> &str {
            "NoisyScale"
        }

        fn forward(
            &self,
            frame: &mut dyn Frame,
            ctx: &mut FunctionCtx,
            inputs: &[Value],
        ) -> Result<Value, ApiError> {
            ctx.save_for_backward(&[inputs[0]]);
            let noise = frame.rand_like(inputs[0])?;
            frame.mul(noise, inputs[0])
        }

        fn backward(
            &self,
            frame: &mut dyn Frame,
            saved: &[Value],
            grad_output: Value,
        ) -> Result<Vec<Option<Value>>, ApiError> {
            let noise = frame.rand_like(grad_output)?;
            let scaled = frame.mul(grad_output, noise)?;
            let cos = frame.cos(saved[0])?;
            Ok(vec![Some(frame.mul(scaled, cos)?)])
        }
    }

    fn noisy_scale(frame: &mut dyn Frame, inputs: &[Value]) -> Result<Value, ApiError> {
        frame.apply_custom(Rc::new(NoisyScale), inputs)
    }

    fn recorder(slot: &Rc<Cell<Option<usize>>>) -> impl FnMut(&Graph) -> Result<(), String> + 'static {
        let slot = Rc::clone(slot);
        move |graph: &Graph| {
            slot.set(Some(graph.count(OpKind::PhiloxRand)));
            Ok(())
        }
    }

    #[test]
    fn compiled_gradients_match_eager_bitwise() {
        let mut session = Session::new(Device::Cpu);
        session.manual_seed(9);
        let x = session.rand(&[5], DType::F64, true).expect("x");
        let y = session.rand(&[5], DType::F64, true).expect("y");

        let eager = session.run(&smooth, &[x, y]).expect("eager");
        let total = session.sum(eager).expect("sum");
        session.backward(total).expect("eager backward");
        let eager_out = session.tensor_of(eager).expect("out").clone();
        let eager_dx = session.grad(x).expect("dx").clone();
        let eager_dy = session.grad(y).expect("dy").clone();

        let x2 = session.detach_clone(x, true).expect("x2");
        let y2 = session.detach_clone(y, true).expect("y2");
        let mut compiled = compile(smooth, None);
        let out = compiled.call(&mut session, &[x2, y2]).expect("compiled");
        let total = session.sum(out).expect("sum");
        session.backward(total).expect("compiled backward");

        assert!(session.tensor_of(out).expect("out").bitwise_eq(&eager_out));
        assert!(session.grad(x2).expect("dx").bitwise_eq(&eager_dx));
        assert!(session.grad(y2).expect("dy").bitwise_eq(&eager_dy));
        assert_eq!(compiled.compile_count(), 1);
    }

    #[test]
    fn functionalized_forward_reproduces_eager_draws() {
        let _guard = config::patch(&ConfigPatch::for_key(config::FUNCTIONALIZE_RNG_OPS, true))
            .expect("known key");
        let mut session = Session::new(Device::Cuda);
        let x = session.rand(&[10], DType::F32, false).expect("x");
        for seed in 0..4 {
            session.manual_seed(seed);
            let eager = session.run(&two_draws, &[x]).expect("eager");
            let eager = session.tensor_of(eager).expect("eager").clone();
            let after_eager = session.get_rng_state();

            session.manual_seed(seed);
            let mut compiled = aot_function(two_draws, CountOps::philox_rand(2), CountOps::philox_rand(0));
            let out = compiled.call(&mut session, &[x]).expect("compiled");
            assert!(session.tensor_of(out).expect("out").bitwise_eq(&eager));
            assert_eq!(session.get_rng_state().philox(), after_eager.philox());
        }
    }

    #[test]
    fn custom_function_draws_are_split_between_graphs() {
        let _guard = config::patch(&ConfigPatch::for_key(config::FUNCTIONALIZE_RNG_OPS, true))
            .expect("known key");
        let mut session = Session::new(Device::Cuda);
        session.manual_seed(1);
        let x = session.rand(&[4, 4], DType::F32, true).expect("x");
        let x_clone = session.detach_clone(x, true).expect("clone");

        session.manual_seed(123);
        let eager = session.run(&noisy_scale, &[x]).expect("eager");
        let total = session.sum(eager).expect("sum");
        session.backward(total).expect("eager backward");

        let fw = Rc::new(Cell::new(None));
        let bw = Rc::new(Cell::new(None));
        session.manual_seed(123);
        let mut compiled = aot_function(noisy_scale, recorder(&fw), recorder(&bw));
        let out = compiled.call(&mut session, &[x_clone]).expect("compiled");
        let total = session.sum(out).expect("sum");
        session.backward(total).expect("compiled backward");

        assert_eq!(fw.get(), Some(1));
        assert_eq!(bw.get(), Some(1));
        let eager_out = session.tensor_of(eager).expect("eager").clone();
        assert!(session.tensor_of(out).expect("out").bitwise_eq(&eager_out));
        let eager_grad = session.grad(x).expect("x grad").clone();
        assert!(session.grad(x_clone).expect("clone grad").bitwise_eq(&eager_grad));
    }

    #[test]
    fn functionalization_on_host_generator_is_rejected() {
        let _guard = config::patch(&ConfigPatch::for_key(config::FUNCTIONALIZE_RNG_OPS, true))
            .expect("known key");
        let mut session = Session::new(Device::Cpu);
        let x = session.rand(&[10], DType::F32, false).expect("x");
        let mut compiled = compile(two_draws, None);
        let err = compiled.call(&mut session, &[x]).expect_err("cpu cannot functionalize");
        assert_eq!(
            err,
            ApiError::Compile(CompileError::RngFunctionalizationUnsupported {
                device: Device::Cpu
            })
        );
    }

    #[test]
    fn stateful_draws_run_against_live_generator_without_flag() {
        config::reset();
        let mut session = Session::new(Device::Cpu);
        let x = session.rand(&[6], DType::F32, false).expect("x");
        session.manual_seed(42);
        let eager = session.run(&two_draws, &[x]).expect("eager");
        let eager = session.tensor_of(eager).expect("eager").clone();

        session.manual_seed(42);
        let mut compiled = aot_function(
            two_draws,
            CountOps::new(OpKind::RandLike, 2),
            CountOps::philox_rand(0),
        );
        let out = compiled.call(&mut session, &[x]).expect("compiled");
        assert!(session.tensor_of(out).expect("out").bitwise_eq(&eager));
    }

    #[test]
    fn observer_rejection_aborts_compilation() {
        config::reset();
        let mut session = Session::new(Device::Cpu);
        let x = session.rand(&[3], DType::F64, false).expect("x");
        let mut compiled = aot_function(two_draws, CountOps::philox_rand(5), CountOps::philox_rand(0));
        let err = compiled.call(&mut session, &[x]).expect_err("count mismatch");
        assert!(matches!(
            err,
            ApiError::Compile(CompileError::Observer { ref graph, .. }) if graph == "forward"
        ));
        assert_eq!(compiled.compile_count(), 0);
    }

    #[test]
    fn static_guards_recompile_per_shape_and_dynamic_guards_do_not() {
        config::reset();
        let mut session = Session::new(Device::Cpu);
        let small = session.rand(&[3], DType::F64, false).expect("small");
        let large = session.rand(&[7], DType::F64, false).expect("large");
        let y_small = session.rand(&[3], DType::F64, false).expect("y small");
        let y_large = session.rand(&[7], DType::F64, false).expect("y large");

        let mut fixed = compile(smooth, Some(false));
        fixed.call(&mut session, &[small, y_small]).expect("small");
        fixed.call(&mut session, &[large, y_large]).expect("large");
        fixed.call(&mut session, &[small, y_small]).expect("small again");
        assert_eq!(fixed.compile_count(), 2);

        let mut dynamic = compile(smooth, Some(true));
        dynamic.call(&mut session, &[small, y_small]).expect("small");
        let out = dynamic.call(&mut session, &[large, y_large]).expect("large");
        assert_eq!(dynamic.compile_count(), 1);
        assert_eq!(session.tensor_of(out).expect("out").shape(), &[7]);
    }

    #[test]
    fn dynamic_shapes_flag_selects_guard_mode() {
        config::reset();
        let _guard = config::patch(&ConfigPatch::for_key(config::DYNAMIC_SHAPES, true))
            .expect("known key");
        let mut session = Session::new(Device::Cpu);
        let a = session.rand(&[2], DType::F64, false).expect("a");
        let b = session.rand(&[9], DType::F64, false).expect("b");
        let mut compiled = compile(smooth, None);
        compiled.call(&mut session, &[a, a]).expect("first");
        compiled.call(&mut session, &[b, b]).expect("second");
        assert_eq!(compiled.compile_count(), 1);
    }

    #[test]
    fn cpp_wrapper_rejects_dynamic_cpu_compilation() {
        config::reset();
        let _guard = config::patch(&ConfigPatch::for_key(config::CPP_WRAPPER, true))
            .expect("known key");
        let mut session = Session::new(Device::Cpu);
        let x = session.rand(&[4], DType::F64, false).expect("x");
        let mut compiled = compile(smooth, Some(true));
        let err = compiled.call(&mut session, &[x, x]).expect_err("unsupported");
        assert!(matches!(err, ApiError::Compile(CompileError::Unsupported { .. })));

        let mut fixed = compile(smooth, Some(false));
        fixed.call(&mut session, &[x, x]).expect("static shapes are fine");
    }

    #[test]
    fn debug_flag_records_captured_graphs() {
        config::reset();
        let _guard = config::patch(&ConfigPatch::for_key(config::INDUCTOR_DEBUG, true))
            .expect("known key");
        let mut session = Session::new(Device::Cpu);
        let x = session.rand(&[2], DType::F64, true).expect("x");
        let mut compiled = compile(smooth, None).named("smooth");
        compiled.call(&mut session, &[x, x]).expect("compiled");
        let graphs = session
            .evidence()
            .iter()
            .filter(|entry| entry.kind == EvidenceKind::Compile && entry.summary.starts_with("graph "))
            .count();
        assert_eq!(graphs, 2);
    }
}
