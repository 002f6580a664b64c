#![forbid(unsafe_code)]

//! Captured computation graphs.
//!
//! A graph is a straight-line list of nodes in execution order. Random draws
//! start out stateful (`RandLike`, `GetRngState`, `SetRngState`) and read the
//! live device generator. [`functionalize_rng`] rewrites them into
//! `PhiloxRand` nodes that are pure functions of an explicit seed and offset,
//! threading the offset through `PhiloxAdvance` nodes.

use std::collections::BTreeMap;
use std::fmt;

use ft_core::{DenseTensor, Device, TensorMeta};
use ft_dispatch::{DispatchError, Op, dispatch};
use ft_rng::{DeviceGenerator, GeneratorKind, RngError, RngState, philox_increment, philox_uniform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphOp {
    Placeholder { index: usize },
    Compute { op: Op, args: Vec<NodeId> },
    RandLike { like: NodeId },
    GetRngState,
    SetRngState { state: NodeId },
    RngSeed,
    RngBaseOffset,
    PhiloxRand { seed: NodeId, offset: NodeId, like: NodeId },
    PhiloxAdvance { offset: NodeId, like: NodeId },
}

impl GraphOp {
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Placeholder { .. } => OpKind::Placeholder,
            Self::Compute { op, .. } => OpKind::Compute(*op),
            Self::RandLike { .. } => OpKind::RandLike,
            Self::GetRngState => OpKind::GetRngState,
            Self::SetRngState { .. } => OpKind::SetRngState,
            Self::RngSeed => OpKind::RngSeed,
            Self::RngBaseOffset => OpKind::RngBaseOffset,
            Self::PhiloxRand { .. } => OpKind::PhiloxRand,
            Self::PhiloxAdvance { .. } => OpKind::PhiloxAdvance,
        }
    }

    fn operands(&self) -> Vec<NodeId> {
        match self {
            Self::Placeholder { .. } | Self::GetRngState | Self::RngSeed | Self::RngBaseOffset => {
                Vec::new()
            }
            Self::Compute { args, .. } => args.clone(),
            Self::RandLike { like } => vec![*like],
            Self::SetRngState { state } => vec![*state],
            Self::PhiloxRand { seed, offset, like } => vec![*seed, *offset, *like],
            Self::PhiloxAdvance { offset, like } => vec![*offset, *like],
        }
    }
}

/// Payload-free node classification used by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Placeholder,
    Compute(Op),
    RandLike,
    GetRngState,
    SetRngState,
    RngSeed,
    RngBaseOffset,
    PhiloxRand,
    PhiloxAdvance,
}

impl OpKind {
    #[must_use]
    pub const fn is_stateful_rng(self) -> bool {
        matches!(self, Self::RandLike | Self::GetRngState | Self::SetRngState)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Placeholder => "placeholder",
            Self::Compute(op) => op.name(),
            Self::RandLike => "rand_like",
            Self::GetRngState => "get_rng_state",
            Self::SetRngState => "set_rng_state",
            Self::RngSeed => "rng_seed",
            Self::RngBaseOffset => "rng_base_offset",
            Self::PhiloxRand => "philox_rand",
            Self::PhiloxAdvance => "philox_advance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub op: GraphOp,
    /// Layout of the produced tensor; `None` for rng bookkeeping nodes.
    pub meta: Option<TensorMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    name: String,
    device: Device,
    nodes: Vec<Node>,
    outputs: Vec<NodeId>,
    rng_output: Option<NodeId>,
}

impl Graph {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Node holding the generator offset the graph leaves behind.
    #[must_use]
    pub fn rng_output(&self) -> Option<NodeId> {
        self.rng_output
    }

    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.count(OpKind::Placeholder)
    }

    #[must_use]
    pub fn count(&self, kind: OpKind) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.op.kind() == kind)
            .count()
    }

    #[must_use]
    pub fn has_stateful_rng(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| node.op.kind().is_stateful_rng())
    }

    #[must_use]
    pub fn is_functional(&self) -> bool {
        self.rng_output.is_some()
    }

    pub fn meta(&self, id: NodeId) -> Result<&TensorMeta, GraphError> {
        self.nodes
            .get(id.0)
            .ok_or(GraphError::UnknownNode(id))?
            .meta
            .as_ref()
            .ok_or(GraphError::NotATensor(id))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {}({}):", self.name, self.device)?;
        for node in &self.nodes {
            let operands = node
                .op
                .operands()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "  {} = {}({operands})", node.id, node.op.kind().label())?;
            if let GraphOp::Placeholder { index } = node.op {
                write!(f, " #{index}")?;
            }
            if let Some(meta) = &node.meta {
                write!(f, " : {}{:?}", meta.dtype().label(), meta.shape())?;
            }
            writeln!(f)?;
        }
        let outputs = self
            .outputs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "  return ({outputs})")?;
        if let Some(rng) = self.rng_output {
            write!(f, " rng_offset={rng}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    UnknownNode(NodeId),
    NotATensor(NodeId),
    NotAnRngState(NodeId),
    Dispatch(DispatchError),
    Rng(RngError),
    RngFunctionalizationUnsupported { device: Device },
    InputCount { expected: usize, actual: usize },
    InputMismatch { index: usize, expected: TensorMeta, actual: TensorMeta },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(id) => write!(f, "graph references unknown node {id}"),
            Self::NotATensor(id) => write!(f, "node {id} does not produce a tensor"),
            Self::NotAnRngState(id) => write!(f, "node {id} does not produce an rng state"),
            Self::Dispatch(error) => write!(f, "graph op failed: {error}"),
            Self::Rng(error) => write!(f, "graph rng failure: {error}"),
            Self::RngFunctionalizationUnsupported { device } => write!(
                f,
                "rng functionalization is not supported on device {device}"
            ),
            Self::InputCount { expected, actual } => {
                write!(f, "graph expects {expected} input(s), got {actual}")
            }
            Self::InputMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "graph input #{index} expected rank {} {} on {}, got rank {} {} on {}",
                expected.rank(),
                expected.dtype().label(),
                expected.device(),
                actual.rank(),
                actual.dtype().label(),
                actual.device()
            ),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<DispatchError> for GraphError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<RngError> for GraphError {
    fn from(value: RngError) -> Self {
        match value {
            RngError::FunctionalizationUnsupported { device } => {
                Self::RngFunctionalizationUnsupported { device }
            }
            other => Self::Rng(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphBuilder {
    name: String,
    device: Device,
    nodes: Vec<Node>,
    placeholders: usize,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>, device: Device) -> Self {
        Self {
            name: name.into(),
            device,
            nodes: Vec::new(),
            placeholders: 0,
        }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn placeholder(&mut self, meta: TensorMeta) -> NodeId {
        let index = self.placeholders;
        self.placeholders += 1;
        self.push(GraphOp::Placeholder { index }, Some(meta))
    }

    pub fn compute(&mut self, op: Op, args: &[NodeId]) -> Result<NodeId, GraphError> {
        let metas = args
            .iter()
            .map(|arg| self.meta(*arg))
            .collect::<Result<Vec<_>, _>>()?;
        let meta = op.infer_meta(&metas)?;
        Ok(self.push(
            GraphOp::Compute {
                op,
                args: args.to_vec(),
            },
            Some(meta),
        ))
    }

    pub fn rand_like(&mut self, like: NodeId) -> Result<NodeId, GraphError> {
        let meta = self.meta(like)?.clone();
        Ok(self.push(GraphOp::RandLike { like }, Some(meta)))
    }

    pub fn get_rng_state(&mut self) -> NodeId {
        self.push(GraphOp::GetRngState, None)
    }

    pub fn set_rng_state(&mut self, state: NodeId) -> Result<NodeId, GraphError> {
        match self.nodes.get(state.0).map(|node| &node.op) {
            Some(GraphOp::GetRngState) => Ok(self.push(GraphOp::SetRngState { state }, None)),
            Some(_) => Err(GraphError::NotAnRngState(state)),
            None => Err(GraphError::UnknownNode(state)),
        }
    }

    pub fn meta(&self, id: NodeId) -> Result<&TensorMeta, GraphError> {
        self.nodes
            .get(id.0)
            .ok_or(GraphError::UnknownNode(id))?
            .meta
            .as_ref()
            .ok_or(GraphError::NotATensor(id))
    }

    pub fn finish(self, outputs: Vec<NodeId>) -> Result<Graph, GraphError> {
        self.finish_with_rng(outputs, None)
    }

    fn finish_with_rng(
        self,
        outputs: Vec<NodeId>,
        rng_output: Option<NodeId>,
    ) -> Result<Graph, GraphError> {
        for output in &outputs {
            self.meta(*output)?;
        }
        Ok(Graph {
            name: self.name,
            device: self.device,
            nodes: self.nodes,
            outputs,
            rng_output,
        })
    }

    fn push(&mut self, op: GraphOp, meta: Option<TensorMeta>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, op, meta });
        id
    }
}

/// Structural check run over a captured graph before it is executed.
/// Returning an error aborts compilation.
pub trait GraphObserver {
    fn observe(&mut self, graph: &Graph) -> Result<(), String>;
}

impl<F> GraphObserver for F
where
    F: FnMut(&Graph) -> Result<(), String>,
{
    fn observe(&mut self, graph: &Graph) -> Result<(), String> {
        self(graph)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NopObserver;

impl GraphObserver for NopObserver {
    fn observe(&mut self, _graph: &Graph) -> Result<(), String> {
        Ok(())
    }
}

/// Requires an exact number of nodes of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountOps {
    pub kind: OpKind,
    pub expected: usize,
}

impl CountOps {
    #[must_use]
    pub const fn new(kind: OpKind, expected: usize) -> Self {
        Self { kind, expected }
    }

    #[must_use]
    pub const fn philox_rand(expected: usize) -> Self {
        Self::new(OpKind::PhiloxRand, expected)
    }
}

impl GraphObserver for CountOps {
    fn observe(&mut self, graph: &Graph) -> Result<(), String> {
        let actual = graph.count(self.kind);
        if actual != self.expected {
            return Err(format!(
                "expected {} {} node(s), found {actual}",
                self.expected,
                self.kind.label()
            ));
        }
        Ok(())
    }
}

/// Rewrites stateful random draws into explicit Philox draws.
///
/// Each `RandLike` becomes one `PhiloxRand` at the running offset followed by
/// one `PhiloxAdvance`; `GetRngState` captures the running offset and
/// `SetRngState` rewinds to it. Graphs without stateful rng nodes are returned
/// unchanged.
pub fn functionalize_rng(graph: &Graph) -> Result<Graph, GraphError> {
    if !graph.has_stateful_rng() {
        return Ok(graph.clone());
    }
    if GeneratorKind::for_device(graph.device) != GeneratorKind::Philox {
        return Err(GraphError::RngFunctionalizationUnsupported {
            device: graph.device,
        });
    }

    let mut builder = GraphBuilder::new(graph.name.clone(), graph.device);
    builder.placeholders = graph.num_inputs();
    let seed = builder.push(GraphOp::RngSeed, None);
    let mut offset = builder.push(GraphOp::RngBaseOffset, None);

    let mut remap: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    let mut saved_offsets: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    let lookup = |remap: &BTreeMap<NodeId, NodeId>, id: NodeId| {
        remap.get(&id).copied().ok_or(GraphError::UnknownNode(id))
    };

    for node in &graph.nodes {
        match &node.op {
            GraphOp::Placeholder { index } => {
                let new_id = builder.push(GraphOp::Placeholder { index: *index }, node.meta.clone());
                remap.insert(node.id, new_id);
            }
            GraphOp::Compute { op, args } => {
                let args = args
                    .iter()
                    .map(|arg| lookup(&remap, *arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let new_id = builder.push(GraphOp::Compute { op: *op, args }, node.meta.clone());
                remap.insert(node.id, new_id);
            }
            GraphOp::RandLike { like } => {
                let like = lookup(&remap, *like)?;
                let draw = builder.push(GraphOp::PhiloxRand { seed, offset, like }, node.meta.clone());
                offset = builder.push(GraphOp::PhiloxAdvance { offset, like }, None);
                remap.insert(node.id, draw);
            }
            GraphOp::GetRngState => {
                saved_offsets.insert(node.id, offset);
            }
            GraphOp::SetRngState { state } => {
                offset = saved_offsets
                    .get(state)
                    .copied()
                    .ok_or(GraphError::NotAnRngState(*state))?;
            }
            GraphOp::RngSeed
            | GraphOp::RngBaseOffset
            | GraphOp::PhiloxRand { .. }
            | GraphOp::PhiloxAdvance { .. } => {
                return Err(GraphError::NotATensor(node.id));
            }
        }
    }

    let outputs = graph
        .outputs
        .iter()
        .map(|output| lookup(&remap, *output))
        .collect::<Result<Vec<_>, _>>()?;
    builder.finish_with_rng(outputs, Some(offset))
}

#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Tensor(DenseTensor),
    Scalar(u64),
    State(RngState),
}

/// Executes `graph` against concrete inputs.
///
/// Stateful rng nodes read and advance `generator` directly. Functional graphs
/// read the generator's `(seed, offset)` once up front and store the final
/// offset back when they finish.
pub fn interpret(
    graph: &Graph,
    inputs: &[DenseTensor],
    generator: &mut DeviceGenerator,
) -> Result<Vec<DenseTensor>, GraphError> {
    if inputs.len() != graph.num_inputs() {
        return Err(GraphError::InputCount {
            expected: graph.num_inputs(),
            actual: inputs.len(),
        });
    }
    let uses_rng = graph.is_functional() || graph.has_stateful_rng();
    if uses_rng && generator.device() != graph.device {
        return Err(GraphError::Rng(RngError::DeviceMismatch {
            expected: graph.device,
            actual: generator.device(),
        }));
    }
    let philox = if graph.is_functional() {
        Some(generator.philox_state()?)
    } else {
        None
    };

    let mut slots = vec![Slot::Empty; graph.nodes.len()];
    for node in &graph.nodes {
        let slot = match &node.op {
            GraphOp::Placeholder { index } => {
                let input = &inputs[*index];
                if let Some(expected) = &node.meta {
                    check_input(*index, expected, input)?;
                }
                Slot::Tensor(input.clone())
            }
            GraphOp::Compute { op, args } => {
                let tensors = args
                    .iter()
                    .map(|arg| tensor_slot(&slots, *arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Slot::Tensor(dispatch(*op, &tensors, false)?.tensor)
            }
            GraphOp::RandLike { like } => {
                let like = tensor_slot(&slots, *like)?;
                let values = generator.uniform(like.numel());
                Slot::Tensor(fill(like, values)?)
            }
            GraphOp::GetRngState => Slot::State(generator.snapshot()),
            GraphOp::SetRngState { state } => match &slots[state.0] {
                Slot::State(state) => {
                    generator.restore(state)?;
                    Slot::Empty
                }
                _ => return Err(GraphError::NotAnRngState(*state)),
            },
            GraphOp::RngSeed => Slot::Scalar(philox.map_or(0, |state| state.seed)),
            GraphOp::RngBaseOffset => Slot::Scalar(philox.map_or(0, |state| state.offset)),
            GraphOp::PhiloxRand { seed, offset, like } => {
                let seed = scalar_slot(&slots, *seed)?;
                let offset = scalar_slot(&slots, *offset)?;
                let like = tensor_slot(&slots, *like)?;
                let values = philox_uniform(seed, offset, like.numel());
                Slot::Tensor(fill(like, values)?)
            }
            GraphOp::PhiloxAdvance { offset, like } => {
                let offset = scalar_slot(&slots, *offset)?;
                let like = tensor_slot(&slots, *like)?;
                Slot::Scalar(offset.wrapping_add(philox_increment(like.numel())))
            }
        };
        slots[node.id.0] = slot;
    }

    if let Some(rng_output) = graph.rng_output {
        generator.set_philox_offset(scalar_slot(&slots, rng_output)?)?;
    }

    graph
        .outputs
        .iter()
        .map(|output| tensor_slot(&slots, *output).cloned())
        .collect()
}

fn check_input(index: usize, expected: &TensorMeta, actual: &DenseTensor) -> Result<(), GraphError> {
    let actual = actual.meta();
    if expected.rank() != actual.rank()
        || expected.dtype() != actual.dtype()
        || expected.device() != actual.device()
    {
        return Err(GraphError::InputMismatch {
            index,
            expected: expected.clone(),
            actual: actual.clone(),
        });
    }
    Ok(())
}

fn fill(like: &DenseTensor, values: Vec<f64>) -> Result<DenseTensor, GraphError> {
    like.with_values(values)
        .map_err(|error| GraphError::Dispatch(DispatchError::Kernel(error.into())))
}

fn tensor_slot(slots: &[Slot], id: NodeId) -> Result<&DenseTensor, GraphError> {
    match slots.get(id.0) {
        Some(Slot::Tensor(tensor)) => Ok(tensor),
        Some(_) => Err(GraphError::NotATensor(id)),
        None => Err(GraphError::UnknownNode(id)),
    }
}

fn scalar_slot(slots: &[Slot], id: NodeId) -> Result<u64, GraphError> {
    match slots.get(id.0) {
        Some(Slot::Scalar(value)) => Ok(*value),
        Some(_) => Err(GraphError::NotATensor(id)),
        None => Err(GraphError::UnknownNode(id)),
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, DenseTensor, Device, TensorMeta};
    use ft_dispatch::Op;
    use ft_rng::DeviceGenerator;
    use proptest::prelude::*;

    use super::{
        CountOps, Graph, GraphBuilder, GraphError, GraphObserver, NopObserver, OpKind,
        functionalize_rng, interpret,
    };

    fn meta(numel: usize, device: Device) -> TensorMeta {
        TensorMeta::from_shape(vec![numel], DType::F32, device)
    }

    fn input(numel: usize, device: Device) -> DenseTensor {
        DenseTensor::new(
            (0..numel).map(|idx| idx as f64 * 0.25).collect(),
            vec![numel],
            DType::F32,
            device,
        )
        .expect("input should build")
    }

    fn two_draw_graph(device: Device) -> Graph {
        let mut builder = GraphBuilder::new("forward", device);
        let x = builder.placeholder(meta(10, device));
        let r0 = builder.rand_like(x).expect("rand_like");
        let a = builder.compute(Op::Mul, &[r0, x]).expect("mul");
        let r1 = builder.rand_like(x).expect("rand_like");
        let b = builder.compute(Op::Mul, &[r1, a]).expect("mul");
        builder.finish(vec![b]).expect("graph should finish")
    }

    fn restore_graph(device: Device) -> Graph {
        let mut builder = GraphBuilder::new("forward", device);
        let x = builder.placeholder(meta(10, device));
        let state = builder.get_rng_state();
        let r0 = builder.rand_like(x).expect("rand_like");
        let a = builder.compute(Op::Mul, &[r0, x]).expect("mul");
        builder.set_rng_state(state).expect("set state");
        let r1 = builder.rand_like(x).expect("rand_like");
        let b = builder.compute(Op::Mul, &[r1, a]).expect("mul");
        let r2 = builder.rand_like(x).expect("rand_like");
        let c = builder.compute(Op::Mul, &[r2, b]).expect("mul");
        builder.finish(vec![c]).expect("graph should finish")
    }

    #[test]
    fn functionalization_replaces_each_draw_with_one_philox_node() {
        let graph = functionalize_rng(&two_draw_graph(Device::Cuda)).expect("cuda supports philox");
        assert_eq!(graph.count(OpKind::PhiloxRand), 2);
        assert_eq!(graph.count(OpKind::RandLike), 0);
        assert!(graph.is_functional());
        assert!(!graph.has_stateful_rng());
    }

    #[test]
    fn functional_and_stateful_execution_agree_bitwise() {
        let stateful = two_draw_graph(Device::Cuda);
        let functional = functionalize_rng(&stateful).expect("functionalize");
        let x = input(10, Device::Cuda);

        let mut eager_gen = DeviceGenerator::new(Device::Cuda);
        eager_gen.manual_seed(7);
        let expected = interpret(&stateful, &[x.clone()], &mut eager_gen).expect("stateful run");

        let mut functional_gen = DeviceGenerator::new(Device::Cuda);
        functional_gen.manual_seed(7);
        let actual = interpret(&functional, &[x], &mut functional_gen).expect("functional run");

        assert!(expected[0].bitwise_eq(&actual[0]));
        assert_eq!(
            eager_gen.philox_state().expect("philox"),
            functional_gen.philox_state().expect("philox")
        );
    }

    #[test]
    fn state_restore_rewinds_the_offset_chain() {
        let stateful = restore_graph(Device::Cuda);
        let functional = functionalize_rng(&stateful).expect("functionalize");
        assert_eq!(functional.count(OpKind::PhiloxRand), 3);

        let x = input(10, Device::Cuda);
        let mut eager_gen = DeviceGenerator::new(Device::Cuda);
        eager_gen.manual_seed(3);
        let expected = interpret(&stateful, &[x.clone()], &mut eager_gen).expect("stateful run");
        let mut functional_gen = DeviceGenerator::new(Device::Cuda);
        functional_gen.manual_seed(3);
        let actual = interpret(&functional, &[x], &mut functional_gen).expect("functional run");

        assert!(expected[0].bitwise_eq(&actual[0]));
        assert_eq!(
            functional_gen.philox_state().expect("philox").offset,
            2 * ft_rng::philox_increment(10)
        );
    }

    #[test]
    fn host_device_cannot_be_functionalized() {
        let err = functionalize_rng(&two_draw_graph(Device::Cpu))
            .expect_err("cpu has no philox generator");
        assert_eq!(
            err,
            GraphError::RngFunctionalizationUnsupported {
                device: Device::Cpu
            }
        );
    }

    #[test]
    fn rng_free_graph_is_left_unchanged_on_any_device() {
        let mut builder = GraphBuilder::new("forward", Device::Cpu);
        let x = builder.placeholder(meta(3, Device::Cpu));
        let y = builder.compute(Op::Cos, &[x]).expect("cos");
        let graph = builder.finish(vec![y]).expect("finish");
        let rewritten = functionalize_rng(&graph).expect("nothing to rewrite");
        assert_eq!(rewritten, graph);
    }

    #[test]
    fn count_ops_observer_enforces_exact_count() {
        let graph = functionalize_rng(&two_draw_graph(Device::Cuda)).expect("functionalize");
        assert!(CountOps::philox_rand(2).observe(&graph).is_ok());
        let err = CountOps::philox_rand(3)
            .observe(&graph)
            .expect_err("lower count must be rejected");
        assert!(err.contains("expected 3 philox_rand"), "unexpected error: {err}");
        assert!(CountOps::philox_rand(1).observe(&graph).is_err());
        assert!(NopObserver.observe(&graph).is_ok());
    }

    #[test]
    fn closures_act_as_observers() {
        let graph = two_draw_graph(Device::Cuda);
        let mut seen = 0;
        let mut observer = |graph: &Graph| -> Result<(), String> {
            seen = graph.count(OpKind::RandLike);
            Ok(())
        };
        observer.observe(&graph).expect("observer should accept");
        assert_eq!(seen, 2);
    }

    #[test]
    fn set_rng_state_requires_a_state_node() {
        let mut builder = GraphBuilder::new("forward", Device::Cuda);
        let x = builder.placeholder(meta(2, Device::Cuda));
        assert_eq!(
            builder.set_rng_state(x).expect_err("tensor is not a state"),
            GraphError::NotAnRngState(x)
        );
    }

    #[test]
    fn interpreter_checks_input_count_and_layout() {
        let graph = two_draw_graph(Device::Cuda);
        let mut generator = DeviceGenerator::new(Device::Cuda);
        assert!(matches!(
            interpret(&graph, &[], &mut generator),
            Err(GraphError::InputCount {
                expected: 1,
                actual: 0
            })
        ));
        let wrong_device = input(10, Device::Cpu);
        assert!(matches!(
            interpret(&graph, &[wrong_device], &mut generator),
            Err(GraphError::InputMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn display_lists_nodes_and_outputs() {
        let graph = functionalize_rng(&two_draw_graph(Device::Cuda)).expect("functionalize");
        let text = graph.to_string();
        assert!(text.starts_with("graph forward(cuda):"));
        assert!(text.contains("philox_rand("));
        assert!(text.contains("rng_offset="));
    }

    proptest! {
        #[test]
        fn prop_functional_replay_matches_stateful(seed in any::<u64>(), numel in 1usize..24) {
            let mut builder = GraphBuilder::new("forward", Device::Cuda);
            let x = builder.placeholder(meta(numel, Device::Cuda));
            let r = builder.rand_like(x).expect("rand_like");
            let y = builder.compute(Op::Mul, &[r, x]).expect("mul");
            let stateful = builder.finish(vec![y]).expect("finish");
            let functional = functionalize_rng(&stateful).expect("functionalize");

            let x = input(numel, Device::Cuda);
            let mut lhs = DeviceGenerator::new(Device::Cuda);
            lhs.manual_seed(seed);
            let mut rhs = DeviceGenerator::new(Device::Cuda);
            rhs.manual_seed(seed);
            let expected = interpret(&stateful, &[x.clone()], &mut lhs).expect("stateful");
            let actual = interpret(&functional, &[x], &mut rhs).expect("functional");
            prop_assert!(expected[0].bitwise_eq(&actual[0]));
        }
    }
}
