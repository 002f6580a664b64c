#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;

use ft_core::DenseTensor;
use ft_dispatch::{DispatchDecision, DispatchError, Op, dispatch};
use ft_rng::DeviceGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Backward rule supplied from outside the tape: custom autograd functions
/// and compiled backward graphs.
///
/// `apply` receives the device generator explicitly because a backward rule
/// may itself draw random values, and those draws must come from the same
/// stream the forward pass used.
pub trait GradFn: fmt::Debug {
    fn name(&self) -> &str;

    /// Returns one gradient slot per recorded input.
    fn apply(
        &self,
        generator: &mut DeviceGenerator,
        grad_output: &DenseTensor,
    ) -> Result<Vec<Option<DenseTensor>>, String>;
}

#[derive(Debug, Clone)]
enum NodeOp {
    Leaf,
    Builtin { op: Op, inputs: Vec<NodeId> },
    Custom { inputs: Vec<NodeId>, grad_fn: Rc<dyn GradFn> },
}

impl NodeOp {
    fn inputs(&self) -> &[NodeId] {
        match self {
            Self::Leaf => &[],
            Self::Builtin { inputs, .. } | Self::Custom { inputs, .. } => inputs,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    tensor: DenseTensor,
    requires_grad: bool,
    op: NodeOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub execution_order: Vec<NodeId>,
    pub queue_pushes: usize,
    pub queue_pops: usize,
    pub max_queue_len: usize,
    pub dependency_snapshot: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: NodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.0.cmp(&other.node.0)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    pushes: usize,
    pops: usize,
    max_len: usize,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            pushes: 0,
            pops: 0,
            max_len: 0,
        }
    }

    fn push(&mut self, node: NodeId) {
        self.heap.push(ReadyTask { node });
        self.pushes += 1;
        self.max_len = self.max_len.max(self.heap.len());
    }

    fn pop(&mut self) -> Option<NodeId> {
        let next = self.heap.pop().map(|task| task.node);
        if next.is_some() {
            self.pops += 1;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationEvent {
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub out: NodeId,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardStep {
    pub node: NodeId,
    pub rule: String,
}

#[derive(Debug, Clone)]
pub struct BackwardReport {
    gradients: Vec<Option<DenseTensor>>,
    pub steps: Vec<BackwardStep>,
    pub telemetry: SchedulerTelemetry,
}

impl BackwardReport {
    #[must_use]
    pub fn gradient(&self, node: NodeId) -> Option<&DenseTensor> {
        self.gradients.get(node.0).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn gradients(&self) -> &[Option<DenseTensor>] {
        &self.gradients
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutogradError {
    UnknownNode(NodeId),
    Dispatch(DispatchError),
    DependencyUnderflow { node: NodeId },
    NonScalarRoot { shape: Vec<usize> },
    RootWithoutGrad { node: NodeId },
    GradFn { name: String, reason: String },
    GradFnArity { name: String, expected: usize, actual: usize },
}

impl fmt::Display for AutogradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node id {}", node.0),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
            Self::DependencyUnderflow { node } => {
                write!(f, "dependency scheduler underflow at node {}", node.0)
            }
            Self::NonScalarRoot { shape } => write!(
                f,
                "backward root must hold a single element, got shape {shape:?}"
            ),
            Self::RootWithoutGrad { node } => write!(
                f,
                "node {} does not require grad and has no grad_fn",
                node.0
            ),
            Self::GradFn { name, reason } => write!(f, "{name} backward failed: {reason}"),
            Self::GradFnArity {
                name,
                expected,
                actual,
            } => write!(
                f,
                "{name} backward returned {actual} gradient(s) for {expected} input(s)"
            ),
        }
    }
}

impl std::error::Error for AutogradError {}

impl From<DispatchError> for AutogradError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf(&mut self, tensor: DenseTensor, requires_grad: bool) -> NodeId {
        self.push(Node {
            tensor,
            requires_grad,
            op: NodeOp::Leaf,
        })
    }

    pub fn tensor(&self, node: NodeId) -> Result<&DenseTensor, AutogradError> {
        Ok(&self.node(node)?.tensor)
    }

    pub fn requires_grad(&self, node: NodeId) -> Result<bool, AutogradError> {
        Ok(self.node(node)?.requires_grad)
    }

    pub fn apply(
        &mut self,
        op: Op,
        inputs: &[NodeId],
    ) -> Result<(NodeId, OperationEvent), AutogradError> {
        let (requires_grad, outcome) = {
            let mut tensors = Vec::with_capacity(inputs.len());
            let mut any_grad = false;
            for input in inputs {
                let node = self.node(*input)?;
                any_grad |= node.requires_grad;
                tensors.push(&node.tensor);
            }
            let requires_grad = any_grad && op.is_differentiable();
            (requires_grad, dispatch(op, &tensors, requires_grad)?)
        };

        let out = self.push(Node {
            tensor: outcome.tensor,
            requires_grad,
            op: NodeOp::Builtin {
                op,
                inputs: inputs.to_vec(),
            },
        });

        Ok((
            out,
            OperationEvent {
                op,
                inputs: inputs.to_vec(),
                out,
                decision: outcome.decision,
            },
        ))
    }

    /// Records an output produced outside the tape whose gradient is computed
    /// by `grad_fn`.
    pub fn custom(
        &mut self,
        inputs: &[NodeId],
        output: DenseTensor,
        grad_fn: Rc<dyn GradFn>,
    ) -> Result<NodeId, AutogradError> {
        let mut requires_grad = false;
        for input in inputs {
            requires_grad |= self.node(*input)?.requires_grad;
        }
        if !requires_grad {
            return Ok(self.leaf(output, false));
        }
        Ok(self.push(Node {
            tensor: output,
            requires_grad,
            op: NodeOp::Custom {
                inputs: inputs.to_vec(),
                grad_fn,
            },
        }))
    }

    pub fn backward(
        &self,
        root: NodeId,
        generator: &mut DeviceGenerator,
    ) -> Result<BackwardReport, AutogradError> {
        let root_node = self.node(root)?;
        if root_node.tensor.numel() != 1 {
            return Err(AutogradError::NonScalarRoot {
                shape: root_node.tensor.shape().to_vec(),
            });
        }
        if !root_node.requires_grad {
            return Err(AutogradError::RootWithoutGrad { node: root });
        }

        let reachable = self.compute_reachable(root)?;
        let mut pending = self.compute_dependencies(&reachable);

        let mut grads: Vec<Option<DenseTensor>> = vec![None; self.nodes.len()];
        grads[root.0] = Some(dispatch(Op::OnesLike, &[&root_node.tensor], false)?.tensor);

        let mut queue = ReadyQueue::with_capacity(self.nodes.len().max(1));
        queue.push(root);

        let mut steps = Vec::with_capacity(self.nodes.len());
        let mut execution_order = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = queue.pop() {
            execution_order.push(node_id);
            let node = &self.nodes[node_id.0];
            let inputs = node.op.inputs();

            let (contributions, rule) = match grads[node_id.0].take() {
                None => (vec![None; inputs.len()], "no_incoming_grad".to_string()),
                Some(incoming) => {
                    let contributions = self.input_gradients(node, &incoming, generator)?;
                    let rule = match &node.op {
                        NodeOp::Leaf => "leaf".to_string(),
                        NodeOp::Builtin { op, .. } => builtin_rule(*op).to_string(),
                        NodeOp::Custom { grad_fn, .. } => format!("custom:{}", grad_fn.name()),
                    };
                    if matches!(node.op, NodeOp::Leaf) {
                        grads[node_id.0] = Some(incoming);
                    }
                    (contributions, rule)
                }
            };

            for (input, contribution) in inputs.iter().zip(contributions) {
                if !self.nodes[input.0].requires_grad {
                    continue;
                }
                if let Some(grad) = contribution {
                    grads[input.0] = Some(match grads[input.0].take() {
                        Some(existing) => dispatch(Op::Add, &[&existing, &grad], false)?.tensor,
                        None => grad,
                    });
                }
                Self::complete_dependency(&mut pending, *input, &mut queue)?;
            }

            steps.push(BackwardStep {
                node: node_id,
                rule,
            });
        }

        let gradients = grads
            .into_iter()
            .enumerate()
            .map(|(idx, grad)| {
                let node = &self.nodes[idx];
                if node.requires_grad && matches!(node.op, NodeOp::Leaf) {
                    grad
                } else {
                    None
                }
            })
            .collect();

        Ok(BackwardReport {
            gradients,
            steps,
            telemetry: SchedulerTelemetry {
                execution_order,
                queue_pushes: queue.pushes,
                queue_pops: queue.pops,
                max_queue_len: queue.max_len,
                dependency_snapshot: pending,
            },
        })
    }

    fn input_gradients(
        &self,
        node: &Node,
        incoming: &DenseTensor,
        generator: &mut DeviceGenerator,
    ) -> Result<Vec<Option<DenseTensor>>, AutogradError> {
        match &node.op {
            NodeOp::Leaf => Ok(Vec::new()),
            NodeOp::Builtin { op, inputs } => {
                let operands = inputs
                    .iter()
                    .map(|input| &self.nodes[input.0].tensor)
                    .collect::<Vec<_>>();
                builtin_input_gradients(*op, &operands, incoming)
            }
            NodeOp::Custom { inputs, grad_fn } => {
                let grads = grad_fn
                    .apply(generator, incoming)
                    .map_err(|reason| AutogradError::GradFn {
                        name: grad_fn.name().to_string(),
                        reason,
                    })?;
                if grads.len() != inputs.len() {
                    return Err(AutogradError::GradFnArity {
                        name: grad_fn.name().to_string(),
                        expected: inputs.len(),
                        actual: grads.len(),
                    });
                }
                Ok(grads)
            }
        }
    }

    fn compute_reachable(&self, root: NodeId) -> Result<Vec<bool>, AutogradError> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            if node.0 >= self.nodes.len() {
                return Err(AutogradError::UnknownNode(node));
            }
            if reachable[node.0] || !self.nodes[node.0].requires_grad {
                continue;
            }
            reachable[node.0] = true;
            stack.extend(self.nodes[node.0].op.inputs().iter().copied());
        }

        Ok(reachable)
    }

    fn compute_dependencies(&self, reachable: &[bool]) -> Vec<usize> {
        let mut pending = vec![0usize; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            for input in node.op.inputs() {
                if self.nodes[input.0].requires_grad {
                    pending[input.0] = pending[input.0].saturating_add(1);
                }
            }
        }
        pending
    }

    fn complete_dependency(
        pending: &mut [usize],
        node: NodeId,
        queue: &mut ReadyQueue,
    ) -> Result<(), AutogradError> {
        if pending[node.0] == 0 {
            return Err(AutogradError::DependencyUnderflow { node });
        }
        pending[node.0] -= 1;
        if pending[node.0] == 0 {
            queue.push(node);
        }
        Ok(())
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node, AutogradError> {
        self.nodes.get(id.0).ok_or(AutogradError::UnknownNode(id))
    }
}

/// Vector-Jacobian products of the builtin ops. Graph tracing emits the same
/// op sequence so eager and captured gradients agree bit for bit.
pub fn builtin_input_gradients(
    op: Op,
    operands: &[&DenseTensor],
    grad: &DenseTensor,
) -> Result<Vec<Option<DenseTensor>>, AutogradError> {
    let apply = |op: Op, args: &[&DenseTensor]| -> Result<DenseTensor, AutogradError> {
        Ok(dispatch(op, args, false)?.tensor)
    };
    Ok(match op {
        Op::Add => vec![Some(grad.clone()), Some(grad.clone())],
        Op::Mul => vec![
            Some(apply(Op::Mul, &[grad, operands[1]])?),
            Some(apply(Op::Mul, &[grad, operands[0]])?),
        ],
        Op::Neg => vec![Some(apply(Op::Neg, &[grad])?)],
        Op::Cos => {
            let sin = apply(Op::Sin, &[operands[0]])?;
            let neg_sin = apply(Op::Neg, &[&sin])?;
            vec![Some(apply(Op::Mul, &[grad, &neg_sin])?)]
        }
        Op::Sin => {
            let cos = apply(Op::Cos, &[operands[0]])?;
            vec![Some(apply(Op::Mul, &[grad, &cos])?)]
        }
        Op::Sum => vec![Some(apply(Op::ExpandAs, &[grad, operands[0]])?)],
        Op::ExpandAs => vec![Some(apply(Op::Sum, &[grad])?), None],
        Op::OnesLike => vec![None],
    })
}

fn builtin_rule(op: Op) -> &'static str {
    match op {
        Op::Add => "d(a+b)/da=1; d(a+b)/db=1",
        Op::Mul => "d(a*b)/da=b; d(a*b)/db=a",
        Op::Neg => "d(-a)/da=-1",
        Op::Cos => "d(cos a)/da=-sin a",
        Op::Sin => "d(sin a)/da=cos a",
        Op::Sum => "d(sum a)/da=1",
        Op::ExpandAs => "d(expand s)/ds=sum",
        Op::OnesLike => "non-differentiable",
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use ft_core::{DType, DenseTensor, Device};
    use ft_dispatch::Op;
    use ft_rng::DeviceGenerator;
    use proptest::prelude::*;

    use super::{AutogradError, GradFn, NodeId, Tape};

    fn tensor(values: Vec<f64>) -> DenseTensor {
        let len = values.len();
        DenseTensor::new(values, vec![len], DType::F64, Device::Cpu).expect("tensor should build")
    }

    fn generator() -> DeviceGenerator {
        DeviceGenerator::new(Device::Cpu)
    }

    #[derive(Debug)]
    struct ScaleByNoise;

    impl GradFn for ScaleByNoise {
        fn name(&self) -> &str {
            "ScaleByNoise"
        }

        fn apply(
            &self,
            generator: &mut DeviceGenerator,
            grad_output: &DenseTensor,
        ) -> Result<Vec<Option<DenseTensor>>, String> {
            let noise = generator.uniform(grad_output.numel());
            let values = grad_output
                .values()
                .iter()
                .zip(noise)
                .map(|(grad, noise)| grad * noise)
                .collect();
            let grad = grad_output.with_values(values).map_err(|err| err.to_string())?;
            Ok(vec![Some(grad)])
        }
    }

    #[test]
    fn mul_sum_backward_matches_expected_gradient() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![2.0, 3.0]), true);
        let y = tape.leaf(tensor(vec![5.0, 7.0]), false);
        let (z, event) = tape.apply(Op::Mul, &[x, y]).expect("mul should succeed");
        assert_eq!(event.decision.kernel, "autograd_cpu::mul");
        let (loss, _) = tape.apply(Op::Sum, &[z]).expect("sum should succeed");

        let report = tape
            .backward(loss, &mut generator())
            .expect("backward should succeed");
        assert_eq!(
            report.gradient(x).expect("x grad").values(),
            &[5.0, 7.0]
        );
        assert!(report.gradient(y).is_none());
    }

    #[test]
    fn reused_leaf_accumulates_gradients() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![3.0]), true);
        let (square, _) = tape.apply(Op::Mul, &[x, x]).expect("mul should succeed");
        let (loss, _) = tape.apply(Op::Sum, &[square]).expect("sum should succeed");
        let report = tape
            .backward(loss, &mut generator())
            .expect("backward should succeed");
        assert_eq!(report.gradient(x).expect("x grad").values(), &[6.0]);
    }

    #[test]
    fn cos_backward_uses_negative_sine() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![0.5]), true);
        let (cos, _) = tape.apply(Op::Cos, &[x]).expect("cos should succeed");
        let (loss, _) = tape.apply(Op::Sum, &[cos]).expect("sum should succeed");
        let report = tape
            .backward(loss, &mut generator())
            .expect("backward should succeed");
        assert_eq!(report.gradient(x).expect("x grad").values(), &[-(0.5f64.sin())]);
    }

    #[test]
    fn custom_grad_fn_draws_from_supplied_generator() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![1.0; 4]), true);
        let out = tape
            .custom(&[x], tensor(vec![1.0; 4]), Rc::new(ScaleByNoise))
            .expect("custom node should record");
        let (loss, _) = tape.apply(Op::Sum, &[out]).expect("sum should succeed");

        let mut gen_a = generator();
        gen_a.manual_seed(11);
        let first = tape.backward(loss, &mut gen_a).expect("backward should succeed");

        let mut gen_b = generator();
        gen_b.manual_seed(11);
        let expected = gen_b.uniform(4);

        assert_eq!(first.gradient(x).expect("x grad").values(), expected.as_slice());
        assert!(
            first
                .steps
                .iter()
                .any(|step| step.rule == "custom:ScaleByNoise")
        );
    }

    #[test]
    fn custom_node_without_grad_inputs_is_a_constant() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![1.0]), false);
        let out = tape
            .custom(&[x], tensor(vec![2.0]), Rc::new(ScaleByNoise))
            .expect("custom node should record");
        assert!(!tape.requires_grad(out).expect("node exists"));
    }

    #[test]
    fn backward_rejects_non_scalar_root() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![1.0, 2.0]), true);
        let err = tape
            .backward(x, &mut generator())
            .expect_err("vector root must fail");
        assert_eq!(err, AutogradError::NonScalarRoot { shape: vec![2] });
    }

    #[test]
    fn backward_rejects_root_without_grad() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![1.0]), false);
        let err = tape
            .backward(x, &mut generator())
            .expect_err("constant root must fail");
        assert_eq!(err, AutogradError::RootWithoutGrad { node: x });
    }

    #[test]
    fn unknown_node_is_reported() {
        let tape = Tape::new();
        assert!(matches!(
            tape.tensor(NodeId(3)),
            Err(AutogradError::UnknownNode(NodeId(3)))
        ));
    }

    #[test]
    fn scheduler_visits_nodes_in_reverse_creation_order() {
        let mut tape = Tape::new();
        let x = tape.leaf(tensor(vec![1.0]), true);
        let (a, _) = tape.apply(Op::Sin, &[x]).expect("sin");
        let (b, _) = tape.apply(Op::Cos, &[x]).expect("cos");
        let (c, _) = tape.apply(Op::Add, &[a, b]).expect("add");
        let (loss, _) = tape.apply(Op::Sum, &[c]).expect("sum");
        let report = tape
            .backward(loss, &mut generator())
            .expect("backward should succeed");
        assert_eq!(
            report.telemetry.execution_order,
            vec![loss, c, b, a, x]
        );
        assert!(report.telemetry.dependency_snapshot.iter().all(|&count| count == 0));
        assert_eq!(report.telemetry.queue_pushes, report.telemetry.queue_pops);
    }

    proptest! {
        #[test]
        fn prop_sin_gradient_is_cosine(value in -10.0f64..10.0) {
            let mut tape = Tape::new();
            let x = tape.leaf(tensor(vec![value]), true);
            let (sin, _) = tape.apply(Op::Sin, &[x]).expect("sin");
            let (loss, _) = tape.apply(Op::Sum, &[sin]).expect("sum");
            let report = tape.backward(loss, &mut generator()).expect("backward");
            let grad = report.gradient(x).expect("x grad").values()[0];
            prop_assert_eq!(grad.to_bits(), (1.0 * value.cos()).to_bits());
        }
    }
}
