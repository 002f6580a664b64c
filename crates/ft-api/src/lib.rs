#![forbid(unsafe_code)]

//! Eager and compiled execution of user computations.
//!
//! A computation is written once against [`Frame`] and can then run eagerly
//! on a [`Session`] (recording an autograd tape) or be captured into graphs by
//! [`aot_function`]. Both paths draw random values from the session's device
//! generator, which the session holds exclusively for its lifetime.

mod aot;
mod frame;
mod function;

use std::collections::BTreeMap;
use std::fmt;

use ft_autograd::{AutogradError, BackwardReport, NodeId, OperationEvent, Tape};
use ft_core::{DType, DenseTensor, Device, TensorMetaError};
use ft_device::{DeviceError, DeviceGuard};
use ft_dispatch::{DispatchError, Op, dispatch};
use ft_graph::GraphError;
use ft_rng::{RngError, RngLease, RngState, lease};
use ft_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};

pub use aot::{CompileError, CompiledFunction, Computation, aot_function, compile};
pub use frame::Frame;
pub use function::{CustomFunction, FunctionCtx};

/// Handle to a tensor inside one frame. Handles are only meaningful in the
/// frame that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub usize);

/// Handle to a generator snapshot taken inside one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateHandle(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    UnknownValue(Value),
    UnknownState(StateHandle),
    Device(DeviceError),
    Autograd(AutogradError),
    Dispatch(DispatchError),
    Graph(GraphError),
    Rng(RngError),
    Meta(TensorMetaError),
    Compile(CompileError),
    CustomFunction { name: String, reason: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownValue(value) => write!(f, "unknown value handle {}", value.0),
            Self::UnknownState(state) => write!(f, "unknown rng state handle {}", state.0),
            Self::Device(error) => write!(f, "device error: {error}"),
            Self::Autograd(error) => write!(f, "autograd error: {error}"),
            Self::Dispatch(error) => write!(f, "dispatch error: {error}"),
            Self::Graph(error) => write!(f, "graph error: {error}"),
            Self::Rng(error) => write!(f, "rng error: {error}"),
            Self::Meta(error) => write!(f, "tensor error: {error}"),
            Self::Compile(error) => write!(f, "compile error: {error}"),
            Self::CustomFunction { name, reason } => write!(f, "{name}: {reason}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<DeviceError> for ApiError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<AutogradError> for ApiError {
    fn from(value: AutogradError) -> Self {
        Self::Autograd(value)
    }
}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<GraphError> for ApiError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<RngError> for ApiError {
    fn from(value: RngError) -> Self {
        Self::Rng(value)
    }
}

impl From<TensorMetaError> for ApiError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

impl From<CompileError> for ApiError {
    fn from(value: CompileError) -> Self {
        Self::Compile(value)
    }
}

/// Eager execution context bound to one device.
///
/// The session owns its device's generator lease, so two sessions on the same
/// device never interleave their random draws. Creating a second session for
/// a device on the same thread while the first is alive blocks forever.
#[derive(Debug)]
pub struct Session {
    device: Device,
    rng: RngLease,
    tape: Tape,
    states: Vec<RngState>,
    grads: BTreeMap<NodeId, DenseTensor>,
    runtime: RuntimeContext,
}

impl Session {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            rng: lease(device),
            tape: Tape::new(),
            states: Vec::new(),
            grads: BTreeMap::new(),
            runtime: RuntimeContext::new(device),
        }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn manual_seed(&mut self, seed: u64) {
        self.rng.manual_seed(seed);
        self.runtime
            .ledger_mut()
            .record(EvidenceKind::Rng, format!("manual_seed device={} seed={seed}", self.device));
    }

    #[must_use]
    pub fn get_rng_state(&self) -> RngState {
        self.rng.snapshot()
    }

    pub fn set_rng_state(&mut self, state: &RngState) -> Result<(), ApiError> {
        self.rng.restore(state)?;
        Ok(())
    }

    /// Registers an existing tensor as a leaf.
    pub fn tensor(&mut self, tensor: DenseTensor, requires_grad: bool) -> Result<Value, ApiError> {
        DeviceGuard::new(self.device).ensure_tensor_device(&tensor)?;
        Ok(Value(self.tape.leaf(tensor, requires_grad).0))
    }

    /// Draws a fresh uniform leaf tensor from the session generator.
    pub fn rand(
        &mut self,
        shape: &[usize],
        dtype: DType,
        requires_grad: bool,
    ) -> Result<Value, ApiError> {
        let numel = shape.iter().product();
        let values = self.rng.uniform(numel);
        let tensor = DenseTensor::new(values, shape.to_vec(), dtype, self.device)?;
        self.tensor(tensor, requires_grad)
    }

    /// Copies a tensor into a new leaf with no history.
    pub fn detach_clone(&mut self, value: Value, requires_grad: bool) -> Result<Value, ApiError> {
        let tensor = self.tensor_of(value)?;
        let copy = tensor.with_values(tensor.values().to_vec())?;
        self.tensor(copy, requires_grad)
    }

    pub fn tensor_of(&self, value: Value) -> Result<&DenseTensor, ApiError> {
        self.tape
            .tensor(NodeId(value.0))
            .map_err(|_| ApiError::UnknownValue(value))
    }

    pub fn requires_grad(&self, value: Value) -> Result<bool, ApiError> {
        self.tape
            .requires_grad(NodeId(value.0))
            .map_err(|_| ApiError::UnknownValue(value))
    }

    /// Runs `computation` eagerly against this session.
    pub fn run<F>(&mut self, computation: &F, inputs: &[Value]) -> Result<Value, ApiError>
    where
        F: Fn(&mut dyn Frame, &[Value]) -> Result<Value, ApiError> + ?Sized,
    {
        let frame: &mut dyn Frame = self;
        computation(frame, inputs)
    }

    /// Back-propagates from a single-element `root` and accumulates the
    /// resulting leaf gradients into the session.
    pub fn backward(&mut self, root: Value) -> Result<BackwardReport, ApiError> {
        let report = self.tape.backward(NodeId(root.0), &mut self.rng)?;
        for (idx, grad) in report.gradients().iter().enumerate() {
            let Some(grad) = grad else {
                continue;
            };
            let node = NodeId(idx);
            let accumulated = match self.grads.remove(&node) {
                Some(existing) => dispatch(Op::Add, &[&existing, grad], false)?.tensor,
                None => grad.clone(),
            };
            self.grads.insert(node, accumulated);
        }
        self.runtime.ledger_mut().record(
            EvidenceKind::Backward,
            format!(
                "root={} backward_steps={} queue_pushes={} queue_pops={} max_queue_len={}",
                root.0,
                report.steps.len(),
                report.telemetry.queue_pushes,
                report.telemetry.queue_pops,
                report.telemetry.max_queue_len
            ),
        );
        Ok(report)
    }

    /// Accumulated gradient of a leaf, if any backward pass reached it.
    #[must_use]
    pub fn grad(&self, value: Value) -> Option<&DenseTensor> {
        self.grads.get(&NodeId(value.0))
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    pub(crate) fn record(&mut self, kind: EvidenceKind, summary: String) {
        self.runtime.ledger_mut().record(kind, summary);
    }

    fn record_operation(&mut self, event: &OperationEvent) {
        let inputs = event
            .inputs
            .iter()
            .map(|input| input.0.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.runtime.ledger_mut().record(
            EvidenceKind::Dispatch,
            format!(
                "op={} inputs=[{inputs}] out={} kernel={} key={:?} backend={:?} keyset=0x{:016x}",
                event.op,
                event.out.0,
                event.decision.kernel,
                event.decision.selected_key,
                event.decision.backend_key,
                event.decision.keyset_bits
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use ft_core::{DType, DenseTensor, Device};
    use ft_device::DeviceError;
    use ft_runtime::EvidenceKind;

    use super::{ApiError, CustomFunction, Frame, FunctionCtx, Session, Value};

    fn vector(values: Vec<f64>, device: Device) -> DenseTensor {
        let len = values.len();
        DenseTensor::new(values, vec![len], DType::F64, device).expect("tensor should build")
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

    #[test]
    fn session_mul_backward_records_evidence() {
        let mut session = Session::new(Device::Cpu);
        let x = session
            .tensor(vector(vec![2.0, 3.0], Device::Cpu), true)
            .expect("leaf");
        let y = session
            .tensor(vector(vec![5.0, 7.0], Device::Cpu), true)
            .expect("leaf");
        let z = session.mul(x, y).expect("mul");
        let total = session.sum(z).expect("sum");
        assert_eq!(session.tensor_of(total).expect("value").values(), &[31.0]);

        session.backward(total).expect("backward");
        assert_eq!(session.grad(x).expect("x grad").values(), &[5.0, 7.0]);
        assert_eq!(session.grad(y).expect("y grad").values(), &[2.0, 3.0]);
        assert!(session.evidence().iter().any(|entry| entry.kind == EvidenceKind::Dispatch));
        assert!(session.evidence().iter().any(|entry| entry.kind == EvidenceKind::Backward));
    }

    #[test]
    fn repeated_backward_accumulates_leaf_gradients() {
        let mut session = Session::new(Device::Cpu);
        let x = session
            .tensor(vector(vec![1.0, 4.0], Device::Cpu), true)
            .expect("leaf");
        for _ in 0..2 {
            let total = session.sum(x).expect("sum");
            session.backward(total).expect("backward");
        }
        assert_eq!(session.grad(x).expect("x grad").values(), &[2.0, 2.0]);
    }

    #[test]
    fn tensor_on_wrong_device_is_rejected() {
        let mut session = Session::new(Device::Cpu);
        let err = session
            .tensor(vector(vec![1.0], Device::Cuda), false)
            .expect_err("cuda tensor in cpu session");
        assert_eq!(
            err,
            ApiError::Device(DeviceError::Mismatch {
                expected: Device::Cpu,
                actual: Device::Cuda
            })
        );
    }

    #[test]
    fn reseeding_reproduces_eager_draws() {
        let mut session = Session::new(Device::Cuda);
        session.manual_seed(11);
        let first = session.rand(&[6], DType::F32, false).expect("rand");
        session.manual_seed(11);
        let second = session.rand(&[6], DType::F32, false).expect("rand");
        let lhs = session.tensor_of(first).expect("first").clone();
        let rhs = session.tensor_of(second).expect("second");
        assert!(lhs.bitwise_eq(rhs));
    }

    #[test]
    fn rng_state_round_trip_in_eager_frame() {
        let mut session = Session::new(Device::Cuda);
        session.manual_seed(3);
        let x = session.rand(&[4], DType::F32, false).expect("rand");
        let state = Frame::get_rng_state(&mut session).expect("snapshot");
        let a = session.rand_like(x).expect("draw");
        Frame::set_rng_state(&mut session, state).expect("restore");
        let b = session.rand_like(x).expect("draw");
        let a = session.tensor_of(a).expect("a").clone();
        assert!(a.bitwise_eq(session.tensor_of(b).expect("b")));
    }

    #[test]
    fn custom_function_draws_in_forward_and_backward() {
        let mut session = Session::new(Device::Cuda);
        session.manual_seed(5);
        let x = session.rand(&[3], DType::F32, true).expect("rand");
        let out = session
            .apply_custom(Rc::new(NoisyScale), &[x])
            .expect("custom forward");
        assert!(session.requires_grad(out).expect("known value"));
        let offset_after_forward = session.get_rng_state().philox().expect("philox").offset;

        let total = session.sum(out).expect("sum");
        let report = session.backward(total).expect("backward");
        let offset_after_backward = session.get_rng_state().philox().expect("philox").offset;

        assert!(offset_after_backward > offset_after_forward);
        assert!(session.grad(x).is_some());
        assert!(
            report
                .steps
                .iter()
                .any(|step| step.rule == "custom:NoisyScale")
        );
    }

    #[test]
    fn detach_clone_copies_values_without_history() {
        let mut session = Session::new(Device::Cpu);
        let x = session
            .tensor(vector(vec![0.5, 1.5], Device::Cpu), true)
            .expect("leaf");
        let y = session.neg(x).expect("neg");
        let copy = session.detach_clone(y, true).expect("clone");
        assert_eq!(session.tensor_of(copy).expect("copy").values(), &[-0.5, -1.5]);

        let total = session.sum(copy).expect("sum");
        session.backward(total).expect("backward");
        assert!(session.grad(x).is_none());
        assert_eq!(session.grad(copy).expect("grad").values(), &[1.0, 1.0]);
    }
}
