use std::rc::Rc;

use ft_autograd::NodeId;
use ft_core::{DenseTensor, Device, TensorMeta};
use ft_dispatch::{Op, dispatch};
use ft_rng::{DeviceGenerator, RngState};
use ft_runtime::EvidenceKind;

use crate::function::{CustomGradFn, FunctionCtx};
use crate::{ApiError, CustomFunction, Session, StateHandle, Value};

/// Execution surface a computation is written against.
///
/// The same computation runs eagerly on a [`Session`], without history inside
/// custom backward rules, and symbolically while a compiled function traces
/// it.
pub trait Frame {
    fn device(&self) -> Device;

    fn meta(&self, value: Value) -> Result<TensorMeta, ApiError>;

    fn apply(&mut self, op: Op, args: &[Value]) -> Result<Value, ApiError>;

    /// Uniform `[0, 1)` values shaped like `like`, drawn from the device stream.
    fn rand_like(&mut self, like: Value) -> Result<Value, ApiError>;

    fn get_rng_state(&mut self) -> Result<StateHandle, ApiError>;

    fn set_rng_state(&mut self, state: StateHandle) -> Result<(), ApiError>;

    fn apply_custom(
        &mut self,
        function: Rc<dyn CustomFunction>,
        inputs: &[Value],
    ) -> Result<Value, ApiError>;

    fn add(&mut self, lhs: Value, rhs: Value) -> Result<Value, ApiError> {
        self.apply(Op::Add, &[lhs, rhs])
    }

    fn mul(&mut self, lhs: Value, rhs: Value) -> Result<Value, ApiError> {
        self.apply(Op::Mul, &[lhs, rhs])
    }

    fn neg(&mut self, input: Value) -> Result<Value, ApiError> {
        self.apply(Op::Neg, &[input])
    }

    fn cos(&mut self, input: Value) -> Result<Value, ApiError> {
        self.apply(Op::Cos, &[input])
    }

    fn sin(&mut self, input: Value) -> Result<Value, ApiError> {
        self.apply(Op::Sin, &[input])
    }

    fn sum(&mut self, input: Value) -> Result<Value, ApiError> {
        self.apply(Op::Sum, &[input])
    }

    fn expand_as(&mut self, scalar: Value, like: Value) -> Result<Value, ApiError> {
        self.apply(Op::ExpandAs, &[scalar, like])
    }

    fn ones_like(&mut self, like: Value) -> Result<Value, ApiError> {
        self.apply(Op::OnesLike, &[like])
    }
}

impl Frame for Session {
    fn device(&self) -> Device {
        self.device
    }

    fn meta(&self, value: Value) -> Result<TensorMeta, ApiError> {
        Ok(self.tensor_of(value)?.meta().clone())
    }

    fn apply(&mut self, op: Op, args: &[Value]) -> Result<Value, ApiError> {
        let inputs = args.iter().map(|arg| NodeId(arg.0)).collect::<Vec<_>>();
        let (out, event) = self.tape.apply(op, &inputs)?;
        self.record_operation(&event);
        Ok(Value(out.0))
    }

    fn rand_like(&mut self, like: Value) -> Result<Value, ApiError> {
        let like = self.tensor_of(like)?.clone();
        let values = self.rng.uniform(like.numel());
        let tensor = like.with_values(values)?;
        self.record(
            EvidenceKind::Rng,
            format!("rand_like device={} numel={}", self.device, tensor.numel()),
        );
        Ok(Value(self.tape.leaf(tensor, false).0))
    }

    fn get_rng_state(&mut self) -> Result<StateHandle, ApiError> {
        self.states.push(self.rng.snapshot());
        Ok(StateHandle(self.states.len() - 1))
    }

    fn set_rng_state(&mut self, state: StateHandle) -> Result<(), ApiError> {
        let snapshot = self
            .states
            .get(state.0)
            .ok_or(ApiError::UnknownState(state))?;
        self.rng.restore(snapshot)?;
        Ok(())
    }

    fn apply_custom(
        &mut self,
        function: Rc<dyn CustomFunction>,
        inputs: &[Value],
    ) -> Result<Value, ApiError> {
        let nodes = inputs.iter().map(|input| NodeId(input.0)).collect::<Vec<_>>();
        let mut operands = Vec::with_capacity(inputs.len());
        for input in inputs {
            operands.push(self.tensor_of(*input)?.clone());
        }

        let (output, saved) = {
            let mut frame = DetachedFrame::new(self.device, &mut self.rng);
            let locals = operands
                .into_iter()
                .map(|tensor| frame.push(tensor))
                .collect::<Vec<_>>();
            let mut ctx = FunctionCtx::default();
            let out = function.forward(&mut frame, &mut ctx, &locals)?;
            let saved = ctx
                .saved()
                .iter()
                .map(|value| frame.tensor(*value).cloned())
                .collect::<Result<Vec<_>, _>>()?;
            (frame.tensor(out)?.clone(), saved)
        };

        let name = function.name().to_string();
        let grad_fn = CustomGradFn::new(function, self.device, saved);
        let out = self.tape.custom(&nodes, output, Rc::new(grad_fn))?;
        self.record(
            EvidenceKind::Dispatch,
            format!("custom={name} inputs={} out={}", inputs.len(), out.0),
        );
        Ok(Value(out.0))
    }
}

/// Runs ops directly on tensors without recording history. Used for the
/// forward and backward bodies of custom functions.
#[derive(Debug)]
pub(crate) struct DetachedFrame<'g> {
    device: Device,
    generator: &'g mut DeviceGenerator,
    values: Vec<DenseTensor>,
    states: Vec<RngState>,
}

impl<'g> DetachedFrame<'g> {
    pub(crate) fn new(device: Device, generator: &'g mut DeviceGenerator) -> Self {
        Self {
            device,
            generator,
            values: Vec::new(),
            states: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, tensor: DenseTensor) -> Value {
        self.values.push(tensor);
        Value(self.values.len() - 1)
    }

    pub(crate) fn tensor(&self, value: Value) -> Result<&DenseTensor, ApiError> {
        self.values
            .get(value.0)
            .ok_or(ApiError::UnknownValue(value))
    }
}

impl Frame for DetachedFrame<'_> {
    fn device(&self) -> Device {
        self.device
    }

    fn meta(&self, value: Value) -> Result<TensorMeta, ApiError> {
        Ok(self.tensor(value)?.meta().clone())
    }

    fn apply(&mut self, op: Op, args: &[Value]) -> Result<Value, ApiError> {
        let tensors = args
            .iter()
            .map(|arg| self.tensor(*arg))
            .collect::<Result<Vec<_>, _>>()?;
        let out = dispatch(op, &tensors, false)?.tensor;
        Ok(self.push(out))
    }

    fn rand_like(&mut self, like: Value) -> Result<Value, ApiError> {
        let like = self
            .values
            .get(like.0)
            .ok_or(ApiError::UnknownValue(like))?;
        let values = self.generator.uniform(like.numel());
        let tensor = like.with_values(values)?;
        Ok(self.push(tensor))
    }

    fn get_rng_state(&mut self) -> Result<StateHandle, ApiError> {
        self.states.push(self.generator.snapshot());
        Ok(StateHandle(self.states.len() - 1))
    }

    fn set_rng_state(&mut self, state: StateHandle) -> Result<(), ApiError> {
        let snapshot = self
            .states
            .get(state.0)
            .ok_or(ApiError::UnknownState(state))?;
        self.generator.restore(snapshot)?;
        Ok(())
    }

    fn apply_custom(
        &mut self,
        function: Rc<dyn CustomFunction>,
        inputs: &[Value],
    ) -> Result<Value, ApiError> {
        let mut ctx = FunctionCtx::default();
        function.forward(self, &mut ctx, inputs)
    }
}
