use std::fmt;
use std::rc::Rc;

use ft_autograd::GradFn;
use ft_core::{DenseTensor, Device};
use ft_rng::DeviceGenerator;

use crate::frame::DetachedFrame;
use crate::{ApiError, Frame, Value};

/// User-defined differentiable operation.
///
/// `forward` runs without recording history and may stash tensors with
/// [`FunctionCtx::save_for_backward`]; `backward` receives them back in the
/// same order together with the incoming gradient and returns one gradient
/// slot per forward input. Either body may draw random values through the
/// frame.
pub trait CustomFunction: fmt::Debug {
    fn name(&self) -> &str;

    fn forward(
        &self,
        frame: &mut dyn Frame,
        ctx: &mut FunctionCtx,
        inputs: &[Value],
    ) -> Result<Value, ApiError>;

    fn backward(
        &self,
        frame: &mut dyn Frame,
        saved: &[Value],
        grad_output: Value,
    ) -> Result<Vec<Option<Value>>, ApiError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionCtx {
    saved: Vec<Value>,
}

impl FunctionCtx {
    pub fn save_for_backward(&mut self, values: &[Value]) {
        self.saved.extend_from_slice(values);
    }

    #[must_use]
    pub fn saved(&self) -> &[Value] {
        &self.saved
    }
}

/// Tape node for an eagerly applied [`CustomFunction`].
#[derive(Debug)]
pub(crate) struct CustomGradFn {
    function: Rc<dyn CustomFunction>,
    device: Device,
    saved: Vec<DenseTensor>,
}

impl CustomGradFn {
    pub(crate) fn new(
        function: Rc<dyn CustomFunction>,
        device: Device,
        saved: Vec<DenseTensor>,
    ) -> Self {
        Self {
            function,
            device,
            saved,
        }
    }
}

impl GradFn for CustomGradFn {
    fn name(&self) -> &str {
        self.function.name()
    }

    fn apply(
        &self,
        generator: &mut DeviceGenerator,
        grad_output: &DenseTensor,
    ) -> Result<Vec<Option<DenseTensor>>, String> {
        let mut frame = DetachedFrame::new(self.device, generator);
        let saved = self
            .saved
            .iter()
            .map(|tensor| frame.push(tensor.clone()))
            .collect::<Vec<_>>();
        let grad = frame.push(grad_output.clone());
        let grads = self
            .function
            .backward(&mut frame, &saved, grad)
            .map_err(|error| error.to_string())?;
        grads
            .into_iter()
            .map(|slot| slot.map(|value| frame.tensor(value).cloned()).transpose())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| error.to_string())
    }
}
