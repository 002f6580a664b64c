#![forbid(unsafe_code)]

use std::fmt;

use ft_core::{DenseTensor, Device, TensorMeta};
use ft_kernel_cpu::{
    KernelError, add_tensor, cos_tensor, expand_scalar_as, mul_tensor, neg_tensor, ones_like,
    sin_tensor, sum_tensor,
};

/// Deterministic operators every frame, tape and graph node can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Add,
    Mul,
    Neg,
    Cos,
    Sin,
    Sum,
    ExpandAs,
    OnesLike,
}

impl Op {
    #[must_use]
    pub const fn all() -> &'static [Op] {
        &[
            Op::Add,
            Op::Mul,
            Op::Neg,
            Op::Cos,
            Op::Sin,
            Op::Sum,
            Op::ExpandAs,
            Op::OnesLike,
        ]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Neg => "neg",
            Self::Cos => "cos",
            Self::Sin => "sin",
            Self::Sum => "sum",
            Self::ExpandAs => "expand_as",
            Self::OnesLike => "ones_like",
        }
    }

    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Add | Self::Mul | Self::ExpandAs => 2,
            Self::Neg | Self::Cos | Self::Sin | Self::Sum | Self::OnesLike => 1,
        }
    }

    /// Whether gradients flow through this op to its inputs.
    #[must_use]
    pub const fn is_differentiable(self) -> bool {
        !matches!(self, Self::OnesLike)
    }

    /// Output layout for the given input layouts, without touching values.
    pub fn infer_meta(self, inputs: &[&TensorMeta]) -> Result<TensorMeta, DispatchError> {
        check_arity(self, inputs.len())?;
        let first = inputs[0];
        match self {
            Self::Add | Self::Mul => {
                let rhs = inputs[1];
                if first != rhs {
                    return Err(DispatchError::MetaMismatch {
                        op: self,
                        lhs: first.clone(),
                        rhs: rhs.clone(),
                    });
                }
                Ok(first.clone())
            }
            Self::Neg | Self::Cos | Self::Sin | Self::OnesLike => Ok(first.clone()),
            Self::Sum => Ok(TensorMeta::scalar(first.dtype(), first.device())),
            Self::ExpandAs => {
                let like = inputs[1];
                if first.numel() != 1 || first.device() != like.device() {
                    return Err(DispatchError::MetaMismatch {
                        op: self,
                        lhs: first.clone(),
                        rhs: like.clone(),
                    });
                }
                Ok(like.clone())
            }
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    Undefined = 0,
    BackendSelect = 1,
    CPU = 2,
    CUDA = 3,
    AutogradCPU = 4,
    AutogradCUDA = 5,
}

impl DispatchKey {
    #[must_use]
    pub const fn all() -> &'static [DispatchKey] {
        &[
            DispatchKey::BackendSelect,
            DispatchKey::CPU,
            DispatchKey::CUDA,
            DispatchKey::AutogradCPU,
            DispatchKey::AutogradCUDA,
        ]
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    #[must_use]
    pub const fn backend_for(device: Device) -> Self {
        match device {
            Device::Cpu => Self::CPU,
            Device::Cuda => Self::CUDA,
        }
    }

    #[must_use]
    pub const fn autograd_for(device: Device) -> Self {
        match device {
            Device::Cpu => Self::AutogradCPU,
            Device::Cuda => Self::AutogradCUDA,
        }
    }
}

const TYPE_PRIORITY: [DispatchKey; 5] = [
    DispatchKey::AutogradCUDA,
    DispatchKey::AutogradCPU,
    DispatchKey::CUDA,
    DispatchKey::CPU,
    DispatchKey::BackendSelect,
];

const BACKEND_PRIORITY: [DispatchKey; 2] = [DispatchKey::CUDA, DispatchKey::CPU];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    pub fn from_bits_checked(bits: u64) -> Result<Self, DispatchKeyError> {
        let known_mask = DispatchKey::all()
            .iter()
            .fold(0u64, |mask, key| mask | key.bit());
        let unknown = bits & !known_mask;
        if unknown != 0 {
            return Err(DispatchKeyError::UnknownBits {
                unknown_mask: unknown,
            });
        }
        Ok(Self { bits })
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    pub fn remove(&mut self, key: DispatchKey) {
        self.bits &= !key.bit();
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    pub fn highest_priority_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        TYPE_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoTypeKey)
    }

    pub fn highest_priority_backend_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        BACKEND_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoBackendKey)
    }

    pub fn validate(self) -> Result<(), DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        if self.has(DispatchKey::CPU) && self.has(DispatchKey::CUDA) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "operands span CPU and CUDA backends",
            });
        }
        if self.has(DispatchKey::AutogradCPU) && !self.has(DispatchKey::CPU) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "AutogradCPU requires CPU backend availability",
            });
        }
        if self.has(DispatchKey::AutogradCUDA) && !self.has(DispatchKey::CUDA) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "AutogradCUDA requires CUDA backend availability",
            });
        }
        self.highest_priority_type_id()?;
        self.highest_priority_backend_type_id()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyError {
    EmptySet,
    NoTypeKey,
    NoBackendKey,
    UnknownBits { unknown_mask: u64 },
    IncompatibleSet { reason: &'static str },
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySet => write!(f, "dispatch keyset is empty"),
            Self::NoTypeKey => write!(f, "dispatch keyset has no resolvable type key"),
            Self::NoBackendKey => write!(f, "dispatch keyset has no backend key"),
            Self::UnknownBits { unknown_mask } => {
                write!(
                    f,
                    "dispatch keyset has unknown bitmask 0x{unknown_mask:016x}"
                )
            }
            Self::IncompatibleSet { reason } => {
                write!(f, "incompatible dispatch keyset: {reason}")
            }
        }
    }
}

impl std::error::Error for DispatchKeyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: Op,
    pub kernel: &'static str,
    pub selected_key: DispatchKey,
    pub backend_key: DispatchKey,
    pub keyset_bits: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub tensor: DenseTensor,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Kernel(KernelError),
    Key(DispatchKeyError),
    Arity { op: Op, expected: usize, actual: usize },
    MetaMismatch { op: Op, lhs: TensorMeta, rhs: TensorMeta },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::Key(error) => write!(f, "dispatch key failure: {error}"),
            Self::Arity {
                op,
                expected,
                actual,
            } => write!(f, "{op} expects {expected} operand(s), got {actual}"),
            Self::MetaMismatch { op, lhs, rhs } => write!(
                f,
                "{op} cannot combine shape {:?} ({}, {}) with shape {:?} ({}, {})",
                lhs.shape(),
                lhs.dtype().label(),
                lhs.device(),
                rhs.shape(),
                rhs.dtype().label(),
                rhs.device()
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<DispatchKeyError> for DispatchError {
    fn from(value: DispatchKeyError) -> Self {
        Self::Key(value)
    }
}

#[must_use]
pub fn dispatch_keyset_for_tensors(inputs: &[&DenseTensor], requires_grad: bool) -> DispatchKeySet {
    let mut keyset = DispatchKeySet::empty();
    keyset.add(DispatchKey::BackendSelect);
    for tensor in inputs {
        keyset.add(DispatchKey::backend_for(tensor.device()));
        if requires_grad {
            keyset.add(DispatchKey::autograd_for(tensor.device()));
        }
    }
    keyset
}

pub fn dispatch(
    op: Op,
    inputs: &[&DenseTensor],
    requires_grad: bool,
) -> Result<DispatchOutcome, DispatchError> {
    let keyset = dispatch_keyset_for_tensors(inputs, requires_grad);
    dispatch_with_keyset(op, inputs, keyset)
}

pub fn dispatch_with_keyset(
    op: Op,
    inputs: &[&DenseTensor],
    keyset: DispatchKeySet,
) -> Result<DispatchOutcome, DispatchError> {
    check_arity(op, inputs.len())?;
    keyset.validate()?;
    let selected_key = keyset.highest_priority_type_id()?;
    let backend_key = keyset.highest_priority_backend_type_id()?;

    let kernel = match selected_key {
        DispatchKey::AutogradCPU | DispatchKey::CPU if backend_key == DispatchKey::CPU => {
            kernel_name(selected_key, op)
        }
        DispatchKey::AutogradCUDA | DispatchKey::CUDA if backend_key == DispatchKey::CUDA => {
            kernel_name(selected_key, op)
        }
        DispatchKey::BackendSelect => {
            return Err(DispatchKeyError::NoBackendKey.into());
        }
        _ => {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "resolved key/backend key drifted to incompatible pair",
            }
            .into());
        }
    };

    // The accelerator backend is simulated on host memory, so both backends
    // share the host kernels.
    let tensor = match op {
        Op::Add => add_tensor(inputs[0], inputs[1])?,
        Op::Mul => mul_tensor(inputs[0], inputs[1])?,
        Op::Neg => neg_tensor(inputs[0])?,
        Op::Cos => cos_tensor(inputs[0])?,
        Op::Sin => sin_tensor(inputs[0])?,
        Op::Sum => sum_tensor(inputs[0])?,
        Op::ExpandAs => expand_scalar_as(inputs[0], inputs[1])?,
        Op::OnesLike => ones_like(inputs[0])?,
    };

    Ok(DispatchOutcome {
        tensor,
        decision: DispatchDecision {
            op,
            kernel,
            selected_key,
            backend_key,
            keyset_bits: keyset.bits(),
        },
    })
}

fn check_arity(op: Op, actual: usize) -> Result<(), DispatchError> {
    if actual != op.arity() {
        return Err(DispatchError::Arity {
            op,
            expected: op.arity(),
            actual,
        });
    }
    Ok(())
}

fn kernel_name(key: DispatchKey, op: Op) -> &'static str {
    match (key, op) {
        (DispatchKey::AutogradCPU, Op::Add) => "autograd_cpu::add",
        (DispatchKey::AutogradCPU, Op::Mul) => "autograd_cpu::mul",
        (DispatchKey::AutogradCPU, Op::Neg) => "autograd_cpu::neg",
        (DispatchKey::AutogradCPU, Op::Cos) => "autograd_cpu::cos",
        (DispatchKey::AutogradCPU, Op::Sin) => "autograd_cpu::sin",
        (DispatchKey::AutogradCPU, Op::Sum) => "autograd_cpu::sum",
        (DispatchKey::AutogradCPU, Op::ExpandAs) => "autograd_cpu::expand_as",
        (DispatchKey::AutogradCPU, Op::OnesLike) => "autograd_cpu::ones_like",
        (DispatchKey::AutogradCUDA, Op::Add) => "autograd_cuda::add",
        (DispatchKey::AutogradCUDA, Op::Mul) => "autograd_cuda::mul",
        (DispatchKey::AutogradCUDA, Op::Neg) => "autograd_cuda::neg",
        (DispatchKey::AutogradCUDA, Op::Cos) => "autograd_cuda::cos",
        (DispatchKey::AutogradCUDA, Op::Sin) => "autograd_cuda::sin",
        (DispatchKey::AutogradCUDA, Op::Sum) => "autograd_cuda::sum",
        (DispatchKey::AutogradCUDA, Op::ExpandAs) => "autograd_cuda::expand_as",
        (DispatchKey::AutogradCUDA, Op::OnesLike) => "autograd_cuda::ones_like",
        (DispatchKey::CUDA, Op::Add) => "cuda::add",
        (DispatchKey::CUDA, Op::Mul) => "cuda::mul",
        (DispatchKey::CUDA, Op::Neg) => "cuda::neg",
        (DispatchKey::CUDA, Op::Cos) => "cuda::cos",
        (DispatchKey::CUDA, Op::Sin) => "cuda::sin",
        (DispatchKey::CUDA, Op::Sum) => "cuda::sum",
        (DispatchKey::CUDA, Op::ExpandAs) => "cuda::expand_as",
        (DispatchKey::CUDA, Op::OnesLike) => "cuda::ones_like",
        (_, Op::Add) => "cpu::add",
        (_, Op::Mul) => "cpu::mul",
        (_, Op::Neg) => "cpu::neg",
        (_, Op::Cos) => "cpu::cos",
        (_, Op::Sin) => "cpu::sin",
        (_, Op::Sum) => "cpu::sum",
        (_, Op::ExpandAs) => "cpu::expand_as",
        (_, Op::OnesLike) => "cpu::ones_like",
    }
}
