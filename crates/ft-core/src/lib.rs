#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
}

impl DType {
    /// Rounds a host value to the precision this dtype can represent.
    #[must_use]
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::F64 => value,
            Self::F32 => f64::from(value as f32),
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::F64 => "float64",
            Self::F32 => "float32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    #[must_use]
    pub const fn all() -> &'static [Device] {
        &[Device::Cpu, Device::Cuda]
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|device| device.label() == label)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(dtype: DType, device: Device) -> Self {
        Self::from_shape(Vec::new(), dtype, device)
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            dtype,
            device,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.device.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorMetaError {
    ValueCountMismatch { shape: Vec<usize>, expected: usize, actual: usize },
    NumelOverflow { shape: Vec<usize> },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueCountMismatch {
                shape,
                expected,
                actual,
            } => write!(
                f,
                "value count mismatch for shape {shape:?}: expected={expected}, actual={actual}"
            ),
            Self::NumelOverflow { shape } => {
                write!(f, "element count overflows usize for shape {shape:?}")
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

/// Contiguous host-resident tensor. Values are stored as `f64` and rounded
/// through the tensor's dtype on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    id: u64,
    meta: TensorMeta,
    values: Vec<f64>,
}

impl DenseTensor {
    pub fn new(
        values: Vec<f64>,
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let expected = checked_numel(&shape)?;
        if values.len() != expected {
            return Err(TensorMetaError::ValueCountMismatch {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self::from_meta(
            TensorMeta::from_shape(shape, dtype, device),
            values,
        ))
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: DType, device: Device) -> Self {
        Self::from_meta(TensorMeta::scalar(dtype, device), vec![value])
    }

    pub fn full(
        shape: Vec<usize>,
        value: f64,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let numel = checked_numel(&shape)?;
        Self::new(vec![value; numel], shape, dtype, device)
    }

    /// Builds a fresh tensor with `self`'s layout and the given values.
    pub fn with_values(&self, values: Vec<f64>) -> Result<Self, TensorMetaError> {
        if values.len() != self.meta.numel() {
            return Err(TensorMetaError::ValueCountMismatch {
                shape: self.meta.shape.clone(),
                expected: self.meta.numel(),
                actual: values.len(),
            });
        }
        Ok(Self::from_meta(self.meta.clone(), values))
    }

    fn from_meta(meta: TensorMeta, mut values: Vec<f64>) -> Self {
        let dtype = meta.dtype();
        for value in &mut values {
            *value = dtype.round(*value);
        }
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            values,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.values.len()
    }

    /// Zero-tolerance equality: identical layout and bit-identical values.
    #[must_use]
    pub fn bitwise_eq(&self, other: &Self) -> bool {
        self.meta == other.meta
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(lhs, rhs)| lhs.to_bits() == rhs.to_bits())
    }

    #[must_use]
    pub fn evidence_fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.meta.fingerprint64().hash(&mut hasher);
        for value in &self.values {
            value.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

pub fn ensure_compatible(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    if lhs.shape() != rhs.shape() {
        return Err(TensorCompatError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }

    Ok(())
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

fn checked_numel(shape: &[usize]) -> Result<usize, TensorMetaError> {
    shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(|| TensorMetaError::NumelOverflow {
            shape: shape.to_vec(),
        })
}
