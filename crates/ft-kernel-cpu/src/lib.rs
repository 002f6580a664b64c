#![forbid(unsafe_code)]

use std::fmt;

use ft_core::{DenseTensor, TensorCompatError, TensorMetaError, ensure_compatible};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    Meta(TensorMetaError),
    NotScalar { shape: Vec<usize> },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::Meta(error) => write!(f, "invalid tensor layout: {error}"),
            Self::NotScalar { shape } => {
                write!(f, "expected a single-element tensor, got shape {shape:?}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

impl From<TensorMetaError> for KernelError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

pub fn add_tensor(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, KernelError> {
    binary_elementwise(lhs, rhs, |a, b| a + b)
}

pub fn mul_tensor(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, KernelError> {
    binary_elementwise(lhs, rhs, |a, b| a * b)
}

pub fn neg_tensor(input: &DenseTensor) -> Result<DenseTensor, KernelError> {
    unary_elementwise(input, |value| -value)
}

pub fn cos_tensor(input: &DenseTensor) -> Result<DenseTensor, KernelError> {
    unary_elementwise(input, f64::cos)
}

pub fn sin_tensor(input: &DenseTensor) -> Result<DenseTensor, KernelError> {
    unary_elementwise(input, f64::sin)
}

/// Reduces every element into a rank-0 tensor, summing in storage order.
pub fn sum_tensor(input: &DenseTensor) -> Result<DenseTensor, KernelError> {
    let total = input.values().iter().fold(0.0, |acc, value| acc + value);
    Ok(DenseTensor::scalar(total, input.dtype(), input.device()))
}

/// Broadcasts a single-element tensor to the layout of `like`.
pub fn expand_scalar_as(scalar: &DenseTensor, like: &DenseTensor) -> Result<DenseTensor, KernelError> {
    if scalar.numel() != 1 {
        return Err(KernelError::NotScalar {
            shape: scalar.shape().to_vec(),
        });
    }
    if scalar.device() != like.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: scalar.device(),
            rhs: like.device(),
        }
        .into());
    }
    Ok(like.with_values(vec![scalar.values()[0]; like.numel()])?)
}

pub fn ones_like(like: &DenseTensor) -> Result<DenseTensor, KernelError> {
    Ok(like.with_values(vec![1.0; like.numel()])?)
}

/// Wraps externally produced uniform samples in `like`'s layout.
pub fn fill_like(like: &DenseTensor, values: Vec<f64>) -> Result<DenseTensor, KernelError> {
    Ok(like.with_values(values)?)
}

fn unary_elementwise(
    input: &DenseTensor,
    op: impl Fn(f64) -> f64,
) -> Result<DenseTensor, KernelError> {
    let values = input.values().iter().copied().map(op).collect();
    Ok(input.with_values(values)?)
}

fn binary_elementwise(
    lhs: &DenseTensor,
    rhs: &DenseTensor,
    op: impl Fn(f64, f64) -> f64,
) -> Result<DenseTensor, KernelError> {
    ensure_compatible(lhs, rhs)?;
    let values = lhs
        .values()
        .iter()
        .zip(rhs.values().iter())
        .map(|(a, b)| op(*a, *b))
        .collect();
    Ok(lhs.with_values(values)?)
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, DenseTensor, Device, TensorCompatError};
    use proptest::prelude::*;

    use super::{
        KernelError, add_tensor, cos_tensor, expand_scalar_as, fill_like, mul_tensor, neg_tensor,
        ones_like, sin_tensor, sum_tensor,
    };

    fn tensor(values: Vec<f64>) -> DenseTensor {
        let len = values.len();
        DenseTensor::new(values, vec![len], DType::F64, Device::Cpu).expect("tensor should build")
    }

    #[test]
    fn elementwise_kernels_compute_expected_values() {
        let lhs = tensor(vec![1.0, 2.0, 3.0]);
        let rhs = tensor(vec![4.0, 5.0, 6.0]);
        assert_eq!(add_tensor(&lhs, &rhs).expect("add").values(), &[5.0, 7.0, 9.0]);
        assert_eq!(mul_tensor(&lhs, &rhs).expect("mul").values(), &[4.0, 10.0, 18.0]);
        assert_eq!(neg_tensor(&lhs).expect("neg").values(), &[-1.0, -2.0, -3.0]);
    }

    #[test]
    fn trig_kernels_match_host_math() {
        let input = tensor(vec![0.0, 0.5]);
        assert_eq!(cos_tensor(&input).expect("cos").values(), &[1.0, 0.5f64.cos()]);
        assert_eq!(sin_tensor(&input).expect("sin").values(), &[0.0, 0.5f64.sin()]);
    }

    #[test]
    fn sum_produces_rank_zero_tensor() {
        let out = sum_tensor(&tensor(vec![1.5, 2.5, 3.0])).expect("sum");
        assert!(out.shape().is_empty());
        assert_eq!(out.values(), &[7.0]);
    }

    #[test]
    fn expand_scalar_fills_like_layout() {
        let like = tensor(vec![0.0; 4]);
        let scalar = DenseTensor::scalar(2.5, DType::F64, Device::Cpu);
        let out = expand_scalar_as(&scalar, &like).expect("expand");
        assert_eq!(out.shape(), like.shape());
        assert_eq!(out.values(), &[2.5; 4]);
    }

    #[test]
    fn expand_rejects_non_scalar_source() {
        let like = tensor(vec![0.0; 4]);
        let err = expand_scalar_as(&tensor(vec![1.0, 2.0]), &like)
            .expect_err("two-element source cannot broadcast");
        assert_eq!(err, KernelError::NotScalar { shape: vec![2] });
    }

    #[test]
    fn binary_kernels_reject_shape_mismatch() {
        let err = mul_tensor(&tensor(vec![1.0]), &tensor(vec![1.0, 2.0]))
            .expect_err("shape mismatch must fail");
        assert!(matches!(
            err,
            KernelError::Incompatible(TensorCompatError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn fill_like_checks_value_count() {
        let like = tensor(vec![0.0; 3]);
        assert!(fill_like(&like, vec![0.25; 2]).is_err());
        assert_eq!(ones_like(&like).expect("ones").values(), &[1.0; 3]);
    }

    proptest! {
        #[test]
        fn prop_mul_is_commutative(values in prop::collection::vec(-100.0f64..100.0, 1..16)) {
            let lhs = tensor(values.clone());
            let rhs = tensor(values.iter().rev().copied().collect());
            let forward = mul_tensor(&lhs, &rhs).expect("mul");
            let backward = mul_tensor(&rhs, &lhs).expect("mul");
            prop_assert!(forward.bitwise_eq(&backward));
        }
    }
}
