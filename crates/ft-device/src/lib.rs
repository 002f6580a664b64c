#![forbid(unsafe_code)]

use std::fmt;

use ft_core::{DenseTensor, Device};

/// Minimum accelerator capability the reference accelerator backend accepts.
pub const MIN_ACCELERATOR_CAPABILITY: Capability = Capability { major: 7, minor: 0 };

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    UnknownBackend { id: String },
    InvalidCapability { raw: String },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::UnknownBackend { id } => write!(f, "unknown device backend '{id}'"),
            Self::InvalidCapability { raw } => {
                write!(f, "invalid accelerator capability '{raw}', expected major.minor")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability {
    pub major: u32,
    pub minor: u32,
}

impl Capability {
    pub fn parse(raw: &str) -> Result<Self, DeviceError> {
        let invalid = || DeviceError::InvalidCapability {
            raw: raw.to_string(),
        };
        let (major, minor) = raw.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What the current process can execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEnvironment {
    accelerator: Option<Capability>,
    with_asan: bool,
}

impl DeviceEnvironment {
    #[must_use]
    pub const fn cpu_only() -> Self {
        Self {
            accelerator: None,
            with_asan: false,
        }
    }

    #[must_use]
    pub const fn with_accelerator(capability: Capability) -> Self {
        Self {
            accelerator: Some(capability),
            with_asan: false,
        }
    }

    #[must_use]
    pub const fn asan(mut self, with_asan: bool) -> Self {
        self.with_asan = with_asan;
        self
    }

    /// Reads `FT_CUDA_CAPABILITY` (`major.minor` or `none`, default `8.0`)
    /// and `FT_TEST_WITH_ASAN` (`1` enables).
    pub fn detect() -> Result<Self, DeviceError> {
        let accelerator = match std::env::var("FT_CUDA_CAPABILITY") {
            Ok(raw) if raw.eq_ignore_ascii_case("none") => None,
            Ok(raw) => Some(Capability::parse(&raw)?),
            Err(_) => Some(Capability { major: 8, minor: 0 }),
        };
        let with_asan = std::env::var("FT_TEST_WITH_ASAN").is_ok_and(|value| value == "1");
        Ok(Self {
            accelerator,
            with_asan,
        })
    }

    #[must_use]
    pub fn accelerator(&self) -> Option<Capability> {
        self.accelerator
    }

    #[must_use]
    pub fn with_asan_enabled(&self) -> bool {
        self.with_asan
    }

    #[must_use]
    pub fn is_available(&self, backend: &DeviceBackend) -> bool {
        backend.is_available(self)
    }
}

/// A device identifier plus the predicate deciding whether tests bound to it
/// can run in a given environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBackend {
    device: Device,
    min_capability: Option<Capability>,
    incompatible_with_asan: bool,
}

impl DeviceBackend {
    #[must_use]
    pub const fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            min_capability: None,
            incompatible_with_asan: false,
        }
    }

    #[must_use]
    pub const fn cuda() -> Self {
        Self {
            device: Device::Cuda,
            min_capability: Some(MIN_ACCELERATOR_CAPABILITY),
            incompatible_with_asan: true,
        }
    }

    #[must_use]
    pub fn for_device(device: Device) -> Self {
        match device {
            Device::Cpu => Self::cpu(),
            Device::Cuda => Self::cuda(),
        }
    }

    pub fn parse(id: &str) -> Result<Self, DeviceError> {
        Device::from_label(id)
            .map(Self::for_device)
            .ok_or_else(|| DeviceError::UnknownBackend { id: id.to_string() })
    }

    #[must_use]
    pub fn all() -> Vec<Self> {
        Device::all().iter().copied().map(Self::for_device).collect()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn id(&self) -> &'static str {
        self.device.label()
    }

    #[must_use]
    pub fn requires_accelerator(&self) -> bool {
        self.min_capability.is_some()
    }

    #[must_use]
    pub fn is_available(&self, env: &DeviceEnvironment) -> bool {
        if self.incompatible_with_asan && env.with_asan {
            return false;
        }
        match self.min_capability {
            None => true,
            Some(min) => env.accelerator.is_some_and(|found| found >= min),
        }
    }

    /// Human-readable reason used when a test bound to this backend is skipped.
    #[must_use]
    pub fn unavailable_reason(&self, env: &DeviceEnvironment) -> Option<String> {
        if self.is_available(env) {
            return None;
        }
        if self.incompatible_with_asan && env.with_asan {
            return Some(format!("{} tests are disabled under ASAN", self.id()));
        }
        Some(match (self.min_capability, env.accelerator) {
            (Some(min), Some(found)) => format!(
                "{} requires capability >= {min}, found {found}",
                self.id()
            ),
            _ => format!("{} accelerator not available", self.id()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_tensor_device(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        let actual = tensor.device();
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}
