#![forbid(unsafe_code)]

//! Device-scoped random number generation.
//!
//! Accelerator streams use a counter-based Philox4x32-10 generator whose whole
//! state is a `(seed, offset)` pair, so any draw can be replayed as a pure
//! function of that pair. Host streams use an opaque `StdRng` and cannot be
//! functionalized.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};

use ft_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed every generator starts from before the first `manual_seed`.
pub const DEFAULT_SEED: u64 = 67_280_421_310_721;

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;
const PHILOX_ROUNDS: usize = 10;
const PHILOX_LANES: u64 = 4;
const UNIFORM_BITS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RngError {
    DeviceMismatch { expected: Device, actual: Device },
    KindMismatch { expected: GeneratorKind, actual: GeneratorKind },
    FunctionalizationUnsupported { device: Device },
}

impl fmt::Display for RngError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceMismatch { expected, actual } => write!(
                f,
                "rng state belongs to device {actual:?}, generator is {expected:?}"
            ),
            Self::KindMismatch { expected, actual } => write!(
                f,
                "rng state kind {actual:?} cannot restore a {expected:?} generator"
            ),
            Self::FunctionalizationUnsupported { device } => write!(
                f,
                "device {device:?} has no counter-based generator; rng ops cannot be functionalized"
            ),
        }
    }
}

impl std::error::Error for RngError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    Philox,
    Host,
}

impl GeneratorKind {
    #[must_use]
    pub const fn for_device(device: Device) -> Self {
        match device {
            Device::Cuda => Self::Philox,
            Device::Cpu => Self::Host,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhiloxState {
    pub seed: u64,
    pub offset: u64,
}

#[derive(Debug, Clone)]
enum Engine {
    Philox(PhiloxState),
    Host { seed: u64, rng: Box<StdRng> },
}

impl Engine {
    fn seeded(kind: GeneratorKind, seed: u64) -> Self {
        match kind {
            GeneratorKind::Philox => Self::Philox(PhiloxState { seed, offset: 0 }),
            GeneratorKind::Host => Self::Host {
                seed,
                rng: Box::new(StdRng::seed_from_u64(seed)),
            },
        }
    }

    fn kind(&self) -> GeneratorKind {
        match self {
            Self::Philox(_) => GeneratorKind::Philox,
            Self::Host { .. } => GeneratorKind::Host,
        }
    }
}

/// Snapshot of one device's generator, restorable only on that device.
#[derive(Debug, Clone)]
pub struct RngState {
    device: Device,
    engine: Engine,
}

impl RngState {
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn kind(&self) -> GeneratorKind {
        self.engine.kind()
    }

    #[must_use]
    pub fn philox(&self) -> Option<PhiloxState> {
        match &self.engine {
            Engine::Philox(state) => Some(*state),
            Engine::Host { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceGenerator {
    device: Device,
    engine: Engine,
}

impl DeviceGenerator {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            engine: Engine::seeded(GeneratorKind::for_device(device), DEFAULT_SEED),
        }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn kind(&self) -> GeneratorKind {
        self.engine.kind()
    }

    #[must_use]
    pub fn supports_functionalization(&self) -> bool {
        self.kind() == GeneratorKind::Philox
    }

    pub fn manual_seed(&mut self, seed: u64) {
        self.engine = Engine::seeded(self.kind(), seed);
    }

    /// Draws `numel` uniform values in `[0, 1)` and advances the stream.
    pub fn uniform(&mut self, numel: usize) -> Vec<f64> {
        match &mut self.engine {
            Engine::Philox(state) => {
                let values = philox_uniform(state.seed, state.offset, numel);
                state.offset = state.offset.wrapping_add(philox_increment(numel));
                values
            }
            Engine::Host { rng, .. } => (0..numel)
                .map(|_| bits_to_unit(rng.r#gen::<u32>()))
                .collect(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> RngState {
        RngState {
            device: self.device,
            engine: self.engine.clone(),
        }
    }

    pub fn restore(&mut self, state: &RngState) -> Result<(), RngError> {
        if state.device != self.device {
            return Err(RngError::DeviceMismatch {
                expected: self.device,
                actual: state.device,
            });
        }
        if state.kind() != self.kind() {
            return Err(RngError::KindMismatch {
                expected: self.kind(),
                actual: state.kind(),
            });
        }
        self.engine = state.engine.clone();
        Ok(())
    }

    pub fn philox_state(&self) -> Result<PhiloxState, RngError> {
        match &self.engine {
            Engine::Philox(state) => Ok(*state),
            Engine::Host { .. } => Err(RngError::FunctionalizationUnsupported {
                device: self.device,
            }),
        }
    }

    /// Moves the Philox offset to where a functional execution left it.
    pub fn set_philox_offset(&mut self, offset: u64) -> Result<(), RngError> {
        match &mut self.engine {
            Engine::Philox(state) => {
                state.offset = offset;
                Ok(())
            }
            Engine::Host { .. } => Err(RngError::FunctionalizationUnsupported {
                device: self.device,
            }),
        }
    }
}

/// Offset consumed by a draw of `numel` values; whole Philox blocks only.
#[must_use]
pub fn philox_increment(numel: usize) -> u64 {
    let numel = numel as u64;
    numel.div_ceil(PHILOX_LANES) * PHILOX_LANES
}

/// Pure counterpart of a stateful draw: the values a Philox generator at
/// `(seed, offset)` would produce for `numel` elements.
#[must_use]
pub fn philox_uniform(seed: u64, offset: u64, numel: usize) -> Vec<f64> {
    let key = [seed as u32, (seed >> 32) as u32];
    let mut out = Vec::with_capacity(numel);
    let mut block_index = offset / PHILOX_LANES;
    let mut lane = (offset % PHILOX_LANES) as usize;
    while out.len() < numel {
        let counter = [block_index as u32, (block_index >> 32) as u32, 0, 0];
        let block = philox4x32_10(counter, key);
        for bits in block.iter().skip(lane) {
            if out.len() == numel {
                break;
            }
            out.push(bits_to_unit(*bits));
        }
        lane = 0;
        block_index = block_index.wrapping_add(1);
    }
    out
}

#[must_use]
pub fn philox4x32_10(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut ctr = counter;
    let mut key = key;
    for round in 0..PHILOX_ROUNDS {
        if round > 0 {
            key = [key[0].wrapping_add(PHILOX_W0), key[1].wrapping_add(PHILOX_W1)];
        }
        ctr = philox_round(ctr, key);
    }
    ctr
}

fn philox_round(ctr: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let prod0 = u64::from(PHILOX_M0) * u64::from(ctr[0]);
    let prod1 = u64::from(PHILOX_M1) * u64::from(ctr[2]);
    let (hi0, lo0) = ((prod0 >> 32) as u32, prod0 as u32);
    let (hi1, lo1) = ((prod1 >> 32) as u32, prod1 as u32);
    [hi1 ^ ctr[1] ^ key[0], lo1, hi0 ^ ctr[3] ^ key[1], lo0]
}

fn bits_to_unit(bits: u32) -> f64 {
    f64::from(bits >> (32 - UNIFORM_BITS)) / f64::from(1u32 << UNIFORM_BITS)
}

static HUB: OnceLock<Vec<Mutex<DeviceGenerator>>> = OnceLock::new();

fn hub_slot(device: Device) -> &'static Mutex<DeviceGenerator> {
    let slots = HUB.get_or_init(|| {
        Device::all()
            .iter()
            .map(|device| Mutex::new(DeviceGenerator::new(*device)))
            .collect()
    });
    let index = Device::all()
        .iter()
        .position(|candidate| *candidate == device)
        .unwrap_or(0);
    &slots[index]
}

/// Exclusive access to a device's process-wide generator. Holding a lease
/// serializes every other user of the same device stream.
#[derive(Debug)]
pub struct RngLease {
    guard: MutexGuard<'static, DeviceGenerator>,
}

impl Deref for RngLease {
    type Target = DeviceGenerator;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for RngLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Blocks until the device stream is free.
#[must_use]
pub fn lease(device: Device) -> RngLease {
    let guard = match hub_slot(device).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    RngLease { guard }
}

#[must_use]
pub fn try_lease(device: Device) -> Option<RngLease> {
    match hub_slot(device).try_lock() {
        Ok(guard) => Some(RngLease { guard }),
        Err(TryLockError::Poisoned(poisoned)) => Some(RngLease {
            guard: poisoned.into_inner(),
        }),
        Err(TryLockError::WouldBlock) => None,
    }
}
