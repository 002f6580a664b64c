//! Compiler configuration store addressed by `(scope, key)`.
//!
//! Values are typed and every known key has a default. The store is per
//! thread: a patch applied by one test never leaks into a test running on
//! another thread.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
}

impl ConfigValue {
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
        }
    }

    #[must_use]
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::Int(_) => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    pub scope: &'static str,
    pub key: &'static str,
}

impl ConfigKey {
    #[must_use]
    pub const fn new(scope: &'static str, key: &'static str) -> Self {
        Self { scope, key }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scope, self.key)
    }
}

pub const DYNAMIC_SHAPES: ConfigKey = ConfigKey::new("dynamo", "dynamic_shapes");
pub const FUNCTIONALIZE_RNG_OPS: ConfigKey = ConfigKey::new("functorch", "functionalize_rng_ops");
pub const INDUCTOR_DEBUG: ConfigKey = ConfigKey::new("inductor", "debug");
pub const CPP_WRAPPER: ConfigKey = ConfigKey::new("inductor", "cpp_wrapper");
pub const CPP_MIN_CHUNK_SIZE: ConfigKey = ConfigKey::new("inductor", "cpp.min_chunk_size");
pub const AUTOTUNE_POINTWISE: ConfigKey = ConfigKey::new("inductor", "triton.autotune_pointwise");
pub const IMPLICIT_FALLBACKS: ConfigKey = ConfigKey::new("inductor", "implicit_fallbacks");

const DEFAULTS: [(ConfigKey, ConfigValue); 7] = [
    (DYNAMIC_SHAPES, ConfigValue::Bool(false)),
    (FUNCTIONALIZE_RNG_OPS, ConfigValue::Bool(false)),
    (INDUCTOR_DEBUG, ConfigValue::Bool(false)),
    (CPP_WRAPPER, ConfigValue::Bool(false)),
    (CPP_MIN_CHUNK_SIZE, ConfigValue::Int(4096)),
    (AUTOTUNE_POINTWISE, ConfigValue::Bool(true)),
    (IMPLICIT_FALLBACKS, ConfigValue::Bool(true)),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownKey {
        scope: String,
        key: String,
    },
    TypeMismatch {
        scope: String,
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey { scope, key } => {
                write!(f, "config scope '{scope}' has no key '{key}'")
            }
            Self::TypeMismatch {
                scope,
                key,
                expected,
                actual,
            } => write!(
                f,
                "config {scope}.{key} holds {expected} values, got {actual}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

thread_local! {
    static STORE: RefCell<BTreeMap<ConfigKey, ConfigValue>> =
        RefCell::new(DEFAULTS.into_iter().collect());
}

fn resolve(scope: &str, key: &str) -> Result<(ConfigKey, ConfigValue), ConfigError> {
    DEFAULTS
        .iter()
        .find(|(known, _)| known.scope == scope && known.key == key)
        .copied()
        .ok_or_else(|| ConfigError::UnknownKey {
            scope: scope.to_string(),
            key: key.to_string(),
        })
}

pub fn get(scope: &str, key: &str) -> Result<ConfigValue, ConfigError> {
    let (known, default) = resolve(scope, key)?;
    Ok(STORE.with(|store| store.borrow().get(&known).copied().unwrap_or(default)))
}

pub fn get_bool(scope: &str, key: &str) -> Result<bool, ConfigError> {
    let value = get(scope, key)?;
    value.as_bool().ok_or_else(|| ConfigError::TypeMismatch {
        scope: scope.to_string(),
        key: key.to_string(),
        expected: "bool",
        actual: value.type_name(),
    })
}

/// Reads a known boolean key; unknown keys read as `false`.
#[must_use]
pub fn flag(key: ConfigKey) -> bool {
    get_bool(key.scope, key.key).unwrap_or(false)
}

/// Overwrites a value and returns the previous one.
pub fn set(scope: &str, key: &str, value: ConfigValue) -> Result<ConfigValue, ConfigError> {
    let (known, default) = resolve(scope, key)?;
    if default.type_name() != value.type_name() {
        return Err(ConfigError::TypeMismatch {
            scope: scope.to_string(),
            key: key.to_string(),
            expected: default.type_name(),
            actual: value.type_name(),
        });
    }
    Ok(STORE.with(|store| {
        store
            .borrow_mut()
            .insert(known, value)
            .unwrap_or(default)
    }))
}

/// Restores every key on this thread to its default.
pub fn reset() {
    STORE.with(|store| *store.borrow_mut() = DEFAULTS.into_iter().collect());
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    pub scope: String,
    pub key: String,
    pub value: ConfigValue,
}

impl ConfigPatch {
    #[must_use]
    pub fn new(scope: impl Into<String>, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn for_key(key: ConfigKey, value: impl Into<ConfigValue>) -> Self {
        Self::new(key.scope, key.key, value)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (_, default) = resolve(&self.scope, &self.key)?;
        if default.type_name() != self.value.type_name() {
            return Err(ConfigError::TypeMismatch {
                scope: self.scope.clone(),
                key: self.key.clone(),
                expected: default.type_name(),
                actual: self.value.type_name(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ConfigPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.scope, self.key, self.value)
    }
}

/// Reverts the patched keys to their prior values when dropped, including
/// during unwinding.
#[derive(Debug)]
#[must_use = "the patch is reverted as soon as the guard is dropped"]
pub struct ConfigPatchGuard {
    previous: Vec<(ConfigKey, ConfigValue)>,
}

impl Drop for ConfigPatchGuard {
    fn drop(&mut self) {
        STORE.with(|store| {
            let mut store = store.borrow_mut();
            for (key, value) in self.previous.drain(..).rev() {
                store.insert(key, value);
            }
        });
    }
}

pub fn patch(patch: &ConfigPatch) -> Result<ConfigPatchGuard, ConfigError> {
    patch_all(std::slice::from_ref(patch))
}

/// Applies every patch or none of them.
pub fn patch_all(patches: &[ConfigPatch]) -> Result<ConfigPatchGuard, ConfigError> {
    for patch in patches {
        patch.validate()?;
    }
    let mut previous = Vec::with_capacity(patches.len());
    for patch in patches {
        let (known, _) = resolve(&patch.scope, &patch.key)?;
        let prior = set(&patch.scope, &patch.key, patch.value)?;
        previous.push((known, prior));
    }
    Ok(ConfigPatchGuard { previous })
}
