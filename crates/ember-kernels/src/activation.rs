//! Activation registry.
//!
//! Maps layer-config activation names onto a closed set of kernel variants
//! and evaluates them on scalars. Device kernels receive the variant as
//! [`ActivationKind::code`].

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{BackendError, Result};

/// Default negative slope of the leaky ReLU.
pub const DEFAULT_LEAKY_SLOPE: f32 = 0.1;

const SELU_LAMBDA: f32 = 1.0507;
const SELU_ALPHA: f32 = 1.6732;
const LHTAN_SLOPE: f32 = 0.001;

/// Activation functions known to the per-element kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// Piecewise-linear tanh-like saturation with a shallow tail.
    LinearPiecewiseHyperbolic,
    HardTanh,
    Linear,
    Logistic,
    Relu,
    Elu,
    Selu,
    LeakyRelu,
    Tanh,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 9] = [
        ActivationKind::LinearPiecewiseHyperbolic,
        ActivationKind::HardTanh,
        ActivationKind::Linear,
        ActivationKind::Logistic,
        ActivationKind::Relu,
        ActivationKind::Elu,
        ActivationKind::Selu,
        ActivationKind::LeakyRelu,
        ActivationKind::Tanh,
    ];

    /// Canonical config name.
    pub fn name(self) -> &'static str {
        match self {
            ActivationKind::LinearPiecewiseHyperbolic => "lhtan",
            ActivationKind::HardTanh => "hardtan",
            ActivationKind::Linear => "linear",
            ActivationKind::Logistic => "logistic",
            ActivationKind::Relu => "relu",
            ActivationKind::Elu => "elu",
            ActivationKind::Selu => "selu",
            ActivationKind::LeakyRelu => "leaky",
            ActivationKind::Tanh => "tanh",
        }
    }

    /// Integer code understood by the device activation kernel.
    pub fn code(self) -> i32 {
        match self {
            ActivationKind::LinearPiecewiseHyperbolic => 0,
            ActivationKind::HardTanh => 1,
            ActivationKind::Linear => 2,
            ActivationKind::Logistic => 3,
            ActivationKind::Relu => 4,
            ActivationKind::Elu => 5,
            ActivationKind::Selu => 6,
            ActivationKind::LeakyRelu => 7,
            ActivationKind::Tanh => 8,
        }
    }

    /// Apply the activation to `x` with the default leaky slope.
    pub fn activate(self, x: f32) -> f32 {
        self.activate_with_slope(x, DEFAULT_LEAKY_SLOPE)
    }

    /// Apply the activation to `x`; `leaky_slope` only affects `LeakyRelu`.
    pub fn activate_with_slope(self, x: f32, leaky_slope: f32) -> f32 {
        match self {
            ActivationKind::LinearPiecewiseHyperbolic => {
                if x < 0.0 {
                    LHTAN_SLOPE * x
                } else if x > 1.0 {
                    LHTAN_SLOPE * (x - 1.0) + 1.0
                } else {
                    x
                }
            }
            ActivationKind::HardTanh => x.clamp(-1.0, 1.0),
            ActivationKind::Linear => x,
            ActivationKind::Logistic => 1.0 / (1.0 + (-x).exp()),
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::Elu => {
                if x >= 0.0 {
                    x
                } else {
                    x.exp_m1()
                }
            }
            ActivationKind::Selu => {
                if x >= 0.0 {
                    SELU_LAMBDA * x
                } else {
                    SELU_LAMBDA * SELU_ALPHA * x.exp_m1()
                }
            }
            ActivationKind::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    leaky_slope * x
                }
            }
            ActivationKind::Tanh => x.tanh(),
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name table of the standard registry.
pub const STANDARD_NAMES: [(&str, ActivationKind); 9] = [
    ("lhtan", ActivationKind::LinearPiecewiseHyperbolic),
    ("hardtan", ActivationKind::HardTanh),
    ("linear", ActivationKind::Linear),
    ("logistic", ActivationKind::Logistic),
    ("relu", ActivationKind::Relu),
    ("elu", ActivationKind::Elu),
    ("selu", ActivationKind::Selu),
    ("leaky", ActivationKind::LeakyRelu),
    ("tanh", ActivationKind::Tanh),
];

/// Case-sensitive name → [`ActivationKind`] lookup with a ReLU fallback.
#[derive(Debug, Clone)]
pub struct ActivationRegistry {
    by_name: HashMap<String, ActivationKind>,
    leaky_slope: f32,
}

impl ActivationRegistry {
    /// Build a registry from a name table. Duplicate names are rejected.
    pub fn from_table<'a, I>(table: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, ActivationKind)>,
    {
        let mut by_name = HashMap::new();
        for (name, kind) in table {
            if by_name.insert(name.to_string(), kind).is_some() {
                return Err(BackendError::DuplicateActivation(name.to_string()));
            }
        }
        Ok(Self { by_name, leaky_slope: DEFAULT_LEAKY_SLOPE })
    }

    /// The nine standard activations.
    pub fn standard() -> Self {
        let mut by_name = HashMap::with_capacity(STANDARD_NAMES.len());
        for (name, kind) in STANDARD_NAMES {
            let previous = by_name.insert(name.to_string(), kind);
            assert!(previous.is_none(), "duplicate activation name '{name}' in standard table");
        }
        Self { by_name, leaky_slope: DEFAULT_LEAKY_SLOPE }
    }

    /// Use `slope` for the negative side of `leaky`.
    pub fn with_leaky_slope(mut self, slope: f32) -> Self {
        self.leaky_slope = slope;
        self
    }

    pub fn leaky_slope(&self) -> f32 {
        self.leaky_slope
    }

    /// Exact lookup without fallback.
    pub fn try_resolve(&self, name: &str) -> Option<ActivationKind> {
        self.by_name.get(name).copied()
    }

    /// Lookup with fallback: unknown names log a warning and map to ReLU.
    pub fn resolve(&self, name: &str) -> ActivationKind {
        match self.try_resolve(name) {
            Some(kind) => kind,
            None => {
                tracing::warn!(activation = name, "unknown activation function, falling back to relu");
                ActivationKind::Relu
            }
        }
    }

    /// Resolve `name` and apply it to `x`.
    pub fn evaluate(&self, x: f32, name: &str) -> f32 {
        self.resolve(name).activate_with_slope(x, self.leaky_slope)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for ActivationRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

static STANDARD: OnceLock<ActivationRegistry> = OnceLock::new();

/// Process-wide standard registry.
pub fn registry() -> &'static ActivationRegistry {
    STANDARD.get_or_init(ActivationRegistry::standard)
}

/// Resolve `name` against the standard registry.
pub fn resolve(name: &str) -> ActivationKind {
    registry().resolve(name)
}

/// Evaluate `name` at `x` using the standard registry.
pub fn evaluate(x: f32, name: &str) -> f32 {
    registry().evaluate(x, name)
}
