//! Error taxonomy for the GPU backend.

use crate::runtime::{DevicePtr, ElementKind, HandleKind};

/// Backend errors.
///
/// Every fallible device operation returns one of these instead of aborting.
/// The [`ErrorReporter`](crate::report::ErrorReporter) logs them as they
/// happen; callers decide whether to ignore, retry at a higher level, or
/// escalate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("accelerator runtime not available: {0}")]
    NotAvailable(String),

    #[error("invalid device ordinal {index} ({count} device(s) present)")]
    InvalidDevice { index: usize, count: usize },

    #[error("device {index} is outside the handle table (capacity {capacity})")]
    DeviceOutOfRange { index: usize, capacity: usize },

    #[error("device query failed: {0}")]
    DeviceQuery(String),

    #[error("allocation of {elements} {kind} element(s) on device {device} failed: {reason}")]
    AllocationFailed {
        device: usize,
        kind: ElementKind,
        elements: usize,
        reason: String,
    },

    #[error("invalid device pointer {0}")]
    InvalidPointer(DevicePtr),

    #[error("size mismatch: expected at most {expected} element(s), got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("element type mismatch: buffer holds {actual}, operation needs {expected}")]
    ElementMismatch {
        expected: ElementKind,
        actual: ElementKind,
    },

    #[error("operand lives on device {actual}, expected device {expected}")]
    DeviceMismatch { expected: usize, actual: usize },

    #[error("launch of {n} element(s) exceeds the maximum grid")]
    LaunchTooLarge { n: usize },

    #[error("failed to create {kind} handle on device {device}: {reason}")]
    HandleCreation {
        kind: HandleKind,
        device: usize,
        reason: String,
    },

    #[error("unknown handle {0}")]
    UnknownHandle(u64),

    #[error("kernel '{kernel}' failed: {reason}")]
    KernelLaunch { kernel: &'static str, reason: String },

    #[error("PTX compilation failed for module '{module}': {msg}")]
    PtxCompile { module: String, msg: String },

    #[error("function '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("CUDA driver error: {0}")]
    Driver(String),

    #[error("duplicate activation name '{0}' in registry table")]
    DuplicateActivation(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;
