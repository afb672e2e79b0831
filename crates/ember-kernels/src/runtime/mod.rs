//! Accelerator runtime seam.
//!
//! Everything above this module talks to the accelerator through the
//! [`Runtime`] trait. Two implementations exist:
//! - [`HostRuntime`]: host-memory emulation of a multi-device accelerator
//!   (always available, used by the test suite)
//! - `CudaRuntime`: cudarc driver + NVRTC kernels (behind the `cuda` feature)
//!
//! Runtime calls never consult a process-wide "current device"; every call
//! names its device explicitly, and the [`DeviceContext`](crate::DeviceContext)
//! owns the selection.

use std::fmt;

use crate::activation::ActivationKind;
use crate::error::{BackendError, Result};

pub mod host;

pub use host::HostRuntime;

/// Index of a physical accelerator.
pub type DeviceIndex = usize;

/// Opaque device address of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque identifier of a library handle created by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

/// Element type of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    F32,
    I32,
}

impl ElementKind {
    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            ElementKind::F32 | ElementKind::I32 => 4,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::F32 => write!(f, "f32"),
            ElementKind::I32 => write!(f, "i32"),
        }
    }
}

/// Library subsystem a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Dense linear algebra (cuBLAS).
    LinearAlgebra,
    /// Tensor operators (cuDNN).
    TensorOp,
    /// Pseudo-random generator (cuRAND).
    Random,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::LinearAlgebra => write!(f, "linear-algebra"),
            HandleKind::TensorOp => write!(f, "tensor-op"),
            HandleKind::Random => write!(f, "random"),
        }
    }
}

/// Host-side source data for a host→device copy.
#[derive(Debug, Clone, Copy)]
pub enum HostSlice<'a> {
    F32(&'a [f32]),
    I32(&'a [i32]),
}

impl HostSlice<'_> {
    pub fn kind(&self) -> ElementKind {
        match self {
            HostSlice::F32(_) => ElementKind::F32,
            HostSlice::I32(_) => ElementKind::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostSlice::F32(s) => s.len(),
            HostSlice::I32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host-side destination for a device→host copy.
#[derive(Debug)]
pub enum HostSliceMut<'a> {
    F32(&'a mut [f32]),
    I32(&'a mut [i32]),
}

impl HostSliceMut<'_> {
    pub fn kind(&self) -> ElementKind {
        match self {
            HostSliceMut::F32(_) => ElementKind::F32,
            HostSliceMut::I32(_) => ElementKind::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostSliceMut::F32(s) => s.len(),
            HostSliceMut::I32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `(n - 1) * inc` must address an element of a buffer of `len` elements.
pub(crate) fn check_span(n: usize, inc: usize, len: usize) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let last = (n - 1).saturating_mul(inc.max(1));
    if last >= len {
        return Err(BackendError::SizeMismatch { expected: len, actual: last.saturating_add(1) });
    }
    Ok(())
}

/// The largest element offset `(n - 1) * inc` must fit the 32-bit index the
/// device kernels compute with.
pub(crate) fn check_kernel_index(n: usize, inc: usize) -> Result<()> {
    let last = n.saturating_sub(1).saturating_mul(inc.max(1));
    if last > i32::MAX as usize {
        return Err(BackendError::LaunchTooLarge { n });
    }
    Ok(())
}

/// An accelerator runtime: device enumeration, memory, copies, the per-element
/// kernels the backend dispatches to, and library handle construction.
///
/// Kernel launches (`fill`, `axpy`, `activate`, `random_uniform`) are
/// asynchronous. Their return value only covers argument validation; a
/// failure during execution lands in the trailing error slot drained by
/// [`Runtime::take_last_error`]. `dot` returns a value and is therefore a
/// synchronization point.
pub trait Runtime: Send + Sync + fmt::Debug {
    /// Short backend name ("host", "cuda").
    fn name(&self) -> &str;

    /// Number of devices the runtime can address.
    fn device_count(&self) -> Result<usize>;

    /// Validate `device` and make it ready for work from the calling thread.
    fn bind_device(&self, device: DeviceIndex) -> Result<()>;

    /// Drain the trailing "last error" slot.
    fn take_last_error(&self) -> Option<BackendError>;

    /// Allocate `len` elements of `kind` on `device`. Contents are unspecified.
    fn alloc(&self, device: DeviceIndex, kind: ElementKind, len: usize) -> Result<DevicePtr>;

    /// Release an allocation.
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy `src` into the first `src.len()` elements of `dst`.
    fn copy_host_to_device(&self, dst: DevicePtr, src: HostSlice<'_>) -> Result<()>;

    /// Copy the first `dst.len()` elements of `src` into `dst`.
    fn copy_device_to_host(&self, src: DevicePtr, dst: HostSliceMut<'_>) -> Result<()>;

    /// `x[i * incx] = alpha` for `i in 0..n`.
    fn fill(&self, x: DevicePtr, n: usize, alpha: f32, incx: usize) -> Result<()>;

    /// `y[i * incy] += alpha * x[i * incx]` for `i in 0..n`.
    fn axpy(
        &self,
        n: usize,
        alpha: f32,
        x: DevicePtr,
        incx: usize,
        y: DevicePtr,
        incy: usize,
    ) -> Result<()>;

    /// `sum(x[i * incx] * y[i * incy])` for `i in 0..n`.
    fn dot(&self, n: usize, x: DevicePtr, incx: usize, y: DevicePtr, incy: usize) -> Result<f32>;

    /// Apply `kind` in place to the first `n` elements of `x`.
    fn activate(&self, x: DevicePtr, n: usize, kind: ActivationKind, leaky_slope: f32) -> Result<()>;

    /// Create a library handle of `kind` on `device`. `seed` is used by
    /// random generators only.
    fn create_handle(&self, device: DeviceIndex, kind: HandleKind, seed: u64) -> Result<HandleId>;

    /// Fill the first `n` elements of `x` with uniform randoms in `(0, 1]` using `generator`.
    fn random_uniform(&self, generator: HandleId, x: DevicePtr, n: usize) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_span() {
        assert!(check_span(0, 7, 0).is_ok());
        assert!(check_span(3, 2, 5).is_ok());
        assert_eq!(check_span(3, 2, 4), Err(BackendError::SizeMismatch { expected: 4, actual: 5 }));
    }

    #[test]
    fn test_strided_index_fits_kernel_int() {
        let n = 1 << 20;
        assert!(check_kernel_index(n, 1).is_ok());
        assert!(check_kernel_index(n, 2047).is_ok());
        // each factor fits an i32, their product does not
        assert_eq!(check_kernel_index(n, 4096), Err(BackendError::LaunchTooLarge { n }));
        assert!(check_kernel_index(0, usize::MAX).is_ok());
    }
}
