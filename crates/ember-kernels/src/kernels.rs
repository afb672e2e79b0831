//! Per-element kernel dispatch.
//!
//! Launches are asynchronous. An `Err` means the launch was rejected
//! (bad pointer, bad size, wrong element type); a failure while the kernel
//! runs is picked up by the reporter on this or a later call.

use crate::activation::ActivationKind;
use crate::context::DeviceContext;
use crate::error::Result;
use crate::launch::grid_for;
use crate::memory::DeviceBuffer;

#[derive(Debug, Clone, Copy)]
pub struct Kernels<'a> {
    ctx: &'a DeviceContext,
}

impl<'a> Kernels<'a> {
    pub(crate) fn new(ctx: &'a DeviceContext) -> Self {
        Self { ctx }
    }

    /// `x[i * incx] = alpha` for `i < n`.
    pub fn fill(&self, x: &DeviceBuffer, n: usize, alpha: f32, incx: usize) -> Result<()> {
        let runtime = self.ctx.runtime();
        tracing::trace!(n, alpha, incx, grid = ?grid_for(n), "fill");
        self.ctx.reporter().check(runtime, "fill", runtime.fill(x.ptr(), n, alpha, incx))
    }

    /// `y[i * incy] += alpha * x[i * incx]` for `i < n`.
    pub fn axpy(
        &self,
        n: usize,
        alpha: f32,
        x: &DeviceBuffer,
        incx: usize,
        y: &DeviceBuffer,
        incy: usize,
    ) -> Result<()> {
        let runtime = self.ctx.runtime();
        tracing::trace!(n, alpha, incx, incy, grid = ?grid_for(n), "axpy");
        let status = runtime.axpy(n, alpha, x.ptr(), incx, y.ptr(), incy);
        self.ctx.reporter().check(runtime, "axpy", status)
    }

    /// Strided dot product. Waits for the device.
    pub fn dot(&self, n: usize, x: &DeviceBuffer, incx: usize, y: &DeviceBuffer, incy: usize) -> Result<f32> {
        let runtime = self.ctx.runtime();
        let status = runtime.dot(n, x.ptr(), incx, y.ptr(), incy);
        self.ctx.reporter().check(runtime, "dot", status)
    }

    /// Apply `kind` in place to the first `n` elements of `x`.
    pub fn activate(&self, x: &DeviceBuffer, n: usize, kind: ActivationKind) -> Result<()> {
        let runtime = self.ctx.runtime();
        let slope = self.ctx.activations().leaky_slope();
        tracing::trace!(n, activation = %kind, grid = ?grid_for(n), "activate");
        self.ctx.reporter().check(runtime, "activate", runtime.activate(x.ptr(), n, kind, slope))
    }

    /// [`activate`](Self::activate) with an activation looked up by name.
    pub fn activate_named(&self, x: &DeviceBuffer, n: usize, name: &str) -> Result<()> {
        self.activate(x, n, self.ctx.activations().resolve(name))
    }

    /// Fill the first `n` elements of `x` with uniform randoms in `(0, 1]`
    /// drawn from the current device's generator.
    pub fn random_uniform(&self, x: &DeviceBuffer, n: usize) -> Result<()> {
        let generator = self.ctx.random_generator()?;
        let runtime = self.ctx.runtime();
        tracing::trace!(n, device = generator.device, "random_uniform");
        self.ctx
            .reporter()
            .check(runtime, "random_uniform", runtime.random_uniform(generator.id, x.ptr(), n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::error::BackendError;

    fn ctx() -> DeviceContext {
        DeviceContext::host(BackendConfig::default().with_host_devices(2).with_seed(5)).unwrap()
    }

    #[test]
    fn test_axpy_and_dot() {
        let ctx = ctx();
        let arena = ctx.arena();
        let x = arena.alloc_floats(Some(&[1.0, 2.0, 3.0]), 3).unwrap();
        let y = arena.alloc_floats(Some(&[1.0, 1.0, 1.0]), 3).unwrap();
        ctx.kernels().axpy(3, -1.0, &x, 1, &y, 1).unwrap();
        assert_eq!(arena.to_host::<f32>(&y).unwrap(), vec![0.0, -1.0, -2.0]);
        assert_eq!(ctx.kernels().dot(3, &x, 1, &y, 1), Ok(-8.0));
    }

    #[test]
    fn test_activate() {
        let ctx = ctx();
        let arena = ctx.arena();
        let x = arena.alloc_floats(Some(&[-2.0, 0.5, 3.0]), 3).unwrap();
        ctx.kernels().activate(&x, 3, ActivationKind::HardTanh).unwrap();
        assert_eq!(arena.to_host::<f32>(&x).unwrap(), vec![-1.0, 0.5, 1.0]);
        ctx.kernels().activate_named(&x, 3, "leaky").unwrap();
        let out = arena.to_host::<f32>(&x).unwrap();
        assert!((out[0] + 0.1).abs() < 1e-6);
        assert_eq!(&out[1..], &[0.5, 1.0]);
    }

    #[test]
    fn test_activate_matches_host_formula() {
        let ctx = ctx();
        let arena = ctx.arena();
        let input: Vec<f32> = (-20..=20).map(|i| i as f32 * 0.25).collect();
        for kind in ActivationKind::ALL {
            let x = arena.alloc_floats(Some(&input), input.len()).unwrap();
            ctx.kernels().activate(&x, input.len(), kind).unwrap();
            let out = arena.to_host::<f32>(&x).unwrap();
            for (v, &i) in out.iter().zip(&input) {
                assert_eq!(*v, kind.activate(i), "{kind} at {i}");
            }
            arena.free(x).unwrap();
        }
    }

    #[test]
    fn test_random_uniform_range() {
        let ctx = ctx();
        let x = ctx.arena().alloc_floats(None, 2048).unwrap();
        ctx.kernels().random_uniform(&x, 2048).unwrap();
        let out = ctx.arena().to_host::<f32>(&x).unwrap();
        assert!(out.iter().all(|&v| v > 0.0 && v <= 1.0));
        assert!(out.iter().any(|&v| v != out[0]));
    }

    #[test]
    fn test_random_uniform_wrong_device() {
        let ctx = ctx();
        let x = ctx.arena().alloc_floats(None, 4).unwrap();
        ctx.set_device(1).unwrap();
        assert_eq!(
            ctx.kernels().random_uniform(&x, 4),
            Err(BackendError::DeviceMismatch { expected: 1, actual: 0 })
        );
    }

    #[test]
    fn test_rejected_launch() {
        let ctx = ctx();
        let x = ctx.arena().alloc_floats(None, 4).unwrap();
        assert!(matches!(ctx.kernels().fill(&x, 5, 1.0, 1), Err(BackendError::SizeMismatch { .. })));
        assert_eq!(ctx.reporter().failures(), 1);
    }
}
