//! Checks of device results against host references.

use crate::context::DeviceContext;
use crate::error::{BackendError, Result};
use crate::host_math;
use crate::memory::DeviceBuffer;

#[derive(Debug, Clone, Copy)]
pub struct Diagnostics<'a> {
    ctx: &'a DeviceContext,
}

impl<'a> Diagnostics<'a> {
    pub(crate) fn new(ctx: &'a DeviceContext) -> Self {
        Self { ctx }
    }

    /// RMS difference between the first `n` elements of `buf` and `reference`.
    ///
    /// The result is logged at info level under `label`. An empty comparison
    /// is 0.
    pub fn compare(&self, buf: &DeviceBuffer, reference: &[f32], n: usize, label: &str) -> Result<f32> {
        if n == 0 {
            tracing::info!(label, rms = 0.0f32, "compare");
            return Ok(0.0);
        }
        if reference.len() < n {
            let e = BackendError::SizeMismatch { expected: n, actual: reference.len() };
            self.ctx.reporter().report("compare", &e);
            return Err(e);
        }

        let mut tmp = vec![0.0f32; n];
        self.ctx.arena().copy_device_to_host(buf, &mut tmp)?;
        host_math::axpy(n, -1.0, reference, 1, &mut tmp, 1);
        let err = host_math::dot(n, &tmp, 1, &tmp, 1);
        let rms = (err / n as f32).sqrt();
        tracing::info!(label, rms, "compare");
        Ok(rms)
    }

    /// Euclidean norm of the first `n` elements of `buf`.
    pub fn magnitude(&self, buf: &DeviceBuffer, n: usize) -> Result<f32> {
        let mut tmp = vec![0.0f32; n];
        self.ctx.arena().copy_device_to_host(buf, &mut tmp)?;
        Ok(host_math::magnitude(&tmp))
    }
}
