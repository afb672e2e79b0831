//! Device selection and the entry point to the backend.
//!
//! A [`DeviceContext`] owns the "current device" that every handle, memory
//! and kernel operation issued through it targets. Contexts are cheap to
//! [`fork`](DeviceContext::fork): a fork shares the runtime, the handle cache
//! and the error reporter but selects its device independently, so each
//! worker thread can pin its own accelerator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::activation::ActivationRegistry;
use crate::config::BackendConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{BackendError, Result};
use crate::handles::{Handle, HandleCache};
use crate::kernels::Kernels;
use crate::memory::MemoryArena;
use crate::report::ErrorReporter;
use crate::runtime::{DeviceIndex, HandleKind, HostRuntime, Runtime};

/// Backend state for one thread of control.
#[derive(Debug)]
pub struct DeviceContext {
    runtime: Arc<dyn Runtime>,
    handles: Arc<HandleCache>,
    reporter: Arc<ErrorReporter>,
    activations: Arc<ActivationRegistry>,
    config: Arc<BackendConfig>,
    current: AtomicUsize,
}

impl DeviceContext {
    /// Context over `runtime`, bound to `config.default_device`.
    pub fn new(runtime: Arc<dyn Runtime>, config: BackendConfig) -> Result<Self> {
        config.validate()?;
        let activations = ActivationRegistry::standard().with_leaky_slope(config.leaky_slope);
        let ctx = Self {
            runtime,
            handles: Arc::new(HandleCache::new()),
            reporter: Arc::new(ErrorReporter::new()),
            activations: Arc::new(activations),
            current: AtomicUsize::new(config.default_device),
            config: Arc::new(config),
        };
        ctx.set_device(ctx.config.default_device)?;
        Ok(ctx)
    }

    /// Context over a host-emulated accelerator with `config.host_devices` devices.
    pub fn host(config: BackendConfig) -> Result<Self> {
        let runtime = Arc::new(HostRuntime::new(config.host_devices));
        Self::new(runtime, config)
    }

    /// Context over the CUDA devices of this machine.
    #[cfg(feature = "cuda")]
    pub fn cuda(config: BackendConfig) -> Result<Self> {
        let runtime = Arc::new(crate::cuda::CudaRuntime::new()?);
        Self::new(runtime, config)
    }

    /// New context sharing this one's runtime, handles and reporter, with
    /// its own current device (initially the same as this one's).
    pub fn fork(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            handles: Arc::clone(&self.handles),
            reporter: Arc::clone(&self.reporter),
            activations: Arc::clone(&self.activations),
            config: Arc::clone(&self.config),
            current: AtomicUsize::new(self.current.load(Ordering::Acquire)),
        }
    }

    /// Make `index` the target of later operations issued through this context.
    ///
    /// On failure the current device is left unchanged.
    pub fn set_device(&self, index: DeviceIndex) -> Result<()> {
        let status = self.runtime.bind_device(index);
        self.reporter.check(self.runtime.as_ref(), "set_device", status)?;
        self.current.store(index, Ordering::Release);
        tracing::debug!(device = index, backend = self.runtime.name(), "device selected");
        Ok(())
    }

    /// Current device, re-validated against the runtime's device count.
    pub fn try_get_device(&self) -> Result<DeviceIndex> {
        let index = self.current_device();
        let status = self.runtime.device_count().and_then(|count| {
            if index < count {
                Ok(index)
            } else {
                Err(BackendError::InvalidDevice { index, count })
            }
        });
        self.reporter.check(self.runtime.as_ref(), "get_device", status)
    }

    /// Current device, or 0 when the query fails (the failure is reported).
    pub fn get_device(&self) -> DeviceIndex {
        self.try_get_device().unwrap_or(0)
    }

    /// Dense linear-algebra handle of the current device.
    pub fn linear_algebra_handle(&self) -> Result<Handle> {
        self.handle(HandleKind::LinearAlgebra, "linear_algebra_handle")
    }

    /// Tensor-operator handle of the current device.
    pub fn tensor_handle(&self) -> Result<Handle> {
        self.handle(HandleKind::TensorOp, "tensor_handle")
    }

    /// Random generator of the current device.
    pub fn random_generator(&self) -> Result<Handle> {
        self.handle(HandleKind::Random, "random_generator")
    }

    fn handle(&self, kind: HandleKind, op: &'static str) -> Result<Handle> {
        let device = self.try_get_device()?;
        let seed = || self.config.random_seed.unwrap_or_else(wall_clock_seed);
        let status = self.handles.get_or_create(self.runtime.as_ref(), device, kind, seed);
        self.reporter.check(self.runtime.as_ref(), op, status)
    }

    /// Device memory of the current device.
    pub fn arena(&self) -> MemoryArena<'_> {
        MemoryArena::new(self)
    }

    /// Per-element kernels.
    pub fn kernels(&self) -> Kernels<'_> {
        Kernels::new(self)
    }

    /// Device-vs-host result checks.
    pub fn diagnostics(&self) -> Diagnostics<'_> {
        Diagnostics::new(self)
    }

    /// Device selected by this context, without re-validation.
    pub fn current_device(&self) -> DeviceIndex {
        self.current.load(Ordering::Acquire)
    }

    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn handles(&self) -> &HandleCache {
        &self.handles
    }

    pub fn activations(&self) -> &ActivationRegistry {
        &self.activations
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
