//! CUDA runtime (cudarc driver API + NVRTC).
//!
//! Devices are opened lazily on first use. Allocations are typed
//! `CudaSlice`s owned by the runtime and addressed by their raw device
//! pointer; kernels receive raw pointers so in-place and aliased operands
//! need no borrow juggling. Library handles are cuBLAS, cuDNN and cuRAND
//! objects owned by the runtime for its whole lifetime.

mod module;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cudarc::cublas::CudaBlas;
use cudarc::cudnn::Cudnn;
use cudarc::curand::CudaRng;
use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr as _, LaunchAsync, LaunchConfig};
use parking_lot::Mutex;

use self::module::{ModuleCache, ACTIVATIONS, BLAS};
use crate::activation::ActivationKind;
use crate::error::{BackendError, Result};
use crate::launch::{try_grid_for, BLOCK};
use crate::runtime::{
    check_kernel_index, check_span, DeviceIndex, DevicePtr, ElementKind, HandleId, HandleKind, HostSlice, HostSliceMut, Runtime,
};

enum CudaMemory {
    F32(CudaSlice<f32>),
    I32(CudaSlice<i32>),
}

struct CudaAllocation {
    device: DeviceIndex,
    len: usize,
    memory: CudaMemory,
}

impl CudaAllocation {
    fn kind(&self) -> ElementKind {
        match self.memory {
            CudaMemory::F32(_) => ElementKind::F32,
            CudaMemory::I32(_) => ElementKind::I32,
        }
    }
}

#[allow(dead_code)] // handles are held for their lifetime only
enum CudaHandle {
    Blas(DeviceIndex, CudaBlas),
    Dnn(DeviceIndex, Arc<Cudnn>),
    Rng(DeviceIndex, CudaRng),
}

/// Accelerator runtime over the CUDA driver.
pub struct CudaRuntime {
    count: usize,
    devices: Mutex<HashMap<DeviceIndex, Arc<CudaDevice>>>,
    modules: ModuleCache,
    allocations: Mutex<HashMap<u64, CudaAllocation>>,
    handles: Mutex<HashMap<HandleId, CudaHandle>>,
    next_handle: Mutex<u64>,
    last_error: Mutex<Option<BackendError>>,
}

impl fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaRuntime")
            .field("count", &self.count)
            .field("allocations", &self.allocations.lock().len())
            .field("handles", &self.handles.lock().len())
            .finish_non_exhaustive()
    }
}

fn driver_err(e: impl fmt::Display) -> BackendError {
    BackendError::Driver(e.to_string())
}

impl CudaRuntime {
    /// Open the CUDA driver. Fails when no driver or device is present.
    pub fn new() -> Result<Self> {
        let count = CudaDevice::count().map_err(|e| BackendError::NotAvailable(e.to_string()))?;
        if count <= 0 {
            return Err(BackendError::NotAvailable("no CUDA device found".into()));
        }
        tracing::info!(devices = count, "CUDA runtime ready");
        Ok(Self {
            count: count as usize,
            devices: Mutex::new(HashMap::new()),
            modules: ModuleCache::default(),
            allocations: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
            last_error: Mutex::new(None),
        })
    }

    /// Whether a CUDA device can be opened.
    pub fn is_available() -> bool {
        CudaDevice::count().map(|n| n > 0).unwrap_or(false)
    }

    fn device(&self, index: DeviceIndex) -> Result<Arc<CudaDevice>> {
        if index >= self.count {
            return Err(BackendError::InvalidDevice { index, count: self.count });
        }
        let mut devices = self.devices.lock();
        if let Some(dev) = devices.get(&index) {
            return Ok(Arc::clone(dev));
        }
        let dev = CudaDevice::new(index).map_err(|e| BackendError::DeviceQuery(format!("device {index}: {e}")))?;
        devices.insert(index, Arc::clone(&dev));
        Ok(dev)
    }

    fn set_last_error(&self, error: BackendError) {
        let mut slot = self.last_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Launch `f`; a driver failure is parked in the trailing error slot.
    fn launch<P>(&self, kernel: &'static str, f: cudarc::driver::CudaFunction, cfg: LaunchConfig, params: P)
    where
        cudarc::driver::CudaFunction: LaunchAsync<P>,
    {
        // SAFETY: parameters match the kernel signatures in kernels/*.cu and
        // every pointer was bounds-checked against its live allocation.
        if let Err(e) = unsafe { f.launch(cfg, params) } {
            self.set_last_error(BackendError::KernelLaunch { kernel, reason: e.to_string() });
        }
    }
}

/// Device pointer and device of a live f32 allocation of at least `(n-1)*inc+1` elements.
fn f32_operand(
    allocations: &HashMap<u64, CudaAllocation>,
    ptr: DevicePtr,
    n: usize,
    inc: usize,
) -> Result<(u64, DeviceIndex)> {
    let allocation = allocations.get(&ptr.0).ok_or(BackendError::InvalidPointer(ptr))?;
    if allocation.kind() != ElementKind::F32 {
        return Err(BackendError::ElementMismatch { expected: ElementKind::F32, actual: allocation.kind() });
    }
    check_span(n, inc, allocation.len)?;
    check_kernel_index(n, inc)?;
    Ok((ptr.0, allocation.device))
}

fn as_kernel_int(n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| BackendError::LaunchTooLarge { n })
}

impl Runtime for CudaRuntime {
    fn name(&self) -> &str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        let count = CudaDevice::count().map_err(|e| BackendError::DeviceQuery(e.to_string()))?;
        Ok(count.max(0) as usize)
    }

    fn bind_device(&self, device: DeviceIndex) -> Result<()> {
        self.device(device)?.bind_to_thread().map_err(driver_err)
    }

    fn take_last_error(&self) -> Option<BackendError> {
        self.last_error.lock().take()
    }

    fn alloc(&self, device: DeviceIndex, kind: ElementKind, len: usize) -> Result<DevicePtr> {
        let dev = self.device(device)?;
        let failed = |e: cudarc::driver::DriverError| BackendError::AllocationFailed {
            device,
            kind,
            elements: len,
            reason: e.to_string(),
        };
        // Zero-length buffers still get a distinct address.
        let slots = len.max(1);
        // SAFETY: contents are unspecified until written; callers fill or copy first.
        let memory = match kind {
            ElementKind::F32 => CudaMemory::F32(unsafe { dev.alloc::<f32>(slots) }.map_err(failed)?),
            ElementKind::I32 => CudaMemory::I32(unsafe { dev.alloc::<i32>(slots) }.map_err(failed)?),
        };
        let raw = match &memory {
            CudaMemory::F32(s) => *s.device_ptr(),
            CudaMemory::I32(s) => *s.device_ptr(),
        };
        self.allocations.lock().insert(raw, CudaAllocation { device, len, memory });
        tracing::trace!(device, ptr = %DevicePtr(raw), len, %kind, "cuda alloc");
        Ok(DevicePtr(raw))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        // Dropping the slice releases the device memory.
        self.allocations.lock().remove(&ptr.0).map(drop).ok_or(BackendError::InvalidPointer(ptr))
    }

    fn copy_host_to_device(&self, dst: DevicePtr, src: HostSlice<'_>) -> Result<()> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations.get_mut(&dst.0).ok_or(BackendError::InvalidPointer(dst))?;
        if src.len() > allocation.len {
            return Err(BackendError::SizeMismatch { expected: allocation.len, actual: src.len() });
        }
        if src.is_empty() {
            return Ok(());
        }
        let (dev, kind) = (self.device(allocation.device)?, allocation.kind());
        match (&mut allocation.memory, src) {
            (CudaMemory::F32(mem), HostSlice::F32(src)) => {
                dev.htod_sync_copy_into(src, &mut mem.slice_mut(..src.len())).map_err(driver_err)
            }
            (CudaMemory::I32(mem), HostSlice::I32(src)) => {
                dev.htod_sync_copy_into(src, &mut mem.slice_mut(..src.len())).map_err(driver_err)
            }
            (_, src) => Err(BackendError::ElementMismatch { expected: src.kind(), actual: kind }),
        }
    }

    fn copy_device_to_host(&self, src: DevicePtr, dst: HostSliceMut<'_>) -> Result<()> {
        let allocations = self.allocations.lock();
        let allocation = allocations.get(&src.0).ok_or(BackendError::InvalidPointer(src))?;
        if dst.len() > allocation.len {
            return Err(BackendError::SizeMismatch { expected: allocation.len, actual: dst.len() });
        }
        if dst.is_empty() {
            return Ok(());
        }
        let (dev, kind) = (self.device(allocation.device)?, allocation.kind());
        match (&allocation.memory, dst) {
            (CudaMemory::F32(mem), HostSliceMut::F32(dst)) => {
                dev.dtoh_sync_copy_into(&mem.slice(..dst.len()), dst).map_err(driver_err)
            }
            (CudaMemory::I32(mem), HostSliceMut::I32(dst)) => {
                dev.dtoh_sync_copy_into(&mem.slice(..dst.len()), dst).map_err(driver_err)
            }
            (_, dst) => Err(BackendError::ElementMismatch { expected: dst.kind(), actual: kind }),
        }
    }

    fn fill(&self, x: DevicePtr, n: usize, alpha: f32, incx: usize) -> Result<()> {
        let allocations = self.allocations.lock();
        let (x, device) = f32_operand(&allocations, x, n, incx)?;
        let cfg = try_grid_for(n)?.to_launch_config();
        let dev = self.device(device)?;
        let f = self.modules.func(&dev, device, &BLAS, "fill_kernel")?;
        self.launch("fill", f, cfg, (as_kernel_int(n)?, alpha, x, as_kernel_int(incx)?));
        Ok(())
    }

    fn axpy(&self, n: usize, alpha: f32, x: DevicePtr, incx: usize, y: DevicePtr, incy: usize) -> Result<()> {
        let allocations = self.allocations.lock();
        let (x, x_device) = f32_operand(&allocations, x, n, incx)?;
        let (y, y_device) = f32_operand(&allocations, y, n, incy)?;
        if x_device != y_device {
            return Err(BackendError::DeviceMismatch { expected: y_device, actual: x_device });
        }
        let cfg = try_grid_for(n)?.to_launch_config();
        let dev = self.device(y_device)?;
        let f = self.modules.func(&dev, y_device, &BLAS, "axpy_kernel")?;
        let params = (as_kernel_int(n)?, alpha, x, as_kernel_int(incx)?, y, as_kernel_int(incy)?);
        self.launch("axpy", f, cfg, params);
        Ok(())
    }

    fn dot(&self, n: usize, x: DevicePtr, incx: usize, y: DevicePtr, incy: usize) -> Result<f32> {
        let allocations = self.allocations.lock();
        let (x, x_device) = f32_operand(&allocations, x, n, incx)?;
        let (y, y_device) = f32_operand(&allocations, y, n, incy)?;
        if x_device != y_device {
            return Err(BackendError::DeviceMismatch { expected: x_device, actual: y_device });
        }
        let dev = self.device(x_device)?;
        let out = dev.alloc_zeros::<f32>(1).map_err(driver_err)?;
        let mut cfg = try_grid_for(n)?.to_launch_config();
        cfg.shared_mem_bytes = (BLOCK * std::mem::size_of::<f32>()) as u32;
        let f = self.modules.func(&dev, x_device, &BLAS, "dot_kernel")?;
        let params = (as_kernel_int(n)?, x, as_kernel_int(incx)?, y, as_kernel_int(incy)?, *out.device_ptr());
        // SAFETY: see `launch`; `out` is a live one-element allocation.
        unsafe { f.launch(cfg, params) }.map_err(|e| BackendError::KernelLaunch {
            kernel: "dot",
            reason: e.to_string(),
        })?;
        let host = dev.dtoh_sync_copy(&out).map_err(driver_err)?;
        Ok(host.first().copied().unwrap_or(0.0))
    }

    fn activate(&self, x: DevicePtr, n: usize, kind: ActivationKind, leaky_slope: f32) -> Result<()> {
        let allocations = self.allocations.lock();
        let (x, device) = f32_operand(&allocations, x, n, 1)?;
        let cfg = try_grid_for(n)?.to_launch_config();
        let dev = self.device(device)?;
        let f = self.modules.func(&dev, device, &ACTIVATIONS, "activate_array_kernel")?;
        self.launch("activate", f, cfg, (x, as_kernel_int(n)?, kind.code(), leaky_slope));
        Ok(())
    }

    fn create_handle(&self, device: DeviceIndex, kind: HandleKind, seed: u64) -> Result<HandleId> {
        let dev = self.device(device)?;
        let failed = |reason: String| BackendError::HandleCreation { kind, device, reason };
        let handle = match kind {
            HandleKind::LinearAlgebra => {
                CudaHandle::Blas(device, CudaBlas::new(dev).map_err(|e| failed(e.to_string()))?)
            }
            HandleKind::TensorOp => CudaHandle::Dnn(device, Cudnn::new(dev).map_err(|e| failed(e.to_string()))?),
            HandleKind::Random => {
                CudaHandle::Rng(device, CudaRng::new(seed, dev).map_err(|e| failed(e.to_string()))?)
            }
        };
        let id = {
            let mut next = self.next_handle.lock();
            let id = HandleId(*next);
            *next += 1;
            id
        };
        self.handles.lock().insert(id, handle);
        Ok(id)
    }

    fn random_uniform(&self, generator: HandleId, x: DevicePtr, n: usize) -> Result<()> {
        let handles = self.handles.lock();
        let (rng_device, rng) = match handles.get(&generator) {
            Some(CudaHandle::Rng(device, rng)) => (*device, rng),
            _ => return Err(BackendError::UnknownHandle(generator.0)),
        };
        let mut allocations = self.allocations.lock();
        let allocation = allocations.get_mut(&x.0).ok_or(BackendError::InvalidPointer(x))?;
        if allocation.device != rng_device {
            return Err(BackendError::DeviceMismatch { expected: rng_device, actual: allocation.device });
        }
        check_span(n, 1, allocation.len)?;
        if n == 0 {
            return Ok(());
        }
        match &mut allocation.memory {
            CudaMemory::F32(mem) => {
                if let Err(e) = rng.fill_with_uniform(&mut mem.slice_mut(..n)) {
                    let reason = e.to_string();
                    self.set_last_error(BackendError::KernelLaunch { kernel: "random_uniform", reason });
                }
                Ok(())
            }
            CudaMemory::I32(_) => {
                Err(BackendError::ElementMismatch { expected: ElementKind::F32, actual: ElementKind::I32 })
            }
        }
    }
}
