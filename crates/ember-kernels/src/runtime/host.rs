//! Host-memory emulation of a multi-device accelerator.
//!
//! Each emulated device owns a set of allocations addressed by fake device
//! pointers. Kernels walk the same launch geometry the device kernels use and
//! behave asynchronously: a failed launch is accepted and its error parked in
//! the trailing error slot. Fresh allocations are poisoned so reads of memory
//! that was never written are visible in tests.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{check_span, DeviceIndex, DevicePtr, ElementKind, HandleId, HandleKind, HostSlice, HostSliceMut, Runtime};
use crate::activation::ActivationKind;
use crate::error::{BackendError, Result};
use crate::launch::{try_grid_for, LaunchGeometry, BLOCK};

/// Bit pattern of never-written float memory (a quiet NaN).
pub const POISON_F32: u32 = 0x7fc0_dead;
/// Never-written int memory.
pub const POISON_I32: i32 = 0x5eed_dead;

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ADDRESS_ALIGN: u64 = 256;

#[derive(Debug)]
enum HostMemory {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl HostMemory {
    fn kind(&self) -> ElementKind {
        match self {
            HostMemory::F32(_) => ElementKind::F32,
            HostMemory::I32(_) => ElementKind::I32,
        }
    }

    fn len(&self) -> usize {
        match self {
            HostMemory::F32(v) => v.len(),
            HostMemory::I32(v) => v.len(),
        }
    }
}

#[derive(Debug)]
struct Allocation {
    device: DeviceIndex,
    memory: HostMemory,
}

struct HostHandle {
    device: DeviceIndex,
    kind: HandleKind,
    rng: Option<StdRng>,
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("device", &self.device)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct HostState {
    allocations: HashMap<DevicePtr, Allocation>,
    used: HashMap<DeviceIndex, usize>,
    next_address: u64,
    handles: HashMap<HandleId, HostHandle>,
    next_handle: u64,
}

impl HostState {
    fn allocation(&self, ptr: DevicePtr) -> Result<&Allocation> {
        self.allocations.get(&ptr).ok_or(BackendError::InvalidPointer(ptr))
    }

    fn f32s(&self, ptr: DevicePtr) -> Result<&[f32]> {
        match &self.allocation(ptr)?.memory {
            HostMemory::F32(v) => Ok(v),
            other => Err(BackendError::ElementMismatch { expected: ElementKind::F32, actual: other.kind() }),
        }
    }

    fn f32s_mut(&mut self, ptr: DevicePtr) -> Result<&mut [f32]> {
        let allocation = self.allocations.get_mut(&ptr).ok_or(BackendError::InvalidPointer(ptr))?;
        match &mut allocation.memory {
            HostMemory::F32(v) => Ok(v),
            other => Err(BackendError::ElementMismatch { expected: ElementKind::F32, actual: other.kind() }),
        }
    }
}

/// Accelerator emulated in host memory.
#[derive(Debug)]
pub struct HostRuntime {
    devices: usize,
    memory_limit: Option<usize>,
    state: Mutex<HostState>,
    last_error: Mutex<Option<BackendError>>,
    pending_launch_failure: Mutex<Option<String>>,
    pending_query_failure: Mutex<Option<String>>,
}

impl HostRuntime {
    /// Emulate `devices` accelerators with unbounded memory.
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            memory_limit: None,
            state: Mutex::new(HostState {
                allocations: HashMap::new(),
                used: HashMap::new(),
                next_address: BASE_ADDRESS,
                handles: HashMap::new(),
                next_handle: 1,
            }),
            last_error: Mutex::new(None),
            pending_launch_failure: Mutex::new(None),
            pending_query_failure: Mutex::new(None),
        }
    }

    /// Cap every emulated device at `bytes` of live allocations.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Make the next kernel launch fail during execution with `reason`.
    pub fn fail_next_launch(&self, reason: &str) {
        *self.pending_launch_failure.lock() = Some(reason.to_string());
    }

    /// Make the next device-count query fail with `reason`.
    pub fn fail_next_device_query(&self, reason: &str) {
        *self.pending_query_failure.lock() = Some(reason.to_string());
    }

    /// Park `error` in the trailing error slot.
    pub fn set_last_error(&self, error: BackendError) {
        let mut slot = self.last_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Number of live allocations across all devices.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Bytes currently allocated on `device`.
    pub fn bytes_in_use(&self, device: DeviceIndex) -> usize {
        self.state.lock().used.get(&device).copied().unwrap_or(0)
    }

    fn check_device(&self, device: DeviceIndex) -> Result<()> {
        if device >= self.devices {
            return Err(BackendError::InvalidDevice { index: device, count: self.devices });
        }
        Ok(())
    }

    /// Consume an injected launch failure, parking it in the error slot.
    fn launch_fails(&self, kernel: &'static str) -> bool {
        match self.pending_launch_failure.lock().take() {
            Some(reason) => {
                tracing::trace!(kernel, %reason, "emulated launch failure");
                self.set_last_error(BackendError::KernelLaunch { kernel, reason });
                true
            }
            None => false,
        }
    }
}

/// Visit every element index in `0..n` the way a launch over `geometry` does.
fn for_each_index(geometry: LaunchGeometry, n: usize, mut f: impl FnMut(usize)) {
    for block_y in 0..geometry.y {
        for block_x in 0..geometry.x {
            for thread in 0..BLOCK {
                let i = geometry.linear_index(block_x, block_y, thread);
                if i < n {
                    f(i);
                }
            }
        }
    }
}

impl Runtime for HostRuntime {
    fn name(&self) -> &str {
        "host"
    }

    fn device_count(&self) -> Result<usize> {
        if let Some(reason) = self.pending_query_failure.lock().take() {
            return Err(BackendError::DeviceQuery(reason));
        }
        Ok(self.devices)
    }

    fn bind_device(&self, device: DeviceIndex) -> Result<()> {
        self.check_device(device)
    }

    fn take_last_error(&self) -> Option<BackendError> {
        self.last_error.lock().take()
    }

    fn alloc(&self, device: DeviceIndex, kind: ElementKind, len: usize) -> Result<DevicePtr> {
        self.check_device(device)?;
        let bytes = len.checked_mul(kind.size()).ok_or_else(|| BackendError::AllocationFailed {
            device,
            kind,
            elements: len,
            reason: "size overflow".into(),
        })?;

        let mut state = self.state.lock();
        let used = state.used.get(&device).copied().unwrap_or(0);
        if let Some(limit) = self.memory_limit {
            if used.saturating_add(bytes) > limit {
                return Err(BackendError::AllocationFailed {
                    device,
                    kind,
                    elements: len,
                    reason: format!("out of memory ({used} of {limit} bytes in use)"),
                });
            }
        }

        let memory = match kind {
            ElementKind::F32 => HostMemory::F32(vec![f32::from_bits(POISON_F32); len]),
            ElementKind::I32 => HostMemory::I32(vec![POISON_I32; len]),
        };
        let ptr = DevicePtr(state.next_address);
        let span = (bytes as u64).max(1).div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
        state.next_address += span;
        state.used.insert(device, used + bytes);
        state.allocations.insert(ptr, Allocation { device, memory });
        tracing::trace!(device, %ptr, len, %kind, "host alloc");
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        let allocation = state.allocations.remove(&ptr).ok_or(BackendError::InvalidPointer(ptr))?;
        let bytes = allocation.memory.len() * allocation.memory.kind().size();
        if let Some(used) = state.used.get_mut(&allocation.device) {
            *used = used.saturating_sub(bytes);
        }
        Ok(())
    }

    fn copy_host_to_device(&self, dst: DevicePtr, src: HostSlice<'_>) -> Result<()> {
        let mut state = self.state.lock();
        let allocation = state.allocations.get_mut(&dst).ok_or(BackendError::InvalidPointer(dst))?;
        let len = allocation.memory.len();
        if src.len() > len {
            return Err(BackendError::SizeMismatch { expected: len, actual: src.len() });
        }
        match (&mut allocation.memory, src) {
            (HostMemory::F32(mem), HostSlice::F32(src)) => mem[..src.len()].copy_from_slice(src),
            (HostMemory::I32(mem), HostSlice::I32(src)) => mem[..src.len()].copy_from_slice(src),
            (mem, src) => {
                return Err(BackendError::ElementMismatch { expected: src.kind(), actual: mem.kind() });
            }
        }
        Ok(())
    }

    fn copy_device_to_host(&self, src: DevicePtr, dst: HostSliceMut<'_>) -> Result<()> {
        let state = self.state.lock();
        let allocation = state.allocation(src)?;
        let len = allocation.memory.len();
        if dst.len() > len {
            return Err(BackendError::SizeMismatch { expected: len, actual: dst.len() });
        }
        match (&allocation.memory, dst) {
            (HostMemory::F32(mem), HostSliceMut::F32(dst)) => dst.copy_from_slice(&mem[..dst.len()]),
            (HostMemory::I32(mem), HostSliceMut::I32(dst)) => dst.copy_from_slice(&mem[..dst.len()]),
            (mem, dst) => {
                return Err(BackendError::ElementMismatch { expected: dst.kind(), actual: mem.kind() });
            }
        }
        Ok(())
    }

    fn fill(&self, x: DevicePtr, n: usize, alpha: f32, incx: usize) -> Result<()> {
        let mut state = self.state.lock();
        let data = state.f32s_mut(x)?;
        check_span(n, incx, data.len())?;
        let geometry = try_grid_for(n)?;
        if self.launch_fails("fill") {
            return Ok(());
        }
        for_each_index(geometry, n, |i| data[i * incx] = alpha);
        Ok(())
    }

    fn axpy(&self, n: usize, alpha: f32, x: DevicePtr, incx: usize, y: DevicePtr, incy: usize) -> Result<()> {
        let mut state = self.state.lock();
        let (x_device, y_device) = (state.allocation(x)?.device, state.allocation(y)?.device);
        if x_device != y_device {
            return Err(BackendError::DeviceMismatch { expected: y_device, actual: x_device });
        }
        let xs = state.f32s(x)?;
        check_span(n, incx, xs.len())?;
        let xs: Vec<f32> = (0..n).map(|i| xs[i * incx]).collect();
        let ys = state.f32s_mut(y)?;
        check_span(n, incy, ys.len())?;
        let geometry = try_grid_for(n)?;
        if self.launch_fails("axpy") {
            return Ok(());
        }
        for_each_index(geometry, n, |i| ys[i * incy] += alpha * xs[i]);
        Ok(())
    }

    fn dot(&self, n: usize, x: DevicePtr, incx: usize, y: DevicePtr, incy: usize) -> Result<f32> {
        let state = self.state.lock();
        let (x_device, y_device) = (state.allocation(x)?.device, state.allocation(y)?.device);
        if x_device != y_device {
            return Err(BackendError::DeviceMismatch { expected: x_device, actual: y_device });
        }
        let xs = state.f32s(x)?;
        let ys = state.f32s(y)?;
        check_span(n, incx, xs.len())?;
        check_span(n, incy, ys.len())?;
        if let Some(reason) = self.pending_launch_failure.lock().take() {
            return Err(BackendError::KernelLaunch { kernel: "dot", reason });
        }
        Ok((0..n).map(|i| xs[i * incx] * ys[i * incy]).sum())
    }

    fn activate(&self, x: DevicePtr, n: usize, kind: ActivationKind, leaky_slope: f32) -> Result<()> {
        let mut state = self.state.lock();
        let data = state.f32s_mut(x)?;
        check_span(n, 1, data.len())?;
        let geometry = try_grid_for(n)?;
        if self.launch_fails("activate") {
            return Ok(());
        }
        for_each_index(geometry, n, |i| data[i] = kind.activate_with_slope(data[i], leaky_slope));
        Ok(())
    }

    fn create_handle(&self, device: DeviceIndex, kind: HandleKind, seed: u64) -> Result<HandleId> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        let id = HandleId(state.next_handle);
        state.next_handle += 1;
        let rng = match kind {
            HandleKind::Random => Some(StdRng::seed_from_u64(seed)),
            HandleKind::LinearAlgebra | HandleKind::TensorOp => None,
        };
        state.handles.insert(id, HostHandle { device, kind, rng });
        Ok(id)
    }

    fn random_uniform(&self, generator: HandleId, x: DevicePtr, n: usize) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let allocation = state.allocations.get_mut(&x).ok_or(BackendError::InvalidPointer(x))?;
        let handle = state.handles.get_mut(&generator).ok_or(BackendError::UnknownHandle(generator.0))?;
        if handle.device != allocation.device {
            return Err(BackendError::DeviceMismatch { expected: handle.device, actual: allocation.device });
        }
        let (rng, data) = match (&mut handle.rng, &mut allocation.memory) {
            (Some(rng), HostMemory::F32(data)) => (rng, data),
            (None, _) => return Err(BackendError::UnknownHandle(generator.0)),
            (_, other) => {
                return Err(BackendError::ElementMismatch { expected: ElementKind::F32, actual: other.kind() });
            }
        };
        check_span(n, 1, data.len())?;
        let geometry = try_grid_for(n)?;
        if self.launch_fails("random_uniform") {
            return Ok(());
        }
        // cuRAND's uniform range is (0, 1]
        for_each_index(geometry, n, |i| data[i] = 1.0 - rng.gen::<f32>());
        Ok(())
    }
}
