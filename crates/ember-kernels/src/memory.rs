//! Device buffers and host↔device transfers.

use std::fmt;

use crate::context::DeviceContext;
use crate::error::{BackendError, Result};
use crate::runtime::{DeviceIndex, DevicePtr, ElementKind, HostSlice, HostSliceMut};

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for i32 {}
}

/// Element types a device buffer can hold.
pub trait DeviceElement: sealed::Sealed + Copy + Send + Sync + 'static {
    const KIND: ElementKind;

    fn host_slice(data: &[Self]) -> HostSlice<'_>;

    fn host_slice_mut(data: &mut [Self]) -> HostSliceMut<'_>;
}

impl DeviceElement for f32 {
    const KIND: ElementKind = ElementKind::F32;

    fn host_slice(data: &[Self]) -> HostSlice<'_> {
        HostSlice::F32(data)
    }

    fn host_slice_mut(data: &mut [Self]) -> HostSliceMut<'_> {
        HostSliceMut::F32(data)
    }
}

impl DeviceElement for i32 {
    const KIND: ElementKind = ElementKind::I32;

    fn host_slice(data: &[Self]) -> HostSlice<'_> {
        HostSlice::I32(data)
    }

    fn host_slice_mut(data: &mut [Self]) -> HostSliceMut<'_> {
        HostSliceMut::I32(data)
    }
}

/// An allocation on one device.
///
/// Buffers have exactly one owner and are released only by
/// [`MemoryArena::free`]. Dropping a buffer without freeing it leaks the
/// device allocation.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "device buffers must be released with MemoryArena::free"]
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    kind: ElementKind,
    device: DeviceIndex,
}

impl DeviceBuffer {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Device the buffer was allocated on.
    pub fn device(&self) -> DeviceIndex {
        self.device
    }
}

impl fmt::Display for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{} on device {}", self.kind, self.len, self.ptr, self.device)
    }
}

/// Allocation and transfer operations of a [`DeviceContext`].
///
/// New buffers land on the context's current device. Every failure is
/// reported through the context's reporter and returned.
#[derive(Debug, Clone, Copy)]
pub struct MemoryArena<'a> {
    ctx: &'a DeviceContext,
}

impl<'a> MemoryArena<'a> {
    pub(crate) fn new(ctx: &'a DeviceContext) -> Self {
        Self { ctx }
    }

    /// Allocate `n` floats. With `src`, its first `n` values are copied in;
    /// otherwise the buffer is zero-filled by the fill kernel.
    pub fn alloc_floats(&self, src: Option<&[f32]>, n: usize) -> Result<DeviceBuffer> {
        let buf = self.alloc::<f32>(src, n, "alloc_floats")?;
        if src.is_none() {
            if let Err(e) = self.ctx.kernels().fill(&buf, n, 0.0, 1) {
                self.release(buf);
                return Err(e);
            }
        }
        Ok(buf)
    }

    /// Allocate `n` ints, copying the first `n` values of `src` if given.
    /// Without a source the contents are unspecified.
    pub fn alloc_ints(&self, src: Option<&[i32]>, n: usize) -> Result<DeviceBuffer> {
        self.alloc::<i32>(src, n, "alloc_ints")
    }

    fn alloc<T: DeviceElement>(&self, src: Option<&[T]>, n: usize, op: &'static str) -> Result<DeviceBuffer> {
        let reporter = self.ctx.reporter();
        let runtime = self.ctx.runtime();
        if let Some(src) = src {
            if src.len() < n {
                let e = BackendError::SizeMismatch { expected: n, actual: src.len() };
                reporter.report(op, &e);
                return Err(e);
            }
        }

        let device = self.ctx.current_device();
        let ptr = reporter.check(runtime, op, runtime.alloc(device, T::KIND, n))?;
        let buf = DeviceBuffer { ptr, len: n, kind: T::KIND, device };
        tracing::trace!(%buf, "allocated");

        if let Some(src) = src {
            if let Err(e) = self.copy_host_to_device(&buf, &src[..n]) {
                self.release(buf);
                return Err(e);
            }
        }
        Ok(buf)
    }

    /// Copy `src` into the first `src.len()` elements of `buf`.
    pub fn copy_host_to_device<T: DeviceElement>(&self, buf: &DeviceBuffer, src: &[T]) -> Result<()> {
        let runtime = self.ctx.runtime();
        let status = runtime.copy_host_to_device(buf.ptr, T::host_slice(src));
        self.ctx.reporter().check(runtime, "copy_host_to_device", status)
    }

    /// Copy the first `dst.len()` elements of `buf` into `dst`.
    pub fn copy_device_to_host<T: DeviceElement>(&self, buf: &DeviceBuffer, dst: &mut [T]) -> Result<()> {
        let runtime = self.ctx.runtime();
        let status = runtime.copy_device_to_host(buf.ptr, T::host_slice_mut(dst));
        self.ctx.reporter().check(runtime, "copy_device_to_host", status)
    }

    /// Copy the whole buffer back into a new host vector.
    pub fn to_host<T: DeviceElement + Default>(&self, buf: &DeviceBuffer) -> Result<Vec<T>> {
        let mut out = vec![T::default(); buf.len];
        self.copy_device_to_host(buf, &mut out)?;
        Ok(out)
    }

    /// Release `buf`.
    pub fn free(&self, buf: DeviceBuffer) -> Result<()> {
        let runtime = self.ctx.runtime();
        let status = runtime.free(buf.ptr);
        self.ctx.reporter().check(runtime, "free", status)
    }

    /// Free after a failed initialization; the caller returns the first error.
    fn release(&self, buf: DeviceBuffer) {
        let _ = self.free(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::runtime::HostRuntime;
    use std::sync::Arc;

    fn ctx() -> (Arc<HostRuntime>, DeviceContext) {
        let runtime = Arc::new(HostRuntime::new(2));
        let ctx = DeviceContext::new(runtime.clone(), BackendConfig::default()).unwrap();
        (runtime, ctx)
    }

    #[test]
    fn test_alloc_floats_zeroed() {
        let (_, ctx) = ctx();
        let arena = ctx.arena();
        let buf = arena.alloc_floats(None, 1000).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.kind(), ElementKind::F32);
        assert_eq!(arena.to_host::<f32>(&buf).unwrap(), vec![0.0; 1000]);
        arena.free(buf).unwrap();
    }

    #[test]
    fn test_alloc_copies_prefix() {
        let (_, ctx) = ctx();
        let arena = ctx.arena();
        let buf = arena.alloc_floats(Some(&[1.0, 2.0, 3.0, 4.0]), 2).unwrap();
        assert_eq!(arena.to_host::<f32>(&buf).unwrap(), vec![1.0, 2.0]);
        let ints = arena.alloc_ints(Some(&[7, -8, 9]), 3).unwrap();
        assert_eq!(arena.to_host::<i32>(&ints).unwrap(), vec![7, -8, 9]);
    }

    #[test]
    fn test_short_source_rejected() {
        let (runtime, ctx) = ctx();
        let err = ctx.arena().alloc_floats(Some(&[1.0]), 4).unwrap_err();
        assert_eq!(err, BackendError::SizeMismatch { expected: 4, actual: 1 });
        assert_eq!(runtime.live_allocations(), 0);
        assert_eq!(ctx.reporter().failures(), 1);
    }

    #[test]
    fn test_alloc_on_current_device() {
        let (runtime, ctx) = ctx();
        ctx.set_device(1).unwrap();
        let buf = ctx.arena().alloc_ints(None, 8).unwrap();
        assert_eq!(buf.device(), 1);
        assert_eq!(runtime.bytes_in_use(1), 32);
        assert_eq!(runtime.bytes_in_use(0), 0);
    }

    #[test]
    fn test_failed_zero_fill_is_reported() {
        let (runtime, ctx) = ctx();
        runtime.fail_next_launch("fill aborted");
        // launches are asynchronous: the buffer is handed out, the failure is logged
        let buf = ctx.arena().alloc_floats(None, 4).unwrap();
        assert_eq!(ctx.reporter().failures(), 1);
        assert!(ctx.arena().to_host::<f32>(&buf).unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_out_of_memory_reported() {
        let runtime = Arc::new(HostRuntime::new(1).with_memory_limit(16));
        let ctx = DeviceContext::new(runtime, BackendConfig::default()).unwrap();
        let err = ctx.arena().alloc_floats(None, 5).unwrap_err();
        assert!(matches!(err, BackendError::AllocationFailed { elements: 5, .. }));
        assert_eq!(ctx.reporter().failures(), 1);
    }

    #[test]
    fn test_element_kind_checked() {
        let (_, ctx) = ctx();
        let arena = ctx.arena();
        let ints = arena.alloc_ints(None, 2).unwrap();
        let err = arena.copy_host_to_device(&ints, &[1.0f32, 2.0]).unwrap_err();
        assert_eq!(err, BackendError::ElementMismatch { expected: ElementKind::F32, actual: ElementKind::I32 });
    }

    #[test]
    fn test_double_free() {
        let (_, ctx) = ctx();
        let arena = ctx.arena();
        let buf = arena.alloc_ints(None, 1).unwrap();
        let ptr = buf.ptr();
        let stale = DeviceBuffer { ptr, len: 1, kind: ElementKind::I32, device: 0 };
        arena.free(buf).unwrap();
        assert_eq!(arena.free(stale), Err(BackendError::InvalidPointer(ptr)));
        assert_eq!(ctx.reporter().failures(), 1);
    }
}
