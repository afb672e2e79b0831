//! NVRTC compilation and per-device module cache.

use std::collections::HashSet;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaFunction};
use parking_lot::Mutex;

use crate::error::{BackendError, Result};

/// A CUDA C source file and the kernels it exports.
#[derive(Debug, Clone, Copy)]
pub struct KernelModule {
    pub name: &'static str,
    pub source: &'static str,
    pub functions: &'static [&'static str],
}

pub const BLAS: KernelModule = KernelModule {
    name: "ember_blas",
    source: include_str!("kernels/blas.cu"),
    functions: &["fill_kernel", "axpy_kernel", "dot_kernel"],
};

pub const ACTIVATIONS: KernelModule = KernelModule {
    name: "ember_activations",
    source: include_str!("kernels/activations.cu"),
    functions: &["activate_array_kernel"],
};

/// Modules already loaded, keyed by `(device, module)`.
#[derive(Debug, Default)]
pub struct ModuleCache {
    loaded: Mutex<HashSet<(usize, &'static str)>>,
}

impl ModuleCache {
    /// Compile and load `module` on `device` unless already loaded.
    pub fn ensure(&self, device: &Arc<CudaDevice>, index: usize, module: &KernelModule) -> Result<()> {
        let mut loaded = self.loaded.lock();
        if loaded.contains(&(index, module.name)) {
            return Ok(());
        }

        let ptx = cudarc::nvrtc::compile_ptx(module.source).map_err(|e| BackendError::PtxCompile {
            module: module.name.to_string(),
            msg: e.to_string(),
        })?;
        device
            .load_ptx(ptx, module.name, module.functions)
            .map_err(|e| BackendError::PtxCompile {
                module: module.name.to_string(),
                msg: e.to_string(),
            })?;

        tracing::debug!(device = index, module = module.name, "loaded kernel module");
        loaded.insert((index, module.name));
        Ok(())
    }

    /// Kernel `func` of `module`, loading the module first if needed.
    pub fn func(
        &self,
        device: &Arc<CudaDevice>,
        index: usize,
        module: &KernelModule,
        func: &str,
    ) -> Result<CudaFunction> {
        self.ensure(device, index, module)?;
        device.get_func(module.name, func).ok_or_else(|| BackendError::FuncNotFound {
            module: module.name.to_string(),
            func: func.to_string(),
        })
    }
}
