//! # ember-kernels
//!
//! Accelerator backend for the ember neural-network library.
//!
//! Provides:
//! - Device selection through a [`DeviceContext`] (forkable per thread)
//! - Lazily created per-device library handles (linear algebra, tensor ops, RNG)
//! - Float and int device buffers with explicit host↔device copies
//! - Launch geometry for per-element kernels, folded to 2D for large launches
//! - The activation registry and per-element activation kernels
//! - RMS comparison of device results against host references
//!
//! The default build runs on [`HostRuntime`], an emulated accelerator in host
//! memory. The `cuda` feature adds `CudaRuntime` (cudarc + NVRTC).
//!
//! ```
//! use ember_kernels::{BackendConfig, DeviceContext};
//!
//! let ctx = DeviceContext::host(BackendConfig::default()).unwrap();
//! let arena = ctx.arena();
//! let buf = arena.alloc_floats(Some(&[1.0, -2.0, 3.0]), 3).unwrap();
//! ctx.kernels().activate_named(&buf, 3, "relu").unwrap();
//! assert_eq!(arena.to_host::<f32>(&buf).unwrap(), vec![1.0, 0.0, 3.0]);
//! arena.free(buf).unwrap();
//! ```

pub mod activation;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod handles;
pub mod host_math;
pub mod kernels;
pub mod launch;
pub mod memory;
pub mod report;
pub mod runtime;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use activation::{ActivationKind, ActivationRegistry};
pub use config::BackendConfig;
pub use context::DeviceContext;
pub use diagnostics::Diagnostics;
pub use error::{BackendError, Result};
pub use handles::{Handle, HandleCache};
pub use kernels::Kernels;
pub use launch::{grid_for, try_grid_for, LaunchGeometry, BLOCK};
pub use memory::{DeviceBuffer, DeviceElement, MemoryArena};
pub use report::ErrorReporter;
pub use runtime::{DeviceIndex, DevicePtr, ElementKind, HandleKind, HostRuntime, Runtime};

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
