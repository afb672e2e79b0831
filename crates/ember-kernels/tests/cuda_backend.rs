//! GPU integration tests for the CUDA runtime.
//! Run with: cargo test -p ember-kernels --features cuda -- --nocapture

#![cfg(feature = "cuda")]

use ember_kernels::{ActivationKind, BackendConfig, BackendError, CudaRuntime, DeviceContext};

fn context() -> DeviceContext {
    DeviceContext::cuda(BackendConfig::default().with_seed(3)).expect("CUDA device")
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
    }
}

#[test]
fn test_cuda_available() {
    assert!(CudaRuntime::is_available());
}

#[test]
fn test_cuda_roundtrip() {
    let ctx = context();
    let arena = ctx.arena();
    let data = [1.0f32, -2.5, 3.25, 0.0];
    let buf = arena.alloc_floats(Some(&data), 4).unwrap();
    assert_eq!(arena.to_host::<f32>(&buf).unwrap(), data);
    arena.free(buf).unwrap();
}

#[test]
fn test_cuda_zero_fill_large() {
    let ctx = context();
    let n = 70_000 * ember_kernels::BLOCK;
    let buf = ctx.arena().alloc_floats(None, n).unwrap();
    assert_eq!(ctx.diagnostics().magnitude(&buf, n), Ok(0.0));
    ctx.arena().free(buf).unwrap();
}

#[test]
fn test_cuda_axpy_dot() {
    let ctx = context();
    let arena = ctx.arena();
    let x = arena.alloc_floats(Some(&[1.0, 2.0, 3.0]), 3).unwrap();
    let y = arena.alloc_floats(Some(&[1.0, 1.0, 1.0]), 3).unwrap();
    ctx.kernels().axpy(3, 2.0, &x, 1, &y, 1).unwrap();
    assert_eq!(arena.to_host::<f32>(&y).unwrap(), vec![3.0, 5.0, 7.0]);
    assert_eq!(ctx.kernels().dot(3, &x, 1, &y, 1), Ok(34.0));
}

#[test]
fn test_cuda_activations_match_host() {
    let ctx = context();
    let input: Vec<f32> = (-40..40).map(|i| i as f32 * 0.1).collect();
    for kind in ActivationKind::ALL {
        let buf = ctx.arena().alloc_floats(Some(&input), input.len()).unwrap();
        ctx.kernels().activate(&buf, input.len(), kind).unwrap();
        let expected: Vec<f32> = input.iter().map(|&x| kind.activate(x)).collect();
        assert_close(&ctx.arena().to_host::<f32>(&buf).unwrap(), &expected, 1e-5);
        ctx.arena().free(buf).unwrap();
    }
}

#[test]
fn test_cuda_random_uniform() {
    let ctx = context();
    let buf = ctx.arena().alloc_floats(None, 1024).unwrap();
    ctx.kernels().random_uniform(&buf, 1024).unwrap();
    let out = ctx.arena().to_host::<f32>(&buf).unwrap();
    assert!(out.iter().all(|&v| v > 0.0 && v <= 1.0));
}

#[test]
fn test_cuda_handles() {
    let ctx = context();
    let blas = ctx.linear_algebra_handle().unwrap();
    let dnn = ctx.tensor_handle().unwrap();
    assert_ne!(blas.id, dnn.id);
    assert_eq!(ctx.linear_algebra_handle().unwrap(), blas);
}

#[test]
fn test_cuda_free_unknown() {
    let ctx = context();
    let arena = ctx.arena();
    let buf = arena.alloc_ints(None, 2).unwrap();
    let ptr = buf.ptr();
    arena.free(buf).unwrap();
    let err = ctx.runtime().free(ptr).unwrap_err();
    assert_eq!(err, BackendError::InvalidPointer(ptr));
}
