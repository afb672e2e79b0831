//! Host-side vector routines used to check device results.
//!
//! Strided access follows the BLAS convention: element `i` of a vector with
//! increment `inc` is `x[i * inc]`. Elements past the end of a slice are
//! skipped, so a short slice shortens the operation instead of panicking.

/// `y[i * incy] += alpha * x[i * incx]` for `i < n`.
pub fn axpy(n: usize, alpha: f32, x: &[f32], incx: usize, y: &mut [f32], incy: usize) {
    let xs = x.iter().step_by(incx.max(1));
    let ys = y.iter_mut().step_by(incy.max(1));
    for (yi, xi) in ys.zip(xs).take(n) {
        *yi += alpha * xi;
    }
}

/// `sum(x[i * incx] * y[i * incy])` for `i < n`.
pub fn dot(n: usize, x: &[f32], incx: usize, y: &[f32], incy: usize) -> f32 {
    let xs = x.iter().step_by(incx.max(1));
    let ys = y.iter().step_by(incy.max(1));
    xs.zip(ys).take(n).map(|(a, b)| a * b).sum()
}

/// `x[i * incx] = alpha` for `i < n`.
pub fn fill(n: usize, alpha: f32, x: &mut [f32], incx: usize) {
    for v in x.iter_mut().step_by(incx.max(1)).take(n) {
        *v = alpha;
    }
}

/// Euclidean norm `sqrt(sum(x_i^2))`.
pub fn magnitude(x: &[f32]) -> f32 {
    x.iter().map(|v| v * v).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_axpy() {
        let x = [1.0, 2.0, 3.0];
        let mut y = [10.0, 10.0, 10.0];
        axpy(3, -1.0, &x, 1, &mut y, 1);
        assert_eq!(y, [9.0, 8.0, 7.0]);
    }

    #[test]
    fn test_axpy_strided() {
        let x = [1.0, 0.0, 2.0, 0.0];
        let mut y = [0.0; 6];
        axpy(2, 2.0, &x, 2, &mut y, 3);
        assert_eq!(y, [2.0, 0.0, 0.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_short_slices() {
        let mut y = [1.0; 2];
        axpy(5, 1.0, &[1.0; 5], 1, &mut y, 1);
        assert_eq!(y, [2.0, 2.0]);
        assert_eq!(dot(10, &[1.0, 2.0], 1, &[3.0, 4.0, 5.0], 1), 11.0);
    }

    #[test]
    fn test_fill() {
        let mut x = [1.0; 5];
        fill(3, 0.0, &mut x, 2);
        assert_eq!(x, [0.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_magnitude() {
        assert_eq!(magnitude(&[3.0, 4.0]), 5.0);
        assert_eq!(magnitude(&[]), 0.0);
    }

    proptest! {
        #[test]
        fn prop_self_dot_is_squared_magnitude(v in prop::collection::vec(-100.0f32..100.0, 0..64)) {
            let d = dot(v.len(), &v, 1, &v, 1);
            let m = magnitude(&v);
            prop_assert!((d.sqrt() - m).abs() <= 1e-3 * m.max(1.0));
        }
    }
}
