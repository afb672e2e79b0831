//! Kernel launch geometry.
//!
//! Per-element kernels run `BLOCK` threads per block. A 1D grid is capped at
//! `MAX_GRID_DIM` blocks per axis, so large launches are folded into a 2D grid
//! that still covers every element.

use crate::error::{BackendError, Result};

/// Threads per block for every per-element kernel.
pub const BLOCK: usize = 512;

/// Maximum number of blocks along one grid axis.
pub const MAX_GRID_DIM: usize = 65535;

/// Grid shape of a kernel launch. `z` is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchGeometry {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl LaunchGeometry {
    /// Total number of launched threads (`x * y * z * BLOCK`).
    pub fn threads(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize * BLOCK
    }

    /// Number of blocks in the grid.
    pub fn blocks(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize
    }

    /// Global element index of `thread` in block `(block_x, block_y)`.
    ///
    /// Matches the indexing used by the device kernels:
    /// `(blockIdx.x + blockIdx.y * gridDim.x) * blockDim.x + threadIdx.x`.
    pub fn linear_index(&self, block_x: u32, block_y: u32, thread: usize) -> usize {
        (block_x as usize + block_y as usize * self.x as usize) * BLOCK + thread
    }

    /// cudarc launch configuration for this grid.
    #[cfg(feature = "cuda")]
    pub fn to_launch_config(self) -> cudarc::driver::LaunchConfig {
        cudarc::driver::LaunchConfig {
            grid_dim: (self.x, self.y, self.z),
            block_dim: (BLOCK as u32, 1, 1),
            shared_mem_bytes: 0,
        }
    }
}

/// Grid covering `n` elements.
///
/// `k = ceil(n / BLOCK)` blocks fit a 1D grid when `k <= MAX_GRID_DIM`.
/// Otherwise the grid becomes `x = ceil(sqrt(k))` by `y = ceil(n / (x * BLOCK))`.
/// An empty launch still gets one block; kernels bound-check their index.
pub fn grid_for(n: usize) -> LaunchGeometry {
    let k = n.div_ceil(BLOCK).max(1);
    if k <= MAX_GRID_DIM {
        return LaunchGeometry { x: k as u32, y: 1, z: 1 };
    }
    let x = ceil_sqrt(k);
    let y = n.div_ceil(x * BLOCK);
    LaunchGeometry {
        x: x as u32,
        y: u32::try_from(y).unwrap_or(u32::MAX),
        z: 1,
    }
}

/// Like [`grid_for`], but fails when the folded grid exceeds `MAX_GRID_DIM`
/// on either axis.
pub fn try_grid_for(n: usize) -> Result<LaunchGeometry> {
    let geometry = grid_for(n);
    if geometry.x as usize > MAX_GRID_DIM || geometry.y as usize > MAX_GRID_DIM {
        return Err(BackendError::LaunchTooLarge { n });
    }
    Ok(geometry)
}

fn ceil_sqrt(k: usize) -> usize {
    let mut x = (k as f64).sqrt().ceil() as usize;
    while x > 1 && (x - 1) * (x - 1) >= k {
        x -= 1;
    }
    while x * x < k {
        x += 1;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_launch_is_1d() {
        assert_eq!(grid_for(1), LaunchGeometry { x: 1, y: 1, z: 1 });
        assert_eq!(grid_for(BLOCK), LaunchGeometry { x: 1, y: 1, z: 1 });
        assert_eq!(grid_for(BLOCK + 1), LaunchGeometry { x: 2, y: 1, z: 1 });
    }

    #[test]
    fn test_empty_launch() {
        let g = grid_for(0);
        assert_eq!(g, LaunchGeometry { x: 1, y: 1, z: 1 });
    }

    #[test]
    fn test_1d_limit() {
        let n = MAX_GRID_DIM * BLOCK;
        assert_eq!(grid_for(n), LaunchGeometry { x: MAX_GRID_DIM as u32, y: 1, z: 1 });
    }

    #[test]
    fn test_folds_to_2d() {
        let n = MAX_GRID_DIM * BLOCK + 1;
        let g = grid_for(n);
        // k = 65536 -> x = 256, y = ceil(n / (256 * 512)) = 256
        assert_eq!(g.x, 256);
        assert_eq!(g.y, 256);
        assert_eq!(g.z, 1);
        assert!(g.threads() >= n);
    }

    #[test]
    fn test_ceil_sqrt() {
        assert_eq!(ceil_sqrt(1), 1);
        assert_eq!(ceil_sqrt(4), 2);
        assert_eq!(ceil_sqrt(5), 3);
        assert_eq!(ceil_sqrt(65536), 256);
        assert_eq!(ceil_sqrt(65537), 257);
    }

    #[test]
    fn test_linear_index() {
        let g = LaunchGeometry { x: 4, y: 3, z: 1 };
        assert_eq!(g.linear_index(0, 0, 0), 0);
        assert_eq!(g.linear_index(1, 0, 7), BLOCK + 7);
        assert_eq!(g.linear_index(0, 1, 0), 4 * BLOCK);
        assert_eq!(g.linear_index(3, 2, BLOCK - 1), g.threads() - 1);
    }

    #[test]
    fn test_try_grid_for_limit() {
        assert!(try_grid_for(1 << 31).is_ok());
        let too_big = (MAX_GRID_DIM + 1) * (MAX_GRID_DIM + 1) * BLOCK;
        assert_eq!(try_grid_for(too_big), Err(BackendError::LaunchTooLarge { n: too_big }));
    }

    proptest! {
        #[test]
        fn grid_covers_all_elements(n in 1usize..=(1usize << 31)) {
            let g = grid_for(n);
            prop_assert!(g.threads() >= n);
            prop_assert!(g.x as usize <= MAX_GRID_DIM);
            prop_assert_eq!(g.z, 1);
        }

        #[test]
        fn grid_stays_1d_below_limit(n in 1usize..=(MAX_GRID_DIM * BLOCK)) {
            let g = grid_for(n);
            prop_assert_eq!(g.y, 1);
            prop_assert_eq!(g.x as usize, n.div_ceil(BLOCK));
        }

        #[test]
        fn grid_has_no_spare_row(n in (MAX_GRID_DIM * BLOCK + 1)..=(1usize << 40)) {
            let g = grid_for(n);
            prop_assert!(g.threads() >= n);
            // dropping the last row would leave elements uncovered
            prop_assert!((g.y as usize - 1) * g.x as usize * BLOCK < n);
            prop_assert!(g.y as usize <= MAX_GRID_DIM);
        }
    }
}
