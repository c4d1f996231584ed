use ndarray::{s, Array4, ArrayD, ArrayView4, Ix4};

use crate::errors::{FuseError, FuseResult};
use crate::fuse::context::FUSE_AXES;
use crate::types::Gap;

/// Extent of one fused axis: `k` tiles separated by `k - 1` gap strips.
pub fn fused_extent(tile: usize, k: usize, gap: usize) -> usize {
    k * tile + (k - 1) * gap
}

/// Fused-form shape of a batched sample shape: fused axes grow to their
/// tiled extents and the batch axis collapses to one. `batch_pos` is the
/// current position of the batch axis, `None` once it has been squeezed
/// away.
pub fn fused_shape(sample: &[usize], k: usize, gap: Gap, batch_pos: Option<usize>) -> Vec<usize> {
    sample
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if i == FUSE_AXES[0] {
                fused_extent(d, k, gap[0])
            } else if i == FUSE_AXES[1] {
                fused_extent(d, k, gap[1])
            } else if Some(i) == batch_pos {
                1
            } else {
                d
            }
        })
        .collect()
}

fn view4(x: &ArrayD<f32>) -> FuseResult<ArrayView4<'_, f32>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| FuseError::ShapeMismatch { expected: vec![4], found: vec![x.ndim()] })
}

/// Tiles `N = k²` samples of a `[C, W, H, N]` tensor into a row-major
/// `k × k` grid with zero-filled gap strips, yielding `[C, Wf, Hf, 1]`.
/// Sample `n` lands at grid row `n / k` (along H) and column `n % k`
/// (along W).
pub fn fuse_layout(x: &ArrayD<f32>, k: usize, gap: Gap) -> FuseResult<ArrayD<f32>> {
    let x4 = view4(x)?;
    let (c, w, h, n) = x4.dim();
    if n != k * k {
        return Err(FuseError::ShapeMismatch { expected: vec![k * k], found: vec![n] });
    }
    let mut out = Array4::<f32>::zeros((c, fused_extent(w, k, gap[0]), fused_extent(h, k, gap[1]), 1));
    for sample in 0..n {
        let col = sample % k;
        let row = sample / k;
        let w0 = col * (w + gap[0]);
        let h0 = row * (h + gap[1]);
        out.slice_mut(s![.., w0..w0 + w, h0..h0 + h, 0..1])
            .assign(&x4.slice(s![.., .., .., sample..sample + 1]));
    }
    Ok(out.into_dyn())
}

/// Inverse of [`fuse_layout`]: extracts the `k²` tiles of extent `tile`
/// at pitch `tile + gap` back into a batched `[C, W, H, N]` tensor.
pub fn unfuse_layout(y: &ArrayD<f32>, k: usize, tile: Gap, gap: Gap) -> FuseResult<ArrayD<f32>> {
    let y4 = view4(y)?;
    let (c, wf, hf, b) = y4.dim();
    let expected = [fused_extent(tile[0], k, gap[0]), fused_extent(tile[1], k, gap[1]), 1];
    if [wf, hf, b] != expected {
        return Err(FuseError::ShapeMismatch {
            expected: expected.to_vec(),
            found: vec![wf, hf, b],
        });
    }
    let mut out = Array4::<f32>::zeros((c, tile[0], tile[1], k * k));
    for sample in 0..k * k {
        let col = sample % k;
        let row = sample / k;
        let w0 = col * (tile[0] + gap[0]);
        let h0 = row * (tile[1] + gap[1]);
        out.slice_mut(s![.., .., .., sample..sample + 1])
            .assign(&y4.slice(s![.., w0..w0 + tile[0], h0..h0 + tile[1], 0..1]));
    }
    Ok(out.into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn fuse_then_unfuse_is_identity() {
        let x = Array::from_shape_fn((2, 3, 4, 4), |(c, w, h, n)| {
            (c * 1000 + w * 100 + h * 10 + n) as f32
        })
        .into_dyn();
        let fused = fuse_layout(&x, 2, [1, 2]).unwrap();
        assert_eq!(fused.shape(), &[2, 7, 10, 1]);
        let back = unfuse_layout(&fused, 2, [3, 4], [1, 2]).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn gap_pixels_are_zero() {
        let x = Array::<f32, _>::ones((1, 2, 2, 4)).into_dyn();
        let fused = fuse_layout(&x, 2, [1, 1]).unwrap();
        // Column 2 is the vertical gap strip.
        assert_eq!(fused[[0, 2, 0, 0]], 0.0);
        assert_eq!(fused[[0, 0, 2, 0]], 0.0);
        assert_eq!(fused[[0, 0, 0, 0]], 1.0);
    }

    #[test]
    fn fused_shape_collapses_batch() {
        assert_eq!(fused_shape(&[1, 4, 4, 4], 2, [1, 1], Some(3)), vec![1, 9, 9, 1]);
        assert_eq!(fused_shape(&[4, 4, 4, 1], 2, [0, 0], Some(0)), vec![1, 8, 8, 1]);
    }
}
