//! Group-wise symmetric int8 quantization.
//!
//! Weights and activations are stored as int8 values with one `f32` scale
//! per `group_size` consecutive elements; reconstruction is
//! `q[i] * s[i / group_size]`. Activations are quantized on the fly into a
//! session-owned scratch buffer, weights arrive pre-quantized from the
//! checkpoint.

use rayon::prelude::*;

const Q_MAX: f32 = 127.0;

/// Reusable quantized-activation scratch: `q` holds int8 values, `s` one
/// scale per group.
#[derive(Debug, Clone)]
pub struct QuantBuf {
    pub q: Vec<i8>,
    pub s: Vec<f32>,
}

impl QuantBuf {
    /// Allocate scratch for `n` elements at the given group size.
    pub fn new(n: usize, group_size: usize) -> Self {
        Self {
            q: vec![0; n],
            s: vec![0.0; n / group_size],
        }
    }
}

/// Quantize `x` into `out` group by group: scale is the group's max
/// magnitude divided by 127, values are rounded to the nearest int8.
pub fn quantize(out: &mut QuantBuf, x: &[f32], group_size: usize) {
    debug_assert_eq!(x.len() % group_size, 0);
    debug_assert_eq!(out.q.len(), x.len());

    for (group, chunk) in x.chunks_exact(group_size).enumerate() {
        let wmax = chunk.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        let scale = if wmax > 0.0 { wmax / Q_MAX } else { 1.0 };
        out.s[group] = scale;

        let qs = &mut out.q[group * group_size..(group + 1) * group_size];
        for (q, &v) in qs.iter_mut().zip(chunk) {
            *q = (v / scale).round() as i8;
        }
    }
}

/// Reconstruct floats from quantized values and per-group scales.
pub fn dequantize(q: &[i8], s: &[f32], group_size: usize, out: &mut [f32]) {
    debug_assert_eq!(q.len(), out.len());
    debug_assert_eq!(q.len() % group_size, 0);

    for (i, o) in out.iter_mut().enumerate() {
        *o = q[i] as f32 * s[i / group_size];
    }
}

/// Parallel variant for large one-shot reconstructions such as the
/// token-embedding table at model construction.
pub fn dequantize_table(q: &[i8], s: &[f32], group_size: usize) -> Vec<f32> {
    q.par_chunks(group_size)
        .zip(s.par_iter())
        .flat_map_iter(|(chunk, &scale)| chunk.iter().map(move |&v| v as f32 * scale))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_reconstructs_within_group_error() {
        let x: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) / 7.0).collect();
        let mut buf = QuantBuf::new(64, 16);
        quantize(&mut buf, &x, 16);

        let mut back = vec![0.0; 64];
        dequantize(&buf.q, &buf.s, 16, &mut back);

        for (a, b) in x.iter().zip(&back) {
            // max error is half a quantization step
            assert!((a - b).abs() <= buf.s[0].max(buf.s.iter().cloned().fold(0.0, f32::max)));
        }
    }

    #[test]
    fn all_zero_group_uses_unit_scale() {
        let x = vec![0.0f32; 32];
        let mut buf = QuantBuf::new(32, 32);
        quantize(&mut buf, &x, 32);
        assert_eq!(buf.s[0], 1.0);
        assert!(buf.q.iter().all(|&q| q == 0));
    }

    #[test]
    fn dequantize_table_matches_serial() {
        let q: Vec<i8> = (0..128).map(|i| (i % 37) as i8 - 18).collect();
        let s: Vec<f32> = (0..4).map(|i| 0.01 * (i + 1) as f32).collect();

        let mut serial = vec![0.0; 128];
        dequantize(&q, &s, 32, &mut serial);
        assert_eq!(dequantize_table(&q, &s, 32), serial);
    }
}
