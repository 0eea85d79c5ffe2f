//! Inner compute kernels: matmul (float and int8-grouped), RMSNorm,
//! softmax and SwiGLU.
//!
//! The matmul kernels operate on a contiguous sub-range of output rows so a
//! worker pool can partition the output dimension across threads; callers
//! hand each worker `out[i0..dlim]` together with the matching weight rows
//! `w[i0 * n..dlim * n]`. The per-row accumulation order is independent of
//! the partitioning, which keeps results bit-identical across thread counts.

/// `out[i] = sum_j w[i, j] * x[j]` for the rows covered by `out`.
///
/// `w` holds exactly `out.len()` rows of length `x.len()`.
pub fn matmul(out: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    debug_assert_eq!(w.len(), out.len() * n);

    for (o, row) in out.iter_mut().zip(w.chunks_exact(n)) {
        let mut acc = 0.0f32;
        for (wv, xv) in row.iter().zip(x) {
            acc += wv * xv;
        }
        *o = acc;
    }
}

/// Int8-grouped matmul over a sub-range of output rows.
///
/// `xq`/`xs` are the quantized input and its per-group scales; `wq`/`ws`
/// hold the weight rows matching `out` and their scales. Each group of
/// `group_size` products accumulates in i32 before being scaled into the
/// f32 total, mirroring the checkpoint's quantization granularity.
pub fn matmul_q8(
    out: &mut [f32],
    xq: &[i8],
    xs: &[f32],
    wq: &[i8],
    ws: &[f32],
    group_size: usize,
) {
    let n = xq.len();
    debug_assert_eq!(wq.len(), out.len() * n);
    debug_assert_eq!(n % group_size, 0);

    let groups_per_row = n / group_size;

    for (i, o) in out.iter_mut().enumerate() {
        let row_q = &wq[i * n..(i + 1) * n];
        let row_s = &ws[i * groups_per_row..(i + 1) * groups_per_row];

        let mut val = 0.0f32;
        for g in 0..groups_per_row {
            let j = g * group_size;
            let mut ival = 0i32;
            for k in 0..group_size {
                ival += xq[j + k] as i32 * row_q[j + k] as i32;
            }
            val += ival as f32 * row_s[g] * xs[g];
        }
        *o = val;
    }
}

/// RMS normalization: `out[j] = w[j] * x[j] / sqrt(mean(x^2) + 1e-5)`.
pub fn rmsnorm(out: &mut [f32], x: &[f32], w: &[f32]) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(out.len(), w.len());

    let mut ss = 0.0f32;
    for &v in x {
        ss += v * v;
    }
    ss /= x.len() as f32;
    ss += 1e-5;
    ss = 1.0 / ss.sqrt();

    for ((o, &xv), &wv) in out.iter_mut().zip(x).zip(w) {
        *o = wv * (ss * xv);
    }
}

/// In-place softmax with max-shift for numerical stability.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));

    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// SwiGLU gate: `hb[i] = hb[i] * sigmoid(hb[i]) * hb2[i]`.
pub fn swiglu(hb: &mut [f32], hb2: &[f32]) {
    debug_assert_eq!(hb.len(), hb2.len());

    for (h, &h2) in hb.iter_mut().zip(hb2) {
        let silu = *h * (1.0 / (1.0 + (-*h).exp()));
        *h = silu * h2;
    }
}
