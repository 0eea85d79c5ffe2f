//! One token's traversal of the transformer layers.
//!
//! Per layer: RMSNorm, QKV projections straight into the current KV-cache
//! slot, RoPE rotation, grouped-query attention over the cached positions,
//! output projection and residual, then the SwiGLU FFN and its residual.
//! After the layers: final RMSNorm and the classifier matmul into the
//! logits. Every matmul is dispatched on the worker pool and waited for at
//! the session's barrier; everything else runs on the scheduler thread.

use std::sync::Arc;

use emberlm_core::{
    kernels,
    quant::{self, QuantBuf},
    CheckpointVersion, ModelConfig, Sampler, TokenId,
};
use emberlm_model::{Model, Weights};

use crate::error::Result;
use crate::pool::{Completion, WorkerPool};

/// Per-session activation buffers. All float scratch, the KV cache and the
/// logits live on one arena allocation, carved into disjoint views for each
/// step; the int8 scratch has its own storage since it mixes element types.
pub(crate) struct Activations {
    block: Vec<f32>,
    xq: QuantBuf,
    hq: QuantBuf,
    pub done: Arc<Completion>,
    dim: usize,
    hidden_dim: usize,
    kv_total: usize,
    vocab_size: usize,
    att_len: usize,
}

/// Disjoint mutable views over one session's arena.
struct ActView<'a> {
    /// residual stream (dim)
    x: &'a mut [f32],
    /// keys, all layers and positions (n_layers * seq_len * kv_dim)
    key_cache: &'a mut [f32],
    /// values, same shape as the keys
    value_cache: &'a mut [f32],
    /// classifier output (vocab_size)
    logits: &'a mut [f32],
    /// normalized activation / FFN output (dim)
    xb: &'a mut [f32],
    /// attention output (dim)
    xb2: &'a mut [f32],
    /// FFN gate (hidden_dim)
    hb: &'a mut [f32],
    /// FFN up-projection (hidden_dim)
    hb2: &'a mut [f32],
    /// query vector (dim)
    q: &'a mut [f32],
    /// attention scores (n_heads * seq_len)
    att: &'a mut [f32],
}

impl Activations {
    pub fn new(config: &ModelConfig) -> Self {
        let dim = config.dim;
        let hidden_dim = config.hidden_dim;
        let kv_total = config.n_layers * config.seq_len * config.kv_dim();
        let vocab_size = config.vocab_size;
        let att_len = config.n_heads * config.seq_len;

        let floats = dim + 2 * kv_total + vocab_size + 2 * dim + 2 * hidden_dim + dim + att_len;

        let (xq, hq) = match config.version {
            CheckpointVersion::Int8Grouped => (
                QuantBuf::new(dim, config.group_size),
                QuantBuf::new(hidden_dim, config.group_size),
            ),
            CheckpointVersion::Float32 => (QuantBuf::new(0, 1), QuantBuf::new(0, 1)),
        };

        Self {
            block: vec![0.0; floats],
            xq,
            hq,
            done: Arc::new(Completion::new()),
            dim,
            hidden_dim,
            kv_total,
            vocab_size,
            att_len,
        }
    }

    fn view(&mut self) -> (ActView<'_>, &mut QuantBuf, &mut QuantBuf) {
        let (x, rest) = self.block.split_at_mut(self.dim);
        let (key_cache, rest) = rest.split_at_mut(self.kv_total);
        let (value_cache, rest) = rest.split_at_mut(self.kv_total);
        let (logits, rest) = rest.split_at_mut(self.vocab_size);
        let (xb, rest) = rest.split_at_mut(self.dim);
        let (xb2, rest) = rest.split_at_mut(self.dim);
        let (hb, rest) = rest.split_at_mut(self.hidden_dim);
        let (hb2, rest) = rest.split_at_mut(self.hidden_dim);
        let (q, att) = rest.split_at_mut(self.dim);
        debug_assert_eq!(att.len(), self.att_len);

        (
            ActView {
                x,
                key_cache,
                value_cache,
                logits,
                xb,
                xb2,
                hb,
                hb2,
                q,
                att,
            },
            &mut self.xq,
            &mut self.hq,
        )
    }
}

/// Bytes a session's buffers occupy, for capacity planning and logging.
pub fn session_footprint(config: &ModelConfig) -> usize {
    let dim = config.dim;
    let hidden = config.hidden_dim;
    let kv_total = config.n_layers * config.seq_len * config.kv_dim();
    let floats =
        dim + 2 * kv_total + config.vocab_size + 2 * dim + 2 * hidden + dim + config.n_heads * config.seq_len;

    let quant_bytes = match config.version {
        CheckpointVersion::Int8Grouped => {
            dim + hidden + ((dim + hidden) / config.group_size) * 4
        }
        CheckpointVersion::Float32 => 0,
    };

    // plus the sampler's vocab-sized candidate buffer
    floats * 4 + quant_bytes + config.vocab_size * 8
}

/// Advance a session by one token at `pos`. Prompt steps run the full
/// network but return the input token, discarding the logits; generation
/// steps sample from them.
pub(crate) fn forward(
    model: &Model,
    pool: &WorkerPool,
    acts: &mut Activations,
    sampler: &mut Sampler,
    is_prompt: bool,
    token: TokenId,
    pos: usize,
) -> Result<TokenId> {
    let cfg = &model.config;
    let dim = cfg.dim;
    let kv_dim = cfg.kv_dim();
    let kv_mul = cfg.kv_mul();
    let head_size = cfg.head_size();
    let seq_len = cfg.seq_len;
    let gs = cfg.group_size;

    let done = Arc::clone(&acts.done);
    let (v, xq, hq) = acts.view();

    // token embedding into the residual stream
    match &model.weights {
        Weights::Float(w) => {
            let row = model.data.resolve(w.token_embedding.row(token as usize, dim))?;
            v.x.copy_from_slice(row.as_f32()?);
        }
        Weights::Q8 {
            token_embedding, ..
        } => {
            let start = token as usize * dim;
            v.x.copy_from_slice(&token_embedding[start..start + dim]);
        }
    }

    for l in 0..cfg.n_layers {
        let loff = l * seq_len * kv_dim;
        let kv_row = loff + pos * kv_dim..loff + (pos + 1) * kv_dim;

        // attention RMSNorm, then Q/K/V projections; K and V land directly
        // in this position's cache slot
        match &model.weights {
            Weights::Float(w) => {
                let rms = model.data.resolve(w.rms_att.layer(l))?;
                kernels::rmsnorm(v.xb, v.x, rms.as_f32()?);

                let wq = model.data.resolve(w.wq.layer(l))?;
                let wk = model.data.resolve(w.wk.layer(l))?;
                let wv = model.data.resolve(w.wv.layer(l))?;
                pool.matmul(&done, v.q, v.xb, wq.as_f32()?)?;
                pool.matmul(&done, &mut v.key_cache[kv_row.clone()], v.xb, wk.as_f32()?)?;
                pool.matmul(&done, &mut v.value_cache[kv_row.clone()], v.xb, wv.as_f32()?)?;
                done.wait_idle();
            }
            Weights::Q8 { tensors: w, .. } => {
                let rms = model.data.resolve(w.rms_att.layer(l))?;
                kernels::rmsnorm(v.xb, v.x, rms.as_f32()?);
                quant::quantize(xq, v.xb, gs);

                let (wq_q, wq_s) = (model.data.resolve(w.wq.q(l))?, model.data.resolve(w.wq.s(l))?);
                let (wk_q, wk_s) = (model.data.resolve(w.wk.q(l))?, model.data.resolve(w.wk.s(l))?);
                let (wv_q, wv_s) = (model.data.resolve(w.wv.q(l))?, model.data.resolve(w.wv.s(l))?);
                pool.matmul_q8(&done, v.q, &xq.q, &xq.s, wq_q.as_i8(), wq_s.as_f32()?, gs)?;
                pool.matmul_q8(
                    &done,
                    &mut v.key_cache[kv_row.clone()],
                    &xq.q,
                    &xq.s,
                    wk_q.as_i8(),
                    wk_s.as_f32()?,
                    gs,
                )?;
                pool.matmul_q8(
                    &done,
                    &mut v.value_cache[kv_row.clone()],
                    &xq.q,
                    &xq.s,
                    wv_q.as_i8(),
                    wv_s.as_f32()?,
                    gs,
                )?;
                done.wait_idle();
            }
        }

        // RoPE: rotate each channel pair of q (and k, within kv_dim) by a
        // position-dependent angle
        for i in (0..dim).step_by(2) {
            let head_dim = (i % head_size) as f32;
            let freq = 1.0 / 10000f32.powf(head_dim / head_size as f32);
            let angle = pos as f32 * freq;
            let (fci, fcr) = angle.sin_cos();

            let (q0, q1) = (v.q[i], v.q[i + 1]);
            v.q[i] = q0 * fcr - q1 * fci;
            v.q[i + 1] = q0 * fci + q1 * fcr;

            if i < kv_dim {
                let k = &mut v.key_cache[kv_row.clone()];
                let (k0, k1) = (k[i], k[i + 1]);
                k[i] = k0 * fcr - k1 * fci;
                k[i + 1] = k0 * fci + k1 * fcr;
            }
        }

        // multi-head attention over every cached position
        for h in 0..cfg.n_heads {
            let q = &v.q[h * head_size..(h + 1) * head_size];
            let att = &mut v.att[h * seq_len..h * seq_len + pos + 1];

            for (n, a) in att.iter_mut().enumerate() {
                let k = &v.key_cache[loff + n * kv_dim + (h / kv_mul) * head_size..][..head_size];
                let mut score = 0.0f32;
                for i in 0..head_size {
                    score += q[i] * k[i];
                }
                *a = score / (head_size as f32).sqrt();
            }

            kernels::softmax(att);

            let xb = &mut v.xb[h * head_size..(h + 1) * head_size];
            xb.fill(0.0);
            for (n, &a) in att.iter().enumerate() {
                let val =
                    &v.value_cache[loff + n * kv_dim + (h / kv_mul) * head_size..][..head_size];
                for i in 0..head_size {
                    xb[i] += a * val[i];
                }
            }
        }

        // attention output projection and residual
        match &model.weights {
            Weights::Float(w) => {
                let wo = model.data.resolve(w.wo.layer(l))?;
                pool.matmul(&done, v.xb2, v.xb, wo.as_f32()?)?;
                done.wait_idle();
            }
            Weights::Q8 { tensors: w, .. } => {
                quant::quantize(xq, v.xb, gs);
                let (wo_q, wo_s) = (model.data.resolve(w.wo.q(l))?, model.data.resolve(w.wo.s(l))?);
                pool.matmul_q8(&done, v.xb2, &xq.q, &xq.s, wo_q.as_i8(), wo_s.as_f32()?, gs)?;
                done.wait_idle();
            }
        }
        for (x, &r) in v.x.iter_mut().zip(v.xb2.iter()) {
            *x += r;
        }

        // FFN: w2(silu(w1(x)) * w3(x)), with its own RMSNorm and residual
        match &model.weights {
            Weights::Float(w) => {
                let rms = model.data.resolve(w.rms_ffn.layer(l))?;
                kernels::rmsnorm(v.xb, v.x, rms.as_f32()?);

                let w1 = model.data.resolve(w.w1.layer(l))?;
                let w3 = model.data.resolve(w.w3.layer(l))?;
                pool.matmul(&done, v.hb, v.xb, w1.as_f32()?)?;
                pool.matmul(&done, v.hb2, v.xb, w3.as_f32()?)?;
                done.wait_idle();

                kernels::swiglu(v.hb, v.hb2);

                let w2 = model.data.resolve(w.w2.layer(l))?;
                pool.matmul(&done, v.xb, v.hb, w2.as_f32()?)?;
                done.wait_idle();
            }
            Weights::Q8 { tensors: w, .. } => {
                let rms = model.data.resolve(w.rms_ffn.layer(l))?;
                kernels::rmsnorm(v.xb, v.x, rms.as_f32()?);
                quant::quantize(xq, v.xb, gs);

                let (w1_q, w1_s) = (model.data.resolve(w.w1.q(l))?, model.data.resolve(w.w1.s(l))?);
                let (w3_q, w3_s) = (model.data.resolve(w.w3.q(l))?, model.data.resolve(w.w3.s(l))?);
                pool.matmul_q8(&done, v.hb, &xq.q, &xq.s, w1_q.as_i8(), w1_s.as_f32()?, gs)?;
                pool.matmul_q8(&done, v.hb2, &xq.q, &xq.s, w3_q.as_i8(), w3_s.as_f32()?, gs)?;
                done.wait_idle();

                kernels::swiglu(v.hb, v.hb2);

                quant::quantize(hq, v.hb, gs);
                let (w2_q, w2_s) = (model.data.resolve(w.w2.q(l))?, model.data.resolve(w.w2.s(l))?);
                pool.matmul_q8(&done, v.xb, &hq.q, &hq.s, w2_q.as_i8(), w2_s.as_f32()?, gs)?;
                done.wait_idle();
            }
        }
        for (x, &r) in v.x.iter_mut().zip(v.xb.iter()) {
            *x += r;
        }
    }

    // final RMSNorm and the classifier head
    match &model.weights {
        Weights::Float(w) => {
            let rms = model.data.resolve(w.rms_final.layer(0))?;
            kernels::rmsnorm(v.xb, v.x, rms.as_f32()?);

            let wcls = model.data.resolve(w.wcls.layer(0))?;
            pool.matmul(&done, v.logits, v.xb, wcls.as_f32()?)?;
            done.wait_idle();
        }
        Weights::Q8 { tensors: w, .. } => {
            let rms = model.data.resolve(w.rms_final.layer(0))?;
            kernels::rmsnorm(v.xb, v.x, rms.as_f32()?);
            quant::quantize(xq, v.xb, gs);

            let (wc_q, wc_s) = (
                model.data.resolve(w.wcls.q(0))?,
                model.data.resolve(w.wcls.s(0))?,
            );
            pool.matmul_q8(&done, v.logits, &xq.q, &xq.s, wc_q.as_i8(), wc_s.as_f32()?, gs)?;
            done.wait_idle();
        }
    }

    if is_prompt {
        return Ok(token);
    }
    Ok(sampler.sample(v.logits))
}
