//! Checkpoint header parsing and body layout.
//!
//! Two on-disk formats:
//!
//! v1 (float32): 7 little-endian `u32` config fields, then every weight as
//! contiguous `f32` in a fixed order. A negative `vocab_size` flags a
//! classifier head stored separately from the embedding table. Two legacy
//! RoPE frequency tables sit between `rms_final` and the optional
//! classifier and are skipped.
//!
//! v2 (int8-grouped): a 256-byte header (`magic`, `version = 2`, the seven
//! config fields, `u8 shared_classifier`, `u32 group_size`), then the
//! float32 RMSNorm weights followed by each quantized tensor as
//! `(int8 q[size], f32 s[size / group_size])` tuples per layer.

use byteorder::{ByteOrder, LittleEndian};

use emberlm_core::{CheckpointVersion, ModelConfig};

use crate::error::{ModelError, Result};
use crate::weights::{F32Tensor, FloatWeights, Q8Tensor, Q8Tensors};

/// "ak42" magic of the v2 container.
pub const V2_MAGIC: u32 = 0x616b_3432;

/// Bytes of header a loader must supply to `parse`.
pub const HEADER_LEN: usize = 256;

/// Tensor handles for either checkpoint flavor.
pub enum WeightLayout {
    Float(FloatWeights),
    Q8(Q8Tensors),
}

/// Parse the header and lay out the body as tensor handles, verifying the
/// layout fits within `file_len`.
pub fn parse(header: &[u8], file_len: u64) -> Result<(ModelConfig, WeightLayout)> {
    if header.len() < HEADER_LEN {
        return Err(ModelError::Format(format!(
            "checkpoint header needs {HEADER_LEN} bytes, got {}",
            header.len()
        )));
    }

    let config = parse_config(header)?;
    config.validate()?;

    let layout = match config.version {
        CheckpointVersion::Float32 => WeightLayout::Float(float_layout(&config, file_len)?),
        CheckpointVersion::Int8Grouped => WeightLayout::Q8(q8_layout(&config, file_len)?),
    };

    Ok((config, layout))
}

fn parse_config(header: &[u8]) -> Result<ModelConfig> {
    let magic = LittleEndian::read_u32(&header[0..4]);
    let version = LittleEndian::read_u32(&header[4..8]);

    if magic == V2_MAGIC && version == 2 {
        let f = |i: usize| LittleEndian::read_u32(&header[8 + i * 4..12 + i * 4]) as usize;
        Ok(ModelConfig {
            dim: f(0),
            hidden_dim: f(1),
            n_layers: f(2),
            n_heads: f(3),
            n_kv_heads: f(4),
            vocab_size: f(5),
            seq_len: f(6),
            shared_classifier: header[36] != 0,
            group_size: LittleEndian::read_u32(&header[37..41]) as usize,
            version: CheckpointVersion::Int8Grouped,
        })
    } else {
        let f = |i: usize| LittleEndian::read_u32(&header[i * 4..i * 4 + 4]) as usize;
        let vocab = LittleEndian::read_i32(&header[20..24]);
        Ok(ModelConfig {
            dim: f(0),
            hidden_dim: f(1),
            n_layers: f(2),
            n_heads: f(3),
            n_kv_heads: f(4),
            vocab_size: vocab.unsigned_abs() as usize,
            seq_len: f(6),
            shared_classifier: vocab >= 0,
            group_size: 0,
            version: CheckpointVersion::Float32,
        })
    }
}

fn float_layout(c: &ModelConfig, file_len: u64) -> Result<FloatWeights> {
    let hs = c.head_size();
    let mut ofs = 28u64; // past the seven-field header

    let mut take = |elems: usize, layers: usize| {
        let t = F32Tensor::new(ofs, elems);
        ofs = t.end(layers);
        t
    };

    let token_embedding = take(c.vocab_size * c.dim, 1);
    let rms_att = take(c.dim, c.n_layers);
    let wq = take(c.dim * c.n_heads * hs, c.n_layers);
    let wk = take(c.dim * c.n_kv_heads * hs, c.n_layers);
    let wv = take(c.dim * c.n_kv_heads * hs, c.n_layers);
    let wo = take(c.n_heads * hs * c.dim, c.n_layers);
    let rms_ffn = take(c.dim, c.n_layers);
    let w1 = take(c.dim * c.hidden_dim, c.n_layers);
    let w2 = take(c.hidden_dim * c.dim, c.n_layers);
    let w3 = take(c.dim * c.hidden_dim, c.n_layers);
    let rms_final = take(c.dim, 1);

    // legacy RoPE frequency tables, real and imaginary halves
    let _ = take(c.seq_len * hs / 2, 2);

    let wcls = if c.shared_classifier {
        token_embedding
    } else {
        take(c.vocab_size * c.dim, 1)
    };

    if ofs > file_len {
        return Err(ModelError::Format(format!(
            "checkpoint truncated: layout needs {ofs} bytes, file has {file_len}"
        )));
    }

    Ok(FloatWeights {
        token_embedding,
        rms_att,
        wq,
        wk,
        wv,
        wo,
        rms_ffn,
        w1,
        w2,
        w3,
        rms_final,
        wcls,
    })
}

fn q8_layout(c: &ModelConfig, file_len: u64) -> Result<Q8Tensors> {
    let hs = c.head_size();
    let gs = c.group_size;
    let mut ofs = HEADER_LEN as u64;

    let mut take_f32 = |elems: usize, layers: usize| {
        let t = F32Tensor::new(ofs, elems);
        ofs = t.end(layers);
        t
    };

    let rms_att = take_f32(c.dim, c.n_layers);
    let rms_ffn = take_f32(c.dim, c.n_layers);
    let rms_final = take_f32(c.dim, 1);

    let mut take_q8 = |elems: usize, layers: usize| -> Result<Q8Tensor> {
        if elems % gs != 0 {
            return Err(ModelError::Format(format!(
                "tensor of {elems} elements not divisible by group_size {gs}"
            )));
        }
        let t = Q8Tensor::new(ofs, elems, gs);
        ofs = t.end(layers);
        Ok(t)
    };

    let q_tokens = take_q8(c.vocab_size * c.dim, 1)?;
    let wq = take_q8(c.dim * c.n_heads * hs, c.n_layers)?;
    let wk = take_q8(c.dim * c.n_kv_heads * hs, c.n_layers)?;
    let wv = take_q8(c.dim * c.n_kv_heads * hs, c.n_layers)?;
    let wo = take_q8(c.n_heads * hs * c.dim, c.n_layers)?;
    let w1 = take_q8(c.dim * c.hidden_dim, c.n_layers)?;
    let w2 = take_q8(c.hidden_dim * c.dim, c.n_layers)?;
    let w3 = take_q8(c.dim * c.hidden_dim, c.n_layers)?;

    let wcls = if c.shared_classifier {
        q_tokens
    } else {
        take_q8(c.dim * c.vocab_size, 1)?
    };

    if ofs > file_len {
        return Err(ModelError::Format(format!(
            "checkpoint truncated: layout needs {ofs} bytes, file has {file_len}"
        )));
    }

    Ok(Q8Tensors {
        rms_att,
        rms_ffn,
        rms_final,
        q_tokens,
        wq,
        wk,
        wv,
        wo,
        w1,
        w2,
        w3,
        wcls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn v1_header(dim: u32, hidden: u32, layers: u32, heads: u32, kv: u32, vocab: i32, seq: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.write_u32::<LittleEndian>(dim).unwrap();
        h.write_u32::<LittleEndian>(hidden).unwrap();
        h.write_u32::<LittleEndian>(layers).unwrap();
        h.write_u32::<LittleEndian>(heads).unwrap();
        h.write_u32::<LittleEndian>(kv).unwrap();
        h.write_i32::<LittleEndian>(vocab).unwrap();
        h.write_u32::<LittleEndian>(seq).unwrap();
        h.resize(HEADER_LEN, 0);
        h
    }

    fn v2_header(dim: u32, hidden: u32, layers: u32, heads: u32, kv: u32, vocab: u32, seq: u32, shared: u8, gs: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.write_u32::<LittleEndian>(V2_MAGIC).unwrap();
        h.write_u32::<LittleEndian>(2).unwrap();
        for v in [dim, hidden, layers, heads, kv, vocab, seq] {
            h.write_u32::<LittleEndian>(v).unwrap();
        }
        h.push(shared);
        h.write_u32::<LittleEndian>(gs).unwrap();
        h.resize(HEADER_LEN, 0);
        h
    }

    #[test]
    fn v1_negative_vocab_means_separate_classifier() {
        let header = v1_header(8, 16, 1, 2, 1, -32, 8);
        let (cfg, layout) = parse(&header, u64::MAX).unwrap();
        assert_eq!(cfg.vocab_size, 32);
        assert!(!cfg.shared_classifier);
        assert_eq!(cfg.version, CheckpointVersion::Float32);

        let WeightLayout::Float(w) = layout else {
            panic!("expected float layout")
        };
        // separate classifier sits past the legacy RoPE tables
        assert_ne!(w.wcls.layer(0), w.token_embedding.layer(0));
    }

    #[test]
    fn v1_layout_walks_tensors_in_order() {
        let (cfg, layout) = parse(&v1_header(8, 16, 2, 2, 1, 32, 8), u64::MAX).unwrap();
        let WeightLayout::Float(w) = layout else {
            panic!("expected float layout")
        };
        assert!(cfg.shared_classifier);

        // embedding starts right after the 28-byte header
        assert_eq!(w.token_embedding.layer(0).offset, 28);
        // rms_att follows vocab*dim f32 values
        assert_eq!(w.rms_att.layer(0).offset, 28 + 32 * 8 * 4);
        // wq's second layer is one dim*dim block later
        assert_eq!(
            w.wq.layer(1).offset - w.wq.layer(0).offset,
            (8 * 8 * 4) as u64
        );
        // shared classifier aliases the embedding
        assert_eq!(w.wcls.layer(0), w.token_embedding.layer(0));
    }

    #[test]
    fn v2_header_and_tuple_layout() {
        let (cfg, layout) = parse(&v2_header(8, 16, 2, 2, 1, 32, 8, 1, 4), u64::MAX).unwrap();
        assert_eq!(cfg.version, CheckpointVersion::Int8Grouped);
        assert_eq!(cfg.group_size, 4);
        assert!(cfg.shared_classifier);

        let WeightLayout::Q8(w) = layout else {
            panic!("expected q8 layout")
        };
        // rms weights first, as f32
        assert_eq!(w.rms_att.layer(0).offset, 256);
        // q_tokens follows the three rms tensors
        let rms_bytes = (2 * 8 + 2 * 8 + 8) * 4;
        assert_eq!(w.q_tokens.q(0).offset, 256 + rms_bytes as u64);
        // scales directly follow the quantized values within a tuple
        assert_eq!(
            w.wq.s(0).offset,
            w.wq.q(0).offset + w.wq.q(0).len as u64
        );
        assert_eq!(w.wcls.q(0), w.q_tokens.q(0));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let header = v1_header(8, 16, 1, 2, 1, 32, 8);
        assert!(parse(&header, 1024).is_err());
        assert!(parse(&header[..64], u64::MAX).is_err());
    }

    #[test]
    fn impossible_dims_are_rejected() {
        // dim not divisible by heads
        let header = v1_header(9, 16, 1, 2, 1, 32, 8);
        assert!(parse(&header, u64::MAX).is_err());
    }
}
