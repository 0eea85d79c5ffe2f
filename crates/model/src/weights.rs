//! Typed handles over the checkpoint's weight tensors.
//!
//! Handles are plain byte ranges into the checkpoint file; nothing here
//! touches the bytes themselves. A `(tensor, layer)` pair maps to a
//! `ByteRange` that [`crate::ModelData::resolve`] turns into an actual span,
//! whatever the access mode.

/// A contiguous byte range within the checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: usize,
}

/// A float32 tensor stored contiguously, one block of `elems` values per
/// layer (single-layer tensors use `layer(0)`).
#[derive(Debug, Clone, Copy)]
pub struct F32Tensor {
    offset: u64,
    elems: usize,
}

impl F32Tensor {
    pub fn new(offset: u64, elems: usize) -> Self {
        Self { offset, elems }
    }

    /// Byte range of layer `l`'s block.
    pub fn layer(&self, l: usize) -> ByteRange {
        ByteRange {
            offset: self.offset + (l * self.elems * 4) as u64,
            len: self.elems * 4,
        }
    }

    /// Byte range of one row of `row_elems` values within layer 0; used for
    /// single embedding-table rows.
    pub fn row(&self, row: usize, row_elems: usize) -> ByteRange {
        ByteRange {
            offset: self.offset + (row * row_elems * 4) as u64,
            len: row_elems * 4,
        }
    }

    /// First byte past the final layer.
    pub fn end(&self, n_layers: usize) -> u64 {
        self.offset + (n_layers * self.elems * 4) as u64
    }
}

/// A group-quantized tensor: per layer, `elems` int8 values followed by one
/// f32 scale per `group_size` values, tuples laid back-to-back.
#[derive(Debug, Clone, Copy)]
pub struct Q8Tensor {
    offset: u64,
    elems: usize,
    group_size: usize,
}

impl Q8Tensor {
    pub fn new(offset: u64, elems: usize, group_size: usize) -> Self {
        Self {
            offset,
            elems,
            group_size,
        }
    }

    fn tuple_bytes(&self) -> usize {
        self.elems + (self.elems / self.group_size) * 4
    }

    /// Byte range of layer `l`'s quantized values.
    pub fn q(&self, l: usize) -> ByteRange {
        ByteRange {
            offset: self.offset + (l * self.tuple_bytes()) as u64,
            len: self.elems,
        }
    }

    /// Byte range of layer `l`'s scales.
    pub fn s(&self, l: usize) -> ByteRange {
        ByteRange {
            offset: self.offset + (l * self.tuple_bytes() + self.elems) as u64,
            len: (self.elems / self.group_size) * 4,
        }
    }

    /// First byte past the final layer.
    pub fn end(&self, n_layers: usize) -> u64 {
        self.offset + (n_layers * self.tuple_bytes()) as u64
    }
}

/// Tensor handles for a float32 checkpoint.
#[derive(Debug, Clone)]
pub struct FloatWeights {
    /// `(vocab_size, dim)`
    pub token_embedding: F32Tensor,
    /// `(layer, dim)`
    pub rms_att: F32Tensor,
    /// `(layer, dim, n_heads * head_size)`
    pub wq: F32Tensor,
    /// `(layer, dim, n_kv_heads * head_size)`
    pub wk: F32Tensor,
    /// `(layer, dim, n_kv_heads * head_size)`
    pub wv: F32Tensor,
    /// `(layer, n_heads * head_size, dim)`
    pub wo: F32Tensor,
    /// `(layer, dim)`
    pub rms_ffn: F32Tensor,
    /// `(layer, hidden_dim, dim)`
    pub w1: F32Tensor,
    /// `(layer, dim, hidden_dim)`
    pub w2: F32Tensor,
    /// `(layer, hidden_dim, dim)`
    pub w3: F32Tensor,
    /// `(dim,)`
    pub rms_final: F32Tensor,
    /// `(vocab_size, dim)`; aliases `token_embedding` when the classifier is shared
    pub wcls: F32Tensor,
}

/// Tensor handles for an int8-grouped checkpoint. RMSNorm weights stay
/// float32 on disk.
#[derive(Debug, Clone)]
pub struct Q8Tensors {
    pub rms_att: F32Tensor,
    pub rms_ffn: F32Tensor,
    pub rms_final: F32Tensor,
    /// quantized `(vocab_size, dim)` embedding table
    pub q_tokens: Q8Tensor,
    pub wq: Q8Tensor,
    pub wk: Q8Tensor,
    pub wv: Q8Tensor,
    pub wo: Q8Tensor,
    pub w1: Q8Tensor,
    pub w2: Q8Tensor,
    pub w3: Q8Tensor,
    /// aliases `q_tokens` when the classifier is shared
    pub wcls: Q8Tensor,
}

/// Weight bundle for a loaded model.
pub enum Weights {
    Float(FloatWeights),
    Q8 {
        tensors: Q8Tensors,
        /// The embedding table is read-mostly, so it is dequantized to float
        /// once at construction.
        token_embedding: Vec<f32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_layers_are_contiguous() {
        let t = F32Tensor::new(100, 8);
        assert_eq!(t.layer(0), ByteRange { offset: 100, len: 32 });
        assert_eq!(t.layer(2).offset, 100 + 64);
        assert_eq!(t.end(3), 100 + 96);
        assert_eq!(t.row(3, 2), ByteRange { offset: 124, len: 8 });
    }

    #[test]
    fn q8_tuples_interleave_values_and_scales() {
        // 64 values, groups of 16 -> 64 q bytes + 16 scale bytes per layer
        let t = Q8Tensor::new(256, 64, 16);
        assert_eq!(t.q(0), ByteRange { offset: 256, len: 64 });
        assert_eq!(t.s(0), ByteRange { offset: 320, len: 16 });
        assert_eq!(t.q(1).offset, 256 + 80);
        assert_eq!(t.end(2), 256 + 160);
    }
}
