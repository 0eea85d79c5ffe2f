//! Transformer hyperparameters shared by every crate in the engine.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// On-disk flavor of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointVersion {
    /// Legacy format: every weight stored as contiguous `f32`.
    Float32,
    /// Group-quantized format: int8 values with one `f32` scale per group.
    Int8Grouped,
}

/// Model configuration, read from the checkpoint header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding / residual-stream dimension
    pub dim: usize,
    /// FFN hidden dimension
    pub hidden_dim: usize,
    /// Number of transformer layers
    pub n_layers: usize,
    /// Number of query heads
    pub n_heads: usize,
    /// Number of key/value heads (can be < `n_heads` under grouped-query attention)
    pub n_kv_heads: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length
    pub seq_len: usize,
    /// Quantization group size; 0 for float checkpoints
    pub group_size: usize,
    /// Whether the classifier head aliases the token-embedding table
    pub shared_classifier: bool,
    /// Checkpoint flavor
    pub version: CheckpointVersion,
}

impl ModelConfig {
    /// Per-head dimension.
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Dimension of one key/value row (`kv_dim <= dim`).
    pub fn kv_dim(&self) -> usize {
        (self.dim * self.n_kv_heads) / self.n_heads
    }

    /// Number of query heads served by each key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0
            || self.hidden_dim == 0
            || self.n_layers == 0
            || self.n_heads == 0
            || self.n_kv_heads == 0
            || self.vocab_size == 0
            || self.seq_len == 0
        {
            return Err(CoreError::Config("zero-sized model dimension".into()));
        }
        if self.dim % self.n_heads != 0 {
            return Err(CoreError::Config(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(CoreError::Config(format!(
                "n_heads ({}) must be divisible by n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.version == CheckpointVersion::Int8Grouped {
            if self.group_size == 0 {
                return Err(CoreError::Config("int8 checkpoint with group_size 0".into()));
            }
            // every weight tensor's element count is a multiple of dim or
            // hidden_dim, so these two checks cover all of them
            if self.dim % self.group_size != 0 || self.hidden_dim % self.group_size != 0 {
                return Err(CoreError::Config(format!(
                    "group_size ({}) must divide dim ({}) and hidden_dim ({})",
                    self.group_size, self.dim, self.hidden_dim
                )));
            }
        }
        Ok(())
    }
}
