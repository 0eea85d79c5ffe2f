//! Model construction: checkpoint + tokenizer + access descriptor.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use emberlm_core::{quant, CheckpointVersion, ModelConfig};

use crate::checkpoint::{self, WeightLayout, HEADER_LEN};
use crate::data::{AccessMode, ModelData};
use crate::error::{ModelError, Result};
use crate::tokenizer::Vocabulary;
use crate::weight_cache::WeightCache;
use crate::weights::Weights;

/// Embedding-API version; construction requests carrying any other value
/// are rejected.
pub const API_VERSION: u32 = 1;

/// Prompt-shaping flavor of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Plain continuation: `{system}\n{user}\n`
    Gen,
    /// Llama-2 chat wrapping with `[INST]` markers
    Chat,
}

/// Everything needed to construct a model.
#[derive(Clone)]
pub struct ModelInfo {
    pub checkpoint_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub access: AccessMode,
    /// Checkpoint bytes for [`AccessMode::Address`]; ignored otherwise.
    pub model_bytes: Option<Arc<[u8]>>,
    /// Weight-cache byte budget for [`AccessMode::ReadCache`]; 0 disables
    /// eviction.
    pub cache_limit: usize,
    /// Concurrent session cap; 0 means unlimited.
    pub max_sessions: usize,
    pub kind: ModelKind,
    pub name: String,
    pub api_version: u32,
}

impl ModelInfo {
    pub fn new(
        checkpoint_path: impl Into<PathBuf>,
        tokenizer_path: impl Into<PathBuf>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            tokenizer_path: tokenizer_path.into(),
            access: AccessMode::Mmap,
            model_bytes: None,
            cache_limit: 0,
            max_sessions: 0,
            kind: ModelKind::Gen,
            name: name.into(),
            api_version: API_VERSION,
        }
    }
}

/// An immutable, loaded model, shared by any number of sessions.
pub struct Model {
    pub config: ModelConfig,
    pub weights: Weights,
    pub data: ModelData,
    pub vocab: Vocabulary,
    pub kind: ModelKind,
    pub name: String,
    pub max_sessions: usize,
}

impl Model {
    /// Construct a model. Any failure tears down whatever was built so far.
    pub fn load(info: &ModelInfo) -> Result<Model> {
        if info.api_version != API_VERSION {
            return Err(ModelError::Config(format!(
                "api version mismatch: engine {} vs request {}",
                API_VERSION, info.api_version
            )));
        }

        let (header, data) = match info.access {
            AccessMode::Mmap => {
                let file = File::open(&info.checkpoint_path)?;
                // SAFETY: the mapping is private and read-only; the file is
                // treated as immutable for the model's lifetime.
                let map = unsafe { Mmap::map(&file)? };
                if map.len() < HEADER_LEN {
                    return Err(ModelError::Format("checkpoint too small".into()));
                }
                let header = map[..HEADER_LEN].to_vec();
                (header, ModelData::Mapped(map))
            }
            AccessMode::ReadCache => {
                let mut file = File::open(&info.checkpoint_path)?;
                let mut header = vec![0u8; HEADER_LEN];
                file.read_exact(&mut header)?;
                let cache = WeightCache::new(file, info.cache_limit)?;
                (header, ModelData::Cached(cache))
            }
            AccessMode::Address => {
                let bytes = info.model_bytes.clone().ok_or_else(|| {
                    ModelError::Config("address access mode without model bytes".into())
                })?;
                if bytes.len() < HEADER_LEN {
                    return Err(ModelError::Format("checkpoint too small".into()));
                }
                if bytes.as_ptr() as usize % 4 != 0 {
                    return Err(ModelError::Config(
                        "model bytes must be 4-byte aligned".into(),
                    ));
                }
                let header = bytes[..HEADER_LEN].to_vec();
                (header, ModelData::Owned(bytes))
            }
        };

        let (config, layout) = checkpoint::parse(&header, data.len())?;

        let vocab = Vocabulary::load(&info.tokenizer_path, config.vocab_size)?;

        let weights = match layout {
            WeightLayout::Float(w) => Weights::Float(w),
            WeightLayout::Q8(tensors) => {
                // the embedding table is read once per generated token, so
                // reconstruct it to float up front
                let q = data.resolve(tensors.q_tokens.q(0))?;
                let s = data.resolve(tensors.q_tokens.s(0))?;
                let token_embedding =
                    quant::dequantize_table(q.as_i8(), s.as_f32()?, config.group_size);
                Weights::Q8 {
                    tensors,
                    token_embedding,
                }
            }
        };

        let flavor = match config.version {
            CheckpointVersion::Float32 => "float",
            CheckpointVersion::Int8Grouped => "int8",
        };
        tracing::info!(
            name = %info.name,
            flavor,
            access = ?info.access,
            size_mb = data.len() / (1024 * 1024),
            dim = config.dim,
            hidden_dim = config.hidden_dim,
            layers = config.n_layers,
            heads = config.n_heads,
            kv_heads = config.n_kv_heads,
            seq_len = config.seq_len,
            vocab = config.vocab_size,
            "model loaded"
        );

        Ok(Model {
            config,
            weights,
            data,
            vocab,
            kind: info.kind,
            name: info.name.clone(),
            max_sessions: info.max_sessions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    /// Minimal float checkpoint: header + zeroed weights of the right size.
    fn v1_bytes(dim: u32, hidden: u32, layers: u32, heads: u32, kv: u32, vocab: u32, seq: u32) -> Vec<u8> {
        let mut out = Vec::new();
        for v in [dim, hidden, layers, heads, kv, vocab, seq] {
            out.write_u32::<LittleEndian>(v).unwrap();
        }
        let hs = dim / heads;
        let floats = vocab * dim
            + layers * dim
            + layers * dim * heads * hs
            + 2 * (layers * dim * kv * hs)
            + layers * heads * hs * dim
            + layers * dim
            + 3 * (layers * dim * hidden)
            + dim
            + seq * hs;
        out.resize(28 + floats as usize * 4, 0);
        out
    }

    fn tokenizer_file(dir: &std::path::Path, vocab: u32) -> PathBuf {
        let path = dir.join("tok.bin");
        let mut f = File::create(&path).unwrap();
        f.write_u32::<LittleEndian>(8).unwrap();
        for i in 0..vocab {
            f.write_f32::<LittleEndian>(0.0).unwrap();
            let piece = format!("t{i}");
            f.write_u32::<LittleEndian>(piece.len() as u32).unwrap();
            f.write_all(piece.as_bytes()).unwrap();
        }
        path
    }

    #[test]
    fn loads_v1_via_mmap_and_rejects_bad_api_version() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("model.bin");
        std::fs::write(&ckpt, v1_bytes(8, 16, 1, 2, 1, 16, 8)).unwrap();
        let tok = tokenizer_file(dir.path(), 16);

        let mut info = ModelInfo::new(&ckpt, &tok, "tiny");
        let model = Model::load(&info).unwrap();
        assert_eq!(model.config.dim, 8);
        assert_eq!(model.vocab.len(), 16);
        assert!(matches!(model.weights, Weights::Float(_)));

        info.api_version = 7;
        assert!(Model::load(&info).is_err());
    }

    #[test]
    fn read_cache_mode_serves_the_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("model.bin");
        let mut bytes = v1_bytes(8, 16, 1, 2, 1, 16, 8);
        // stamp a recognizable f32 into the embedding table
        bytes[28..32].copy_from_slice(&1.5f32.to_le_bytes());
        std::fs::write(&ckpt, &bytes).unwrap();
        let tok = tokenizer_file(dir.path(), 16);

        let mut info = ModelInfo::new(&ckpt, &tok, "tiny");
        info.access = AccessMode::ReadCache;
        info.cache_limit = 1 << 20;
        let model = Model::load(&info).unwrap();

        let Weights::Float(w) = &model.weights else {
            panic!("expected float weights")
        };
        let span = model.data.resolve(w.token_embedding.row(0, 8)).unwrap();
        assert_eq!(span.as_f32().unwrap()[0], 1.5);
    }

    #[test]
    fn missing_checkpoint_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let tok = tokenizer_file(dir.path(), 16);
        let info = ModelInfo::new(dir.path().join("absent.bin"), tok, "gone");
        assert!(matches!(Model::load(&info), Err(ModelError::Io(_))));
    }
}
