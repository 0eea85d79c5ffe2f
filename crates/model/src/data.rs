//! Access to the checkpoint's bytes.
//!
//! Three modes, selected at model construction:
//! - `Mmap`: the file is memory-mapped; spans borrow straight from the map.
//! - `ReadCache`: no mapping; spans come from the budgeted
//!   [`WeightCache`](crate::WeightCache) which reads ranges on demand.
//! - `Address`: the caller already holds the checkpoint bytes (e.g. linked
//!   into the image on an embedded target); spans borrow from them.

use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::weight_cache::{CacheEntry, WeightCache};
use crate::weights::ByteRange;

/// How the checkpoint's bytes are reached at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Memory-map the checkpoint file (zero-copy).
    Mmap,
    /// Read ranges on demand through a byte-budgeted cache.
    ReadCache,
    /// Caller-supplied bytes at a fixed address (zero-copy).
    Address,
}

/// The checkpoint bytes behind a loaded model.
pub enum ModelData {
    Mapped(Mmap),
    Owned(Arc<[u8]>),
    Cached(WeightCache),
}

impl ModelData {
    /// Total checkpoint size in bytes.
    pub fn len(&self) -> u64 {
        match self {
            ModelData::Mapped(m) => m.len() as u64,
            ModelData::Owned(b) => b.len() as u64,
            ModelData::Cached(c) => c.file_len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize `range` as a span. Zero-copy in the mapped and owned
    /// modes; a cache fetch (possibly a disk read) in read-cache mode.
    pub fn resolve(&self, range: ByteRange) -> Result<WeightSpan<'_>> {
        match self {
            ModelData::Mapped(map) => {
                Ok(WeightSpan::Direct(slice_checked(map, range)?))
            }
            ModelData::Owned(bytes) => {
                Ok(WeightSpan::Direct(slice_checked(bytes, range)?))
            }
            ModelData::Cached(cache) => Ok(WeightSpan::Cached(cache.fetch(range)?)),
        }
    }
}

fn slice_checked(bytes: &[u8], range: ByteRange) -> Result<&[u8]> {
    let start = range.offset as usize;
    let end = start + range.len;
    bytes.get(start..end).ok_or_else(|| {
        ModelError::Format(format!(
            "weight range {}+{} beyond checkpoint end {}",
            range.offset,
            range.len,
            bytes.len()
        ))
    })
}

/// A resolved weight span. `Direct` borrows from the mapped or owned
/// checkpoint bytes; `Cached` keeps its cache entry alive for as long as the
/// span is held, which must be at least until the barrier of any matmul
/// dispatched over it.
pub enum WeightSpan<'a> {
    Direct(&'a [u8]),
    Cached(Arc<CacheEntry>),
}

impl WeightSpan<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            WeightSpan::Direct(b) => b,
            WeightSpan::Cached(e) => e.bytes(),
        }
    }

    /// Reinterpret as little-endian f32 values. The checkpoint formats keep
    /// all f32 arrays 4-byte aligned; a misaligned span means a corrupt or
    /// truncated file.
    pub fn as_f32(&self) -> Result<&[f32]> {
        let bytes = self.bytes();
        if bytes.len() % 4 != 0 || bytes.as_ptr() as usize % std::mem::align_of::<f32>() != 0 {
            return Err(ModelError::Format(
                "f32 tensor data is misaligned".into(),
            ));
        }
        // SAFETY: length and alignment checked above; f32 has no invalid
        // bit patterns and the span keeps the backing bytes alive.
        Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<f32>(), bytes.len() / 4) })
    }

    /// Reinterpret as int8 values.
    pub fn as_i8(&self) -> &[i8] {
        let bytes = self.bytes();
        // SAFETY: i8 and u8 share size and alignment, every bit pattern is
        // valid.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<i8>(), bytes.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(bytes: Vec<u8>) -> ModelData {
        ModelData::Owned(Arc::from(bytes.into_boxed_slice()))
    }

    #[test]
    fn owned_resolve_is_zero_copy_and_bounds_checked() {
        let data = owned((0u8..64).collect());
        let span = data
            .resolve(ByteRange { offset: 8, len: 8 })
            .unwrap();
        assert_eq!(span.bytes(), &[8, 9, 10, 11, 12, 13, 14, 15]);

        assert!(data.resolve(ByteRange { offset: 60, len: 8 }).is_err());
    }

    #[test]
    fn f32_reinterpret_round_trips() {
        let values = [1.5f32, -2.25, 0.0, 3.0e8];
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let data = owned(bytes);
        let span = data.resolve(ByteRange { offset: 0, len: 16 }).unwrap();
        assert_eq!(span.as_f32().unwrap(), &values);
    }

    #[test]
    fn i8_reinterpret_preserves_sign() {
        let data = owned(vec![0xFF, 0x01, 0x80]);
        let span = data.resolve(ByteRange { offset: 0, len: 3 }).unwrap();
        assert_eq!(span.as_i8(), &[-1i8, 1, -128]);
    }
}
