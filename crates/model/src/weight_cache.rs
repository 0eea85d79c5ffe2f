//! Byte-budgeted weight cache for hosts without usable mmap.
//!
//! Synthesizes the mmap contract over plain file reads: `fetch` returns the
//! bytes of an exact `(offset, len)` range, reading and caching on miss.
//! Entries sit in an insertion-ordered list, newest first; when the live
//! total exceeds the budget, entries are dropped from the tail (oldest
//! first) before the new one is inserted, so the resident total never
//! exceeds the budget plus the most recent insertion. One mutex covers
//! lookup, eviction, allocation and the read.
//!
//! Entries are reference-counted, so a span still in use by an in-flight
//! matmul survives its own eviction until the barrier releases it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ModelError, Result};
use crate::weights::ByteRange;

/// One cached range of the checkpoint file.
///
/// The backing store is `u32`-based so that f32 tensor data read into an
/// entry stays 4-byte aligned for reinterpretation.
pub struct CacheEntry {
    offset: u64,
    len: usize,
    /// hit counter, kept for statistics only; eviction ignores it
    hits: AtomicU64,
    buf: Box<[u32]>,
}

impl CacheEntry {
    fn with_len(offset: u64, len: usize) -> Self {
        Self {
            offset,
            len,
            hits: AtomicU64::new(1),
            buf: vec![0u32; len.div_ceil(4)].into_boxed_slice(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the buffer holds at least `len` initialized bytes and u32
        // storage can always be viewed as bytes.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr().cast::<u8>(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.buf.as_mut_ptr().cast::<u8>(), self.len) }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Cache counters, readable at any time and logged when the cache drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// entries ever created
    pub created: u64,
    /// bytes read from the file
    pub fetched: u64,
    /// bytes served, hits included
    pub touched: u64,
    /// bytes currently resident
    pub resident: u64,
}

struct CacheInner {
    file: File,
    file_len: u64,
    /// newest at the front; eviction pops the back
    entries: VecDeque<Arc<CacheEntry>>,
    resident: usize,
    created: u64,
    fetched: u64,
    touched: u64,
}

/// Budgeted read-cache over the checkpoint file.
pub struct WeightCache {
    inner: Mutex<CacheInner>,
    /// byte budget; 0 disables eviction
    limit: usize,
}

impl WeightCache {
    pub fn new(file: File, limit: usize) -> Result<Self> {
        let file_len = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(CacheInner {
                file,
                file_len,
                entries: VecDeque::new(),
                resident: 0,
                created: 0,
                fetched: 0,
                touched: 0,
            }),
            limit,
        })
    }

    pub fn file_len(&self) -> u64 {
        self.inner.lock().file_len
    }

    /// Return the bytes of `range`, reading them from the file on a miss.
    pub fn fetch(&self, range: ByteRange) -> Result<Arc<CacheEntry>> {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner
            .entries
            .iter()
            .find(|e| e.offset == range.offset && e.len == range.len)
        {
            let entry = Arc::clone(entry);
            entry.hits.fetch_add(1, Ordering::Relaxed);
            inner.touched += range.len as u64;
            return Ok(entry);
        }

        if self.limit != 0 {
            while inner.resident > self.limit {
                if let Some(old) = inner.entries.pop_back() {
                    inner.resident -= old.len;
                } else {
                    break;
                }
            }
        }

        if range.offset + range.len as u64 > inner.file_len {
            return Err(ModelError::Format(format!(
                "weight range {}+{} beyond checkpoint end {}",
                range.offset, range.len, inner.file_len
            )));
        }

        let mut entry = CacheEntry::with_len(range.offset, range.len);
        inner.file.seek(SeekFrom::Start(range.offset))?;
        inner.file.read_exact(entry.bytes_mut())?;
        let entry = Arc::new(entry);

        inner.entries.push_front(Arc::clone(&entry));
        inner.resident += range.len;
        inner.created += 1;
        inner.fetched += range.len as u64;
        inner.touched += range.len as u64;

        Ok(entry)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            created: inner.created,
            fetched: inner.fetched,
            touched: inner.touched,
            resident: inner.resident as u64,
        }
    }
}

impl Drop for WeightCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        tracing::debug!(
            created = inner.created,
            fetched_mb = inner.fetched / (1024 * 1024),
            touched_mb = inner.touched / (1024 * 1024),
            "weight cache released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cache_file(len: usize) -> File {
        let mut f = tempfile::tempfile().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        f
    }

    #[test]
    fn miss_reads_exact_bytes_and_hit_reuses_entry() {
        let cache = WeightCache::new(cache_file(1024), 0).unwrap();

        let a = cache.fetch(ByteRange { offset: 16, len: 32 }).unwrap();
        assert_eq!(a.bytes()[0], 16);
        assert_eq!(a.bytes()[31], 47);

        let b = cache.fetch(ByteRange { offset: 16, len: 32 }).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.hits(), 2);

        let stats = cache.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.fetched, 32);
        assert_eq!(stats.touched, 64);
    }

    #[test]
    fn same_offset_different_len_is_a_distinct_entry() {
        let cache = WeightCache::new(cache_file(1024), 0).unwrap();
        cache.fetch(ByteRange { offset: 0, len: 16 }).unwrap();
        cache.fetch(ByteRange { offset: 0, len: 32 }).unwrap();
        assert_eq!(cache.stats().created, 2);
    }

    #[test]
    fn eviction_keeps_resident_within_budget_plus_newest() {
        let limit = 100;
        let cache = WeightCache::new(cache_file(4096), limit).unwrap();

        for i in 0..20 {
            let r = ByteRange {
                offset: i * 40,
                len: 40,
            };
            cache.fetch(r).unwrap();
            let resident = cache.stats().resident as usize;
            assert!(
                resident <= limit + 40,
                "resident {resident} exceeds budget {limit} + newest 40"
            );
        }
    }

    #[test]
    fn eviction_drops_oldest_first() {
        let cache = WeightCache::new(cache_file(4096), 80).unwrap();

        let first = cache.fetch(ByteRange { offset: 0, len: 60 }).unwrap();
        cache.fetch(ByteRange { offset: 100, len: 60 }).unwrap();
        // resident 120 > 80, so the next miss evicts the oldest (offset 0)
        cache.fetch(ByteRange { offset: 200, len: 20 }).unwrap();

        // a refetch of the first range must be a fresh entry
        let again = cache.fetch(ByteRange { offset: 0, len: 60 }).unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
        // the evicted Arc is still readable by its holder
        assert_eq!(first.bytes().len(), 60);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let cache = WeightCache::new(cache_file(64), 0).unwrap();
        let err = cache.fetch(ByteRange { offset: 60, len: 16 });
        assert!(err.is_err());
    }
}
