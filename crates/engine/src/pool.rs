//! Fixed worker pool parallelizing the output dimension of every matmul.
//!
//! One pool serves every session. Each dispatch partitions the output rows
//! into `threads` contiguous ranges (the last range absorbs the remainder)
//! and enqueues one job per worker on a single bounded ring. Workers drain
//! the ring; completion is tracked per session through a [`Completion`]
//! counter plus semaphore, so concurrent sessions' bursts signal
//! independently. The caller owns every buffer a job touches and may not
//! read or reuse them until its barrier ([`Completion::wait_idle`]) sees
//! the counter at zero; that barrier is the linearization point of each
//! matmul.
//!
//! The ring is sized for the worst concurrent step; running out of slots is
//! a construction-time sizing bug and is rejected at enqueue.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use emberlm_core::kernels;

use crate::error::{EngineError, Result};

/// Worker count when the embedder does not specify one.
pub const DEFAULT_THREADS: usize = 8;

/// Ring slots per worker; a forward step keeps at most a few dispatches
/// outstanding between barriers, this leaves generous headroom for many
/// interleaved sessions.
const RING_SLOTS_PER_THREAD: usize = 16;

struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        *self.count.lock() += 1;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }
}

/// Per-session completion tracking: a count of jobs still queued or running
/// and a semaphore posted each time the count drains to zero.
pub struct Completion {
    queued: Mutex<usize>,
    done: Semaphore,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(0),
            done: Semaphore::new(),
        }
    }

    fn add(&self, n: usize) {
        *self.queued.lock() += n;
    }

    fn finish_one(&self) {
        let mut queued = self.queued.lock();
        debug_assert!(*queued > 0);
        *queued -= 1;
        if *queued == 0 {
            drop(queued);
            self.done.post();
        }
    }

    /// Block until every job dispatched against this completion has run.
    ///
    /// Posts can arrive for earlier drain intervals, so each wake re-reads
    /// the counter and keeps waiting until it is really zero.
    pub fn wait_idle(&self) {
        loop {
            self.done.wait();
            if *self.queued.lock() == 0 {
                return;
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum JobKind {
    F32 {
        w: *const f32,
        x: *const f32,
        n: usize,
    },
    Q8 {
        wq: *const i8,
        ws: *const f32,
        xq: *const i8,
        xs: *const f32,
        n: usize,
        group_size: usize,
    },
}

struct Job {
    out: *mut f32,
    rows: Range<usize>,
    kind: JobKind,
    done: Arc<Completion>,
}

// SAFETY: a job only dereferences its pointers inside `run`, which the
// dispatching session guarantees happen-before its barrier returns; the
// referenced buffers outlive the barrier and output row ranges are
// disjoint between jobs.
unsafe impl Send for Job {}

impl Job {
    /// SAFETY: caller (the worker loop) relies on the dispatch contract
    /// above; all pointer/length pairs were derived from live slices.
    unsafe fn run(&self) {
        let rows = self.rows.len();
        match self.kind {
            JobKind::F32 { w, x, n } => {
                let out = std::slice::from_raw_parts_mut(self.out.add(self.rows.start), rows);
                let x = std::slice::from_raw_parts(x, n);
                let w = std::slice::from_raw_parts(w.add(self.rows.start * n), rows * n);
                kernels::matmul(out, x, w);
            }
            JobKind::Q8 {
                wq,
                ws,
                xq,
                xs,
                n,
                group_size,
            } => {
                let groups_per_row = n / group_size;
                let out = std::slice::from_raw_parts_mut(self.out.add(self.rows.start), rows);
                let xq = std::slice::from_raw_parts(xq, n);
                let xs = std::slice::from_raw_parts(xs, n / group_size);
                let wq = std::slice::from_raw_parts(wq.add(self.rows.start * n), rows * n);
                let ws = std::slice::from_raw_parts(
                    ws.add(self.rows.start * groups_per_row),
                    rows * groups_per_row,
                );
                kernels::matmul_q8(out, xq, xs, wq, ws, group_size);
            }
        }
    }
}

struct Ring {
    jobs: VecDeque<Job>,
    capacity: usize,
    exiting: bool,
}

struct Shared {
    ring: Mutex<Ring>,
    starts: Vec<Semaphore>,
}

/// The fixed worker thread set.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    threads: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers (0 selects [`DEFAULT_THREADS`]).
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 { DEFAULT_THREADS } else { threads };

        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring {
                jobs: VecDeque::with_capacity(threads * RING_SLOTS_PER_THREAD),
                capacity: threads * RING_SLOTS_PER_THREAD,
                exiting: false,
            }),
            starts: (0..threads).map(|_| Semaphore::new()).collect(),
        });

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("emberlm-worker-{index}"))
                .spawn(move || worker_loop(shared, index))?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            handles,
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Dispatch `out = w * x` across the workers. Returns immediately; the
    /// result is valid only after `done.wait_idle()`.
    pub fn matmul(
        &self,
        done: &Arc<Completion>,
        out: &mut [f32],
        x: &[f32],
        w: &[f32],
    ) -> Result<()> {
        debug_assert_eq!(w.len(), out.len() * x.len());
        self.dispatch(
            done,
            out.as_mut_ptr(),
            out.len(),
            JobKind::F32 {
                w: w.as_ptr(),
                x: x.as_ptr(),
                n: x.len(),
            },
        )
    }

    /// Int8-grouped variant of [`WorkerPool::matmul`].
    #[allow(clippy::too_many_arguments)]
    pub fn matmul_q8(
        &self,
        done: &Arc<Completion>,
        out: &mut [f32],
        xq: &[i8],
        xs: &[f32],
        wq: &[i8],
        ws: &[f32],
        group_size: usize,
    ) -> Result<()> {
        debug_assert_eq!(wq.len(), out.len() * xq.len());
        self.dispatch(
            done,
            out.as_mut_ptr(),
            out.len(),
            JobKind::Q8 {
                wq: wq.as_ptr(),
                ws: ws.as_ptr(),
                xq: xq.as_ptr(),
                xs: xs.as_ptr(),
                n: xq.len(),
                group_size,
            },
        )
    }

    fn dispatch(&self, done: &Arc<Completion>, out: *mut f32, d: usize, kind: JobKind) -> Result<()> {
        {
            let mut ring = self.shared.ring.lock();
            if ring.jobs.len() + self.threads > ring.capacity {
                return Err(EngineError::Exhausted(format!(
                    "job ring full ({} jobs, capacity {})",
                    ring.jobs.len(),
                    ring.capacity
                )));
            }

            // account for the jobs before any worker can pop them, so the
            // counter can never underflow
            done.add(self.threads);

            let chunk = d / self.threads;
            let mut start = 0;
            for m in 0..self.threads {
                let end = if m == self.threads - 1 { d } else { start + chunk };
                ring.jobs.push_back(Job {
                    out,
                    rows: start..end,
                    kind,
                    done: Arc::clone(done),
                });
                start += chunk;
            }
        }

        for sem in &self.shared.starts {
            sem.post();
        }
        Ok(())
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    loop {
        shared.starts[index].wait();

        // drain the ring until it is observed empty, then sleep again
        loop {
            let job = {
                let mut ring = shared.ring.lock();
                if ring.exiting {
                    return;
                }
                match ring.jobs.pop_front() {
                    Some(job) => job,
                    None => break,
                }
            };

            // SAFETY: dispatch contract, see the Job Send impl.
            unsafe { job.run() };
            job.done.finish_one();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.ring.lock().exiting = true;
        for sem in &self.shared.starts {
            sem.post();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
