//! Tensor lifecycle management
//!
//! Every batch tensor is a lease registered with the shared [`TensorRuntime`].
//! A lease is released when it is dropped, and a [`TensorScope`] releases all
//! leases it handed out when the scope ends. A periodic sweep reclaims the
//! oldest leases once the live count passes the configured ceiling, and trims
//! the pool of recycled buffers.

use ndarray::{Array2, ArrayView2};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MlConfig;

/// Recycled buffers kept for reuse
const MAX_POOLED_BUFFERS: usize = 32;

type Slot = Arc<Mutex<Option<Array2<f32>>>>;

struct LiveTensor {
    allocated_at: Instant,
    slot: Slot,
}

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TensorStats {
    pub live: usize,
    pub allocated: u64,
    pub released: u64,
    pub swept: u64,
    pub pooled: usize,
}

struct RuntimeInner {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, LiveTensor>>,
    pool: Mutex<Vec<Vec<f32>>>,
    allocated: AtomicU64,
    released: AtomicU64,
    swept: AtomicU64,
    ceiling: usize,
    max_age: Duration,
}

impl RuntimeInner {
    fn release(&self, id: u64) {
        let Some(entry) = self.live.lock().remove(&id) else {
            return;
        };
        self.released.fetch_add(1, Ordering::Relaxed);
        let taken = entry.slot.lock().take();
        if let Some(array) = taken {
            self.recycle(array);
        }
    }

    fn recycle(&self, array: Array2<f32>) {
        let (mut buffer, _) = array.into_raw_vec_and_offset();
        buffer.clear();
        let mut pool = self.pool.lock();
        if pool.len() < MAX_POOLED_BUFFERS {
            pool.push(buffer);
        }
    }

    fn buffer(&self, len: usize) -> Vec<f32> {
        let mut pool = self.pool.lock();
        match pool.iter().position(|b| b.capacity() >= len) {
            Some(i) => pool.swap_remove(i),
            None => Vec::with_capacity(len),
        }
    }
}

/// Shared tensor registry
#[derive(Clone)]
pub struct TensorRuntime {
    inner: Arc<RuntimeInner>,
}

impl TensorRuntime {
    pub fn new(ceiling: usize, max_age: Duration) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                next_id: AtomicU64::new(1),
                live: Mutex::new(HashMap::new()),
                pool: Mutex::new(Vec::new()),
                allocated: AtomicU64::new(0),
                released: AtomicU64::new(0),
                swept: AtomicU64::new(0),
                ceiling: ceiling.max(1),
                max_age,
            }),
        }
    }

    pub fn from_config(config: &MlConfig) -> Self {
        Self::new(config.tensor_ceiling, Duration::from_millis(config.tensor_max_age_ms))
    }

    /// Allocate a `rows x cols` tensor filled from `values` (zero padded)
    pub fn allocate(&self, rows: usize, cols: usize, values: &[f32]) -> TensorLease {
        let len = rows * cols;
        let mut buffer = self.inner.buffer(len);
        buffer.extend(values.iter().copied().take(len));
        buffer.resize(len, 0.0);
        // Shape always matches the buffer length above
        let array = Array2::from_shape_vec((rows, cols), buffer).unwrap_or_else(|_| Array2::zeros((rows, cols)));

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot: Slot = Arc::new(Mutex::new(Some(array)));
        self.inner.live.lock().insert(
            id,
            LiveTensor {
                allocated_at: Instant::now(),
                slot: slot.clone(),
            },
        );
        self.inner.allocated.fetch_add(1, Ordering::Relaxed);

        TensorLease {
            id,
            slot,
            runtime: self.inner.clone(),
        }
    }

    /// Open a scope whose leases are all released when it drops
    pub fn scope(&self) -> TensorScope<'_> {
        TensorScope {
            runtime: self,
            ids: Vec::new(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    pub fn stats(&self) -> TensorStats {
        TensorStats {
            live: self.live_count(),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            swept: self.inner.swept.load(Ordering::Relaxed),
            pooled: self.inner.pool.lock().len(),
        }
    }

    /// Reclaim the oldest leases above the ceiling and trim the buffer pool.
    /// Leases younger than the max age are never reclaimed. Returns the
    /// number of leases reclaimed.
    pub fn sweep(&self) -> usize {
        let reclaimed: Vec<LiveTensor> = {
            let mut live = self.inner.live.lock();
            if live.len() <= self.inner.ceiling {
                Vec::new()
            } else {
                let excess = live.len() - self.inner.ceiling;
                let now = Instant::now();
                let mut candidates: Vec<(u64, Instant)> = live
                    .iter()
                    .filter(|(_, t)| now.duration_since(t.allocated_at) >= self.inner.max_age)
                    .map(|(id, t)| (*id, t.allocated_at))
                    .collect();
                candidates.sort_by_key(|&(_, at)| at);
                candidates
                    .into_iter()
                    .take(excess)
                    .filter_map(|(id, _)| live.remove(&id))
                    .collect()
            }
        };

        let count = reclaimed.len();
        for entry in reclaimed {
            // Drop the buffer rather than pooling it; the holder may still be mid-read
            entry.slot.lock().take();
        }

        let trimmed = {
            let mut pool = self.inner.pool.lock();
            let keep = pool.len() / 2;
            let trimmed = pool.len() - keep;
            pool.truncate(keep);
            pool.shrink_to_fit();
            trimmed
        };

        if count > 0 {
            self.inner.swept.fetch_add(count as u64, Ordering::Relaxed);
            warn!(
                "Tensor sweep reclaimed {} leases over ceiling {} ({} live)",
                count,
                self.inner.ceiling,
                self.live_count()
            );
        } else if trimmed > 0 {
            debug!("Tensor sweep trimmed {} pooled buffers", trimmed);
        }
        count
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        runtime.sweep();
                    }
                }
            }
            debug!("Tensor sweeper stopped");
        })
    }
}

impl Default for TensorRuntime {
    fn default() -> Self {
        Self::from_config(&MlConfig::default())
    }
}

/// A registered tensor. Released on drop.
pub struct TensorLease {
    id: u64,
    slot: Slot,
    runtime: Arc<RuntimeInner>,
}

impl TensorLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Borrow the tensor. `None` once the sweeper reclaimed it.
    pub fn with_view<R>(&self, f: impl FnOnce(ArrayView2<'_, f32>) -> R) -> Option<R> {
        let guard = self.slot.lock();
        guard.as_ref().map(|array| f(array.view()))
    }

    pub fn is_reclaimed(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl Drop for TensorLease {
    fn drop(&mut self) {
        self.runtime.release(self.id);
    }
}

/// Groups the leases of one batch
pub struct TensorScope<'a> {
    runtime: &'a TensorRuntime,
    ids: Vec<u64>,
}

impl TensorScope<'_> {
    pub fn allocate(&mut self, rows: usize, cols: usize, values: &[f32]) -> TensorLease {
        let lease = self.runtime.allocate(rows, cols, values);
        self.ids.push(lease.id);
        lease
    }
}

impl Drop for TensorScope<'_> {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            self.runtime.inner.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_released_on_drop() {
        let runtime = TensorRuntime::new(8, Duration::ZERO);
        {
            let lease = runtime.allocate(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
            assert_eq!(runtime.live_count(), 1);
            let sum = lease.with_view(|v| v.sum()).unwrap();
            assert_eq!(sum, 21.0);
        }
        assert_eq!(runtime.live_count(), 0);
        let stats = runtime.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.pooled, 1);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let runtime = TensorRuntime::new(8, Duration::ZERO);
        let lease = runtime.allocate(2, 2, &[1.0]);
        let values = lease.with_view(|v| v.iter().copied().collect::<Vec<_>>()).unwrap();
        assert_eq!(values, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_scope_releases_leases_even_if_held() {
        let runtime = TensorRuntime::new(8, Duration::ZERO);
        let held;
        {
            let mut scope = runtime.scope();
            let _a = scope.allocate(1, 4, &[0.0; 4]);
            held = scope.allocate(1, 4, &[0.0; 4]);
            assert_eq!(runtime.live_count(), 2);
        }
        assert_eq!(runtime.live_count(), 0);
        // Releasing again from the lease's own drop is harmless
        drop(held);
        assert_eq!(runtime.stats().released, 2);
    }

    #[test]
    fn test_sweep_reclaims_oldest_over_ceiling() {
        let runtime = TensorRuntime::new(2, Duration::ZERO);
        let leases: Vec<TensorLease> = (0..4).map(|_| runtime.allocate(1, 1, &[1.0])).collect();
        assert_eq!(runtime.sweep(), 2);
        assert_eq!(runtime.live_count(), 2);
        assert!(leases[0].is_reclaimed());
        assert!(leases[1].is_reclaimed());
        assert!(!leases[3].is_reclaimed());
        assert!(leases[0].with_view(|v| v.len()).is_none());
        assert_eq!(runtime.stats().swept, 2);
    }

    #[test]
    fn test_sweep_spares_young_leases() {
        let runtime = TensorRuntime::new(1, Duration::from_secs(3600));
        let _leases: Vec<TensorLease> = (0..3).map(|_| runtime.allocate(1, 1, &[1.0])).collect();
        assert_eq!(runtime.sweep(), 0);
        assert_eq!(runtime.live_count(), 3);
    }

    #[tokio::test]
    async fn test_background_sweeper_stops_on_cancel() {
        let runtime = TensorRuntime::new(1, Duration::ZERO);
        let _leases: Vec<TensorLease> = (0..3).map(|_| runtime.allocate(1, 1, &[1.0])).collect();
        let cancel = CancellationToken::new();
        let handle = runtime.spawn_sweeper(Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.live_count(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }
}
