//! Worker slot pool with contention-checked port blocks.
//!
//! The [`WorkerAllocator`] owns a fixed number of [`Worker`] slots. Each
//! acquisition claims an idle slot, assigns it the next port block from a
//! shared [`PortCursor`], and verifies both ports of the block are free
//! before returning the worker. Busy ports put the slot back and the
//! acquisition retries after a backoff, up to a hard ceiling.
//!
//! ```text
//!   get() ──► poll for idle slot ──► mark occupied ──► cursor.next_base()
//!                 ▲                                         │
//!                 │ backoff                                 ▼
//!                 └──── mark idle ◄── busy ──── probe(base), probe(base + 1)
//!                                                           │ free
//!                                                           ▼
//!                                             lease.acquire() ──► Worker
//! ```
//!
//! The cursor and the occupancy flags are the only state shared between
//! attempts. Both live behind one mutex that is never held across an await.

pub mod ports;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{PortConfig, TimingConfig};

pub use ports::{NetworkPortProbe, PortCursor, PortProbe};

/// Errors returned by the allocator.
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// No contention-free worker could be found within the attempt ceiling.
    #[error("Could not allocate a worker after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The external lease hook refused the worker.
    #[error("Worker lease failed: {0}")]
    Lease(String),

    /// The pool was configured without any slots.
    #[error("Worker pool must have at least one slot")]
    Empty,
}

/// One slot of the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    /// 1-based, stable for the lifetime of the pool.
    pub index: usize,
    pub occupied: bool,
    /// Base of the port block. Reassigned on every acquisition.
    pub port_offset: u16,
    /// Provider-specific lease token, e.g. a remote VM lease.
    pub token: Option<String>,
    pub tunnel_id: Option<String>,
}

impl Worker {
    pub fn new(index: usize, tunnel_id: Option<String>) -> Self {
        Self {
            index,
            occupied: false,
            port_offset: 0,
            token: None,
            tunnel_id,
        }
    }
}

/// Hook for external resources bound to a worker for one attempt.
///
/// `release` failures are logged; the local slot is freed regardless.
#[async_trait]
pub trait WorkerLease: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after ports are verified. May set `worker.token`.
    async fn acquire(&self, _worker: &mut Worker) -> anyhow::Result<()> {
        Ok(())
    }

    async fn release(&self, worker: &Worker) -> anyhow::Result<()>;

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct PoolState {
    workers: Vec<Worker>,
    cursor: PortCursor,
    peak_occupied: usize,
}

/// A fixed-capacity pool of worker slots.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use testfleet::allocator::{NetworkPortProbe, WorkerAllocator};
/// use testfleet::config::{PortConfig, TimingConfig};
///
/// # async fn example() -> anyhow::Result<()> {
/// let ports = PortConfig::default();
/// let probe = Arc::new(NetworkPortProbe::new(ports.probe_timeout())?);
/// let allocator = WorkerAllocator::new(4, &ports, &TimingConfig::default(), probe);
///
/// allocator.initialize().await?;
/// let worker = allocator.get().await?;
/// println!("worker {} on ports {}/{}", worker.index, worker.port_offset, worker.port_offset + 1);
/// allocator.release(&worker).await;
/// allocator.teardown().await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerAllocator {
    state: Mutex<PoolState>,
    probe: Arc<dyn PortProbe>,
    lease: Option<Arc<dyn WorkerLease>>,
    max_workers: usize,
    max_attempts: u32,
    poll_interval: Duration,
    backoff: Duration,
}

impl WorkerAllocator {
    /// Builds `max_workers` idle slots. Tunnels are assigned round-robin.
    pub fn new(
        max_workers: usize,
        ports: &PortConfig,
        timing: &TimingConfig,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        let workers = (1..=max_workers)
            .map(|index| {
                let tunnel = if ports.tunnels.is_empty() {
                    None
                } else {
                    Some(ports.tunnels[(index - 1) % ports.tunnels.len()].clone())
                };
                Worker::new(index, tunnel)
            })
            .collect();

        Self {
            state: Mutex::new(PoolState {
                workers,
                cursor: PortCursor::from_config(ports),
                peak_occupied: 0,
            }),
            probe,
            lease: None,
            max_workers,
            max_attempts: ports.acquire_attempts.max(1),
            poll_interval: timing.worker_poll(),
            backoff: timing.allocation_backoff(),
        }
    }

    /// Attaches an external lease hook.
    pub fn with_lease(mut self, lease: Arc<dyn WorkerLease>) -> Self {
        self.lease = Some(lease);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves plain flags behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn initialize(&self) -> Result<(), AllocatorError> {
        if self.max_workers == 0 {
            return Err(AllocatorError::Empty);
        }
        if let Some(lease) = &self.lease {
            lease
                .initialize()
                .await
                .map_err(|e| AllocatorError::Lease(e.to_string()))?;
        }
        info!("Initialized worker pool with {} slots", self.max_workers);
        Ok(())
    }

    /// Acquires a worker with a verified-free port pair.
    ///
    /// Waits (polling) while every slot is occupied. Fails with
    /// [`AllocatorError::Exhausted`] once `acquire_attempts` port blocks in a
    /// row turned out to be busy or still held by another occupied slot.
    pub async fn get(&self) -> Result<Worker, AllocatorError> {
        let mut attempts = 0;
        loop {
            let (mut worker, held) = self.claim_idle_slot().await;
            let base = worker.port_offset;

            if held {
                debug!(
                    "Ports {}/{} still held by another worker, skipping",
                    base,
                    base.saturating_add(1)
                );
            } else if self.ports_free(base).await {
                if let Some(lease) = &self.lease {
                    if let Err(e) = lease.acquire(&mut worker).await {
                        self.mark_idle(worker.index);
                        return Err(AllocatorError::Lease(e.to_string()));
                    }
                    self.store_token(&worker);
                }
                debug!(
                    "Acquired worker {} with ports {}/{}",
                    worker.index,
                    base,
                    base.saturating_add(1)
                );
                return Ok(worker);
            } else {
                debug!(
                    "Ports {}/{} busy for worker {}, retrying",
                    base,
                    base.saturating_add(1),
                    worker.index
                );
            }
            self.mark_idle(worker.index);

            attempts += 1;
            if attempts >= self.max_attempts {
                warn!("Could not allocate a worker after {} attempts", attempts);
                return Err(AllocatorError::Exhausted { attempts });
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    async fn ports_free(&self, base: u16) -> bool {
        self.probe.is_free(base).await && self.probe.is_free(base.saturating_add(1)).await
    }

    /// Marks an idle slot occupied and gives it the next port block.
    ///
    /// The flag is `true` when that block belongs to another occupied slot,
    /// which happens once the cursor wraps.
    async fn claim_idle_slot(&self) -> (Worker, bool) {
        loop {
            {
                let mut state = self.lock();
                if let Some(pos) = state.workers.iter().position(|w| !w.occupied) {
                    let base = state.cursor.next_base();
                    let held = state
                        .workers
                        .iter()
                        .any(|w| w.occupied && w.port_offset == base);
                    let worker = &mut state.workers[pos];
                    worker.occupied = true;
                    worker.port_offset = base;
                    worker.token = None;
                    let claimed = worker.clone();
                    let occupied = state.workers.iter().filter(|w| w.occupied).count();
                    state.peak_occupied = state.peak_occupied.max(occupied);
                    return (claimed, held);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn store_token(&self, worker: &Worker) {
        let mut state = self.lock();
        if let Some(slot) = state.workers.iter_mut().find(|w| w.index == worker.index) {
            slot.token = worker.token.clone();
        }
    }

    fn mark_idle(&self, index: usize) -> bool {
        let mut state = self.lock();
        match state.workers.iter_mut().find(|w| w.index == index) {
            Some(slot) if slot.occupied => {
                slot.occupied = false;
                slot.token = None;
                true
            }
            _ => false,
        }
    }

    /// Returns a worker to the pool.
    ///
    /// Runs the lease hook first; its failure is logged and the slot is still
    /// freed. Releasing an idle worker is a no-op.
    pub async fn release(&self, worker: &Worker) {
        if let Some(lease) = &self.lease
            && let Err(e) = lease.release(worker).await
        {
            warn!("Failed to release lease of worker {}: {}", worker.index, e);
        }

        if !self.mark_idle(worker.index) {
            debug!("Worker {} was already idle", worker.index);
        }
    }

    /// Frees every slot and tears down the lease hook.
    pub async fn teardown(&self) {
        if let Some(lease) = &self.lease
            && let Err(e) = lease.teardown().await
        {
            warn!("Failed to tear down worker leases: {}", e);
        }
        let mut state = self.lock();
        for worker in &mut state.workers {
            worker.occupied = false;
            worker.token = None;
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn occupied_count(&self) -> usize {
        self.lock().workers.iter().filter(|w| w.occupied).count()
    }

    /// Highest number of simultaneously occupied slots seen so far.
    pub fn peak_occupied(&self) -> usize {
        self.lock().peak_occupied
    }

    /// Snapshot of all slots.
    pub fn workers(&self) -> Vec<Worker> {
        self.lock().workers.clone()
    }
}
