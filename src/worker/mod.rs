//! Elastic worker pool for generation tasks.
//!
//! Capacity floats between a floor and a ceiling: a monitor samples
//! the active-task count and grows the pool when load passes 80% of
//! capacity, shrinks it when load falls under 30%. Submissions queue
//! on a semaphore whose permit count is the current capacity.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};

use crate::config::WorkerConfig;
use crate::error::WorkerError;

const GROW_THRESHOLD: f64 = 0.8;
const SHRINK_THRESHOLD: f64 = 0.3;

#[derive(Debug)]
struct PoolState {
    workers: usize,
    active: usize,
}

struct PoolInner {
    floor: usize,
    ceiling: usize,
    state: Mutex<PoolState>,
    slots: Arc<Semaphore>,
}

impl PoolInner {
    async fn note_start(&self) {
        let mut state = self.state.lock().await;
        state.active += 1;
        tracing::debug!(active = state.active, workers = state.workers, "task started");
    }

    async fn note_finish(&self) {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
        tracing::debug!(active = state.active, workers = state.workers, "task finished");
    }
}

/// Bounded-concurrency task pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        if config.floor == 0 || config.floor > config.ceiling {
            return Err(WorkerError::InvalidBounds {
                floor: config.floor,
                ceiling: config.ceiling,
            });
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                floor: config.floor,
                ceiling: config.ceiling,
                state: Mutex::new(PoolState {
                    workers: config.floor,
                    active: 0,
                }),
                slots: Arc::new(Semaphore::new(config.floor)),
            }),
        })
    }

    /// Submit a task; it waits for a free slot, runs, and always
    /// reclaims the slot — panics included.
    pub fn submit<F>(&self, task: F) -> tokio::task::JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let permit = match Arc::clone(&inner.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::error!("worker pool semaphore closed, dropping task");
                    return;
                }
            };
            inner.note_start().await;
            if std::panic::AssertUnwindSafe(task).catch_unwind().await.is_err() {
                tracing::error!("worker task panicked");
            }
            inner.note_finish().await;
            drop(permit);
        })
    }

    /// Run the sizing monitor forever at the configured interval.
    pub fn spawn_monitor(&self, config: &WorkerConfig) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let interval = config.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.rebalance().await;
            }
        })
    }

    /// One sizing step: compare load against capacity and move one
    /// worker toward the ceiling or the floor.
    pub async fn rebalance(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let load = state.active as f64;
        let capacity = state.workers as f64;

        if load > capacity * GROW_THRESHOLD && state.workers < inner.ceiling {
            state.workers += 1;
            inner.slots.add_permits(1);
            tracing::info!(workers = state.workers, active = state.active, "pool grew");
        } else if load < capacity * SHRINK_THRESHOLD && state.workers > inner.floor {
            // Retire a permit only if one is idle; never block a
            // queued task to shrink.
            if let Ok(permit) = inner.slots.try_acquire() {
                permit.forget();
                state.workers -= 1;
                tracing::info!(workers = state.workers, active = state.active, "pool shrank");
            }
        }
    }

    pub async fn workers(&self) -> usize {
        self.inner.state.lock().await.workers
    }

    pub async fn active(&self) -> usize {
        self.inner.state.lock().await.active
    }

    pub fn floor(&self) -> usize {
        self.inner.floor
    }

    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }
}
