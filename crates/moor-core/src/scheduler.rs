//! Per-worker-group admission control.
//!
//! Every statement takes a slot from its group's [`AdmissionScheduler`]
//! before it is dispatched and gives it back when the [`AdmissionPermit`]
//! drops. Waiters are admitted in FIFO order.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounded FIFO admission for one worker group.
#[derive(Debug)]
pub struct AdmissionScheduler {
    key: String,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl AdmissionScheduler {
    /// `max_concurrency` is clamped to at least 1.
    pub fn new(key: impl Into<String>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            key: key.into(),
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            counters: Arc::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Acquire)
    }

    /// Highest in-flight count observed.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    /// Wait for a slot. Fails only once the scheduler is closed.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let waiting = QueuedGuard::enter(&self.counters);
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::InvalidOperation(format!("scheduler {} is closed", self.key)))?;
        drop(waiting);

        let now = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(now, Ordering::AcqRel);
        trace!(key = %self.key, in_flight = now, "admitted");
        Ok(AdmissionPermit {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    /// Run `fut` while holding a slot.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }

    /// Fail current and future waiters. Permits already handed out stay
    /// valid until dropped.
    pub fn close(&self) {
        debug!(key = %self.key, "closing admission scheduler");
        self.permits.close();
    }
}

/// Counts a waiter as queued until admitted or abandoned.
struct QueuedGuard<'a>(&'a Counters);

impl<'a> QueuedGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.queued.fetch_add(1, Ordering::AcqRel);
        Self(counters)
    }
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A held admission slot, released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One scheduler per key, created on first use.
#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    schedulers: Mutex<FxHashMap<String, Arc<AdmissionScheduler>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedulers(&self) -> MutexGuard<'_, FxHashMap<String, Arc<AdmissionScheduler>>> {
        self.schedulers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The scheduler for `key`. `max_concurrency` only applies when the
    /// scheduler is created.
    pub fn create_or_get(&self, key: &str, max_concurrency: usize) -> Arc<AdmissionScheduler> {
        self.schedulers()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AdmissionScheduler::new(key, max_concurrency)))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<AdmissionScheduler>> {
        self.schedulers().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<AdmissionScheduler>> {
        let removed = self.schedulers().remove(key);
        if let Some(scheduler) = &removed {
            scheduler.close();
        }
        removed
    }
}
