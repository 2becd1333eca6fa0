//! Bulkhead implementation for concurrency limiting with a bounded FIFO wait queue

use crate::dynamic::DynamicConfig;
use crate::policy::BulkheadConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a caller was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadRejection {
    /// Every permit is held and the wait queue is full.
    Full { in_flight: usize, max: usize, queued: usize },
    /// Waited `waited` in the queue without getting a permit.
    QueueTimeout { waited: Duration },
    /// The caller cancelled while queued.
    Cancelled,
}

/// Held for the duration of a call; dropping it hands the permit to the next queued caller.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    waited: Option<Duration>,
}

impl BulkheadPermit {
    /// Time spent queued, `None` when admitted immediately.
    pub fn waited(&self) -> Option<Duration> {
        self.waited
    }
}

/// Counting semaphore of `max_concurrent` permits plus a wait queue of at most `max_queue`
/// callers. Tokio's semaphore is fair, so queued callers are served in arrival order.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    config: DynamicConfig<BulkheadConfig>,
    queued: AtomicUsize,
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent())),
            config: DynamicConfig::new(config),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> Arc<BulkheadConfig> {
        self.config.get()
    }

    /// Apply `config` in place when only the queue timeout differs. Returns `false`, leaving
    /// the bulkhead untouched, when `max_concurrent` or `max_queue` changed; those need a new
    /// bulkhead. Permits still held on the replaced bulkhead are not counted by the new one, so
    /// concurrency can briefly reach the old plus the new `max_concurrent`.
    pub fn update_config(&self, config: BulkheadConfig) -> bool {
        let current = self.config.get();
        if current.max_concurrent() != config.max_concurrent()
            || current.max_queue() != config.max_queue()
        {
            return false;
        }
        self.config.set(config);
        true
    }

    pub fn in_flight(&self) -> usize {
        self.config.get().max_concurrent().saturating_sub(self.semaphore.available_permits())
    }

    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Take a permit now, or wait in the queue for up to `queue_timeout`.
    pub async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BulkheadPermit, BulkheadRejection> {
        if cancel.is_cancelled() {
            return Err(BulkheadRejection::Cancelled);
        }
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(BulkheadPermit { _permit: permit, waited: None });
        }

        let _slot = self.reserve_queue_slot()?;
        let start = Instant::now();
        tracing::debug!(queued = self.queue_depth(), "bulkhead: waiting for permit");

        let queue_timeout = self.config.get().queue_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BulkheadRejection::Cancelled),
            acquired = tokio::time::timeout(
                queue_timeout,
                self.semaphore.clone().acquire_owned(),
            ) => match acquired {
                Ok(Ok(permit)) => Ok(BulkheadPermit { _permit: permit, waited: Some(start.elapsed()) }),
                Ok(Err(_closed)) => Err(self.full()),
                Err(_elapsed) => Err(BulkheadRejection::QueueTimeout { waited: start.elapsed() }),
            },
        }
    }

    fn reserve_queue_slot(&self) -> Result<QueueSlot<'_>, BulkheadRejection> {
        let max_queue = self.config.get().max_queue();
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| (q < max_queue).then_some(q + 1))
            .map(|_| QueueSlot(&self.queued))
            .map_err(|_| self.full())
    }

    fn full(&self) -> BulkheadRejection {
        BulkheadRejection::Full {
            in_flight: self.in_flight(),
            max: self.config.get().max_concurrent(),
            queued: self.queue_depth(),
        }
    }
}
