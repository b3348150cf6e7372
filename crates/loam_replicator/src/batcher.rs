//! Time- and size-triggered batching of work items.

use loam_core::{ScheduledTask, WorkExecutor};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

struct Inner<T> {
    queue: VecDeque<T>,
    scheduled: Option<ScheduledTask>,
    processing: bool,
}

/// An inbox that accumulates items and delivers them to a processor in
/// batches, when either the capacity is reached or the delay has elapsed
/// since the first queued item.
///
/// At most one batch is in flight at a time; items queued while a batch is
/// being processed accumulate for the next one. Dispatch happens on the
/// work executor, so the processor observes items in queue order and never
/// runs concurrently with itself.
pub struct Batcher<T: Send + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
    executor: WorkExecutor,
    capacity: usize,
    delay: Duration,
    processor: Arc<dyn Fn(Vec<T>) + Send + Sync>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates a batcher delivering to `processor` on `executor`.
    pub fn new(
        executor: WorkExecutor,
        capacity: usize,
        delay: Duration,
        processor: Arc<dyn Fn(Vec<T>) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                scheduled: None,
                processing: false,
            })),
            executor,
            capacity,
            delay,
            processor,
        })
    }

    /// Enqueues an item without blocking.
    pub fn queue(self: &Arc<Self>, item: T) {
        let full = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(item);
            inner.queue.len() >= self.capacity
        };
        if full {
            self.schedule_dispatch(Duration::ZERO);
        } else {
            self.schedule_dispatch_if_idle();
        }
    }

    /// Enqueues several items.
    pub fn queue_all(self: &Arc<Self>, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.queue(item);
        }
    }

    /// Forces an immediate dispatch of whatever is pending.
    pub fn flush(self: &Arc<Self>) {
        self.schedule_dispatch(Duration::ZERO);
    }

    /// Discards all pending items and cancels the pending dispatch.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        if let Some(scheduled) = inner.scheduled.take() {
            scheduled.cancel();
        }
    }

    /// Number of items waiting to be processed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Arms the delay timer if no dispatch is pending yet.
    fn schedule_dispatch_if_idle(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.scheduled.is_some() || inner.processing {
            return;
        }
        let batcher = Arc::clone(self);
        inner.scheduled = Some(self.executor.schedule(self.delay, move || {
            batcher.dispatch();
        }));
    }

    fn schedule_dispatch(self: &Arc<Self>, delay: Duration) {
        let mut inner = self.inner.lock();
        if let Some(scheduled) = inner.scheduled.take() {
            scheduled.cancel();
        }
        let batcher = Arc::clone(self);
        inner.scheduled = Some(self.executor.schedule(delay, move || {
            batcher.dispatch();
        }));
    }

    /// Runs on the executor: takes up to `capacity` items and hands them to
    /// the processor. Re-arms itself if items remain.
    fn dispatch(self: &Arc<Self>) {
        let batch = {
            let mut inner = self.inner.lock();
            inner.scheduled = None;
            if inner.processing || inner.queue.is_empty() {
                return;
            }
            inner.processing = true;
            let take = inner.queue.len().min(self.capacity);
            inner.queue.drain(..take).collect::<Vec<T>>()
        };
        trace!(size = batch.len(), "dispatching batch");
        (self.processor)(batch);
        let more = {
            let mut inner = self.inner.lock();
            inner.processing = false;
            !inner.queue.is_empty()
        };
        if more {
            self.schedule_dispatch(Duration::ZERO);
        }
    }
}
