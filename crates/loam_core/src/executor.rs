//! The single-threaded work executor.
//!
//! All replication state transitions, inbox processing and callback fan-out
//! run on one thread per [`Manager`](crate::Manager) instance. Handlers must
//! never block on network I/O; blocking work belongs on a request pool that
//! posts its completion back here.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    RunAt(Instant, u64, Task, Arc<AtomicBool>),
}

struct Delayed {
    due: Instant,
    id: u64,
    task: Task,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.id).cmp(&(other.due, other.id))
    }
}

/// Handle to a task scheduled with [`WorkExecutor::schedule`].
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Prevents the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the task has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A single worker thread executing submitted closures in order, with
/// support for delayed, cancellable tasks.
///
/// Cloning yields another handle to the same thread. The thread exits when
/// the last handle is dropped.
#[derive(Clone)]
pub struct WorkExecutor {
    tx: Sender<Message>,
    next_id: Arc<AtomicU64>,
}

impl WorkExecutor {
    /// Spawns the executor thread.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let thread_name = format!("loam-work-{name}");
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut heap: BinaryHeap<Reverse<Delayed>> = BinaryHeap::new();
                loop {
                    // Run everything that is due.
                    let now = Instant::now();
                    while heap.peek().is_some_and(|d| d.0.due <= now) {
                        let Some(Reverse(delayed)) = heap.pop() else {
                            break;
                        };
                        if !delayed.cancelled.load(Ordering::SeqCst) {
                            (delayed.task)();
                        }
                    }

                    let timeout = heap
                        .peek()
                        .map(|d| d.0.due.saturating_duration_since(Instant::now()));
                    let message = match timeout {
                        Some(t) => match rx.recv_timeout(t) {
                            Ok(m) => Some(m),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(m) => Some(m),
                            Err(_) => break,
                        },
                    };
                    match message {
                        Some(Message::Run(task)) => task(),
                        Some(Message::RunAt(due, id, task, cancelled)) => {
                            heap.push(Reverse(Delayed {
                                due,
                                id,
                                task,
                                cancelled,
                            }));
                        }
                        None => {}
                    }
                }
                trace!("work executor exiting");
            })
            .expect("failed to spawn work executor thread");
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues a task to run as soon as the thread is free.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        // A send failure means the executor thread is gone; tasks submitted
        // during teardown are dropped.
        let _ = self.tx.send(Message::Run(Box::new(task)));
    }

    /// Schedules a task to run after `delay`. The returned handle can cancel
    /// it until it starts.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> ScheduledTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Message::RunAt(
            Instant::now() + delay,
            id,
            Box::new(task),
            Arc::clone(&cancelled),
        ));
        ScheduledTask { cancelled }
    }

    /// Runs a closure on the executor and blocks until it completes.
    ///
    /// Must not be called from the executor thread itself.
    pub fn run_sync<R: Send + 'static>(&self, task: impl FnOnce() -> R + Send + 'static) -> R {
        let (tx, rx) = mpsc::channel();
        self.submit(move || {
            let _ = tx.send(task());
        });
        rx.recv().expect("work executor dropped the task")
    }
}

impl std::fmt::Debug for WorkExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkExecutor")
    }
}
