//! The bounded request pool.

use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A small fixed pool of worker threads owning all remote HTTP requests.
///
/// Blocking I/O lives here so the work executor never waits on the network;
/// completions are posted back to the executor by the job itself.
pub struct RequestPool {
    tx: Option<Sender<Job>>,
    size: usize,
}

impl RequestPool {
    /// Spawns `size` workers.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..size {
            let rx: Arc<Mutex<Receiver<Job>>> = Arc::clone(&rx);
            let _ = std::thread::Builder::new()
                .name(format!("loam-remote-{i}"))
                .spawn(move || loop {
                    let job = {
                        let guard = rx.lock();
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => {
                            trace!("request pool worker exiting");
                            break;
                        }
                    }
                });
        }
        Self { tx: Some(tx), size }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueues a job. Returns `false` if the pool has been shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stops accepting jobs; workers exit after draining the queue.
    pub fn shutdown(&mut self) {
        self.tx = None;
    }
}

impl std::fmt::Debug for RequestPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPool").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn jobs_all_run() {
        let pool = RequestPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            assert!(pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let start = Instant::now();
        while counter.load(Ordering::SeqCst) < 20 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn jobs_run_concurrently_up_to_pool_size() {
        let pool = RequestPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(200));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let mut pool = RequestPool::new(1);
        pool.shutdown();
        assert!(!pool.execute(|| {}));
    }
}
