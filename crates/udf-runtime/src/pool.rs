//! Bounded worker pool executing per-frame UDF jobs.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::debug;

/// A unit of work. Whatever the closure owns (the frame, the job context)
/// is released when the closure runs or is discarded at pool stop.
pub type Job = Box<dyn FnOnce() + Send>;

/// Returned by [`ThreadPool::submit`] when the job queue is full; carries
/// the job back so the caller can retry.
pub struct PoolFull(pub Job);

/// Fixed set of worker threads draining a bounded job queue.
pub struct ThreadPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl ThreadPool {
    /// Spawn `workers` threads behind a queue bounded to `max_jobs`.
    pub fn new(workers: usize, max_jobs: usize) -> Self {
        let (tx, rx) = bounded::<Job>(max_jobs);
        let running = Arc::new(AtomicBool::new(true));

        let handles = (0..workers.max(1))
            .map(|index| {
                let rx = rx.clone();
                let running = running.clone();
                spawn_thread(format!("udf-worker-{index}"), move || {
                    worker_loop(rx, running)
                })
                .expect("failed to spawn pool worker thread")
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            running,
        }
    }

    /// Queue a job. Fails with [`PoolFull`] when the bounded queue is at
    /// capacity, handing the job back to the caller.
    pub fn submit(&self, job: Job) -> Result<(), PoolFull> {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(_) => return Err(PoolFull(job)),
        };
        match guard.as_ref() {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                    Err(PoolFull(job))
                }
            },
            // Stopped pool accepts nothing; the job context drops here.
            None => Err(PoolFull(job)),
        }
    }

    /// Stop the pool: in-flight jobs run to completion, queued jobs are
    /// discarded (releasing whatever they own), workers are joined.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
        debug!("thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(rx: Receiver<Job>, running: Arc<AtomicBool>) {
    loop {
        match rx.recv() {
            Ok(job) => {
                if running.load(Ordering::Relaxed) {
                    job();
                } else {
                    // Pool is stopping: drain the job without running it so
                    // its owned resources release.
                    drop(job);
                }
            }
            Err(_) => break,
        }
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(
    name: impl Into<String>,
    f: F,
) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn jobs_execute_on_workers() {
        let pool = ThreadPool::new(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_or_else(|_| panic!("queue unexpectedly full"));
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn submit_hands_job_back_when_full() {
        let pool = ThreadPool::new(1, 1);
        let gate = Arc::new(AtomicBool::new(false));

        // Occupy the single worker, then fill the single queue slot.
        let worker_gate = gate.clone();
        pool.submit(Box::new(move || {
            while !worker_gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }))
        .unwrap_or_else(|_| panic!("first submit must succeed"));
        thread::sleep(Duration::from_millis(20));
        pool.submit(Box::new(|| {}))
            .unwrap_or_else(|_| panic!("queue slot available"));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let rejected = pool.submit(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(rejected.is_err());

        // The rejected job is still runnable by the caller.
        let PoolFull(job) = rejected.err().expect("pool reported full");
        gate.store(true, Ordering::SeqCst);
        job();
        assert!(ran.load(Ordering::SeqCst));
        pool.stop();
    }

    #[test]
    fn stop_releases_queued_contexts_without_running_them() {
        struct Context {
            ran: Arc<AtomicBool>,
            released: Arc<AtomicUsize>,
        }
        impl Drop for Context {
            fn drop(&mut self) {
                self.released.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = Arc::new(ThreadPool::new(1, 4));
        let gate = Arc::new(AtomicBool::new(false));
        let worker_gate = gate.clone();
        pool.submit(Box::new(move || {
            while !worker_gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }))
        .unwrap_or_else(|_| panic!("first submit must succeed"));
        thread::sleep(Duration::from_millis(20));

        let ran = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let ctx = Context {
                ran: ran.clone(),
                released: released.clone(),
            };
            pool.submit(Box::new(move || {
                let ctx = ctx;
                ctx.ran.store(true, Ordering::SeqCst);
            }))
            .unwrap_or_else(|_| panic!("queue has room"));
        }

        // Begin the stop on another thread: it clears the running flag
        // immediately, then blocks joining the gated worker.
        let stopper = {
            let pool = pool.clone();
            thread::spawn(move || pool.stop())
        };
        thread::sleep(Duration::from_millis(20));
        gate.store(true, Ordering::SeqCst);
        stopper.join().unwrap();

        // Queued jobs were discarded without running, but their contexts
        // were released.
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }
}
