//! The UDF manager: one dispatch thread feeding a worker pool.
//!
//! The dispatcher pops frames off the input queue, stamps the target output
//! encoding, and submits one job per frame. Each job walks the UDF chain in
//! order and pushes surviving frames to the output queue with a blocking
//! push, so a saturated output propagates pressure back through the pool's
//! bounded job queue to the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use frame_core::{EncodeType, Frame, FrameQueue, QueueFull};
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::RuntimeError;
use crate::handle::{UdfHandle, UdfOutcome};
use crate::loader::load_udf;
use crate::pool::{PoolFull, ThreadPool, spawn_thread};

/// How often the dispatcher re-checks its stop flag while the input queue
/// is idle.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Backoff between submission retries while the pool is full.
const SUBMIT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

type Chain = Arc<Vec<Mutex<Box<dyn UdfHandle>>>>;

/// Coordinates the UDF chain between an input and an output frame queue.
pub struct UdfManager {
    chain: Chain,
    pool: Arc<ThreadPool>,
    input: FrameQueue,
    output: FrameQueue,
    target_encoding: (EncodeType, i32),
    stop_flag: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    stopped: bool,
}

impl UdfManager {
    /// Build a manager from a configuration document, loading every UDF in
    /// the `udfs` array in order.
    ///
    /// `target_encoding` is applied to plane 0 of every frame whose
    /// encoding differs, before the chain runs; pass
    /// `(EncodeType::None, 0)` to leave frames untouched.
    pub fn from_config(
        doc: &serde_json::Value,
        input: FrameQueue,
        output: FrameQueue,
        target_encoding: (EncodeType, i32),
    ) -> Result<Self, RuntimeError> {
        let config = ManagerConfig::from_json(doc)?;
        let mut handles = Vec::with_capacity(config.udfs.len());
        for udf in &config.udfs {
            handles.push(load_udf(udf)?);
        }
        Self::with_chain(
            handles,
            config.max_workers,
            config.max_jobs,
            input,
            output,
            target_encoding,
        )
    }

    /// Build a manager around pre-constructed handles. This is the entry
    /// point for embedders that assemble stages programmatically.
    pub fn with_chain(
        handles: Vec<Box<dyn UdfHandle>>,
        max_workers: usize,
        max_jobs: usize,
        input: FrameQueue,
        output: FrameQueue,
        target_encoding: (EncodeType, i32),
    ) -> Result<Self, RuntimeError> {
        let (encode, level) = target_encoding;
        if !encode.level_valid(level) {
            return Err(RuntimeError::ConfigInvalid(format!(
                "encoding level {level} is invalid for {encode:?}"
            )));
        }
        info!(
            udfs = handles.len(),
            max_workers, max_jobs, "UDF manager constructed"
        );
        Ok(Self {
            chain: Arc::new(handles.into_iter().map(Mutex::new).collect()),
            pool: Arc::new(ThreadPool::new(max_workers, max_jobs)),
            input,
            output,
            target_encoding,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
            stopped: false,
        })
    }

    /// Spawn the dispatch thread. Starting twice, or after [`Self::stop`],
    /// is rejected.
    pub fn start(&mut self) {
        if self.thread.is_some() || self.stopped {
            warn!("start attempted after start or after stop");
            return;
        }

        let chain = self.chain.clone();
        let pool = self.pool.clone();
        let input = self.input.clone();
        let output = self.output.clone();
        let stop_flag = self.stop_flag.clone();
        let target = self.target_encoding;

        let handle = spawn_thread("udf-manager", move || {
            dispatch_loop(chain, pool, input, output, stop_flag, target);
        })
        .expect("failed to spawn UDF manager thread");
        self.thread = Some(handle);
    }

    /// Signal the dispatch thread, join it, and stop the pool. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            let _ = handle.join();
            self.pool.stop();
            self.stopped = true;
            info!("UDF manager stopped");
        }
    }
}

impl Drop for UdfManager {
    fn drop(&mut self) {
        self.stop();
        // Tear the chain down in reverse construction order. The pool has
        // stopped, so this is the last reference.
        let chain = std::mem::replace(&mut self.chain, Arc::new(Vec::new()));
        if let Ok(mut handles) = Arc::try_unwrap(chain) {
            while let Some(handle) = handles.pop() {
                drop(handle);
            }
        }
    }
}

fn dispatch_loop(
    chain: Chain,
    pool: Arc<ThreadPool>,
    input: FrameQueue,
    output: FrameQueue,
    stop_flag: Arc<AtomicBool>,
    target: (EncodeType, i32),
) {
    info!("UDF manager thread started");

    while !stop_flag.load(Ordering::Relaxed) {
        let Some(mut frame) = input.pop_timeout(INPUT_POLL_INTERVAL) else {
            continue;
        };
        metrics::gauge!("udf_queue_depth", "queue" => "input").set(input.len() as f64);

        let (encode, level) = target;
        if encode != EncodeType::None {
            let differs = frame.encode_type(0).map(|current| current != encode).unwrap_or(false)
                || frame.encode_level(0).map(|current| current != level).unwrap_or(false);
            if differs {
                if let Err(err) = frame.set_encoding(encode, level, 0) {
                    error!("failed to apply output encoding: {err}");
                }
            }
        }

        let job = {
            let chain = chain.clone();
            let output = output.clone();
            Box::new(move || run_chain(&chain, frame, &output))
        };

        // Backpressure: hold the frame and retry until the pool accepts it.
        let mut job: Box<dyn FnOnce() + Send> = job;
        loop {
            match pool.submit(job) {
                Ok(()) => break,
                Err(PoolFull(rejected)) => {
                    if stop_flag.load(Ordering::Relaxed) {
                        debug!("discarding frame rejected by stopping pool");
                        break;
                    }
                    job = rejected;
                    thread::sleep(SUBMIT_RETRY_INTERVAL);
                }
            }
        }
    }

    info!("UDF manager thread stopped");
}

/// Walk the chain over one frame. Runs on a pool worker.
fn run_chain(chain: &[Mutex<Box<dyn UdfHandle>>], mut frame: Frame, output: &FrameQueue) {
    for entry in chain {
        let Ok(mut handle) = entry.lock() else {
            error!("UDF handle lock poisoned; dropping frame");
            metrics::counter!("udf_process_errors_total").increment(1);
            return;
        };

        let started = Instant::now();
        let outcome = handle.process(&mut frame);
        metrics::histogram!("udf_process_seconds", "udf" => handle.name().to_string())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(UdfOutcome::Pass) | Ok(UdfOutcome::Modified) => {}
            Ok(UdfOutcome::Drop) => {
                debug!(udf = handle.name(), "dropping frame");
                metrics::counter!("udf_dropped_frames_total").increment(1);
                return;
            }
            Err(err) => {
                error!(udf = handle.name(), "failed to process frame: {err}");
                metrics::counter!("udf_process_errors_total").increment(1);
                return;
            }
        }
    }

    match output.push(frame) {
        Ok(()) => {}
        Err(QueueFull(frame)) => {
            debug!("output queue full, blocking");
            metrics::counter!("udf_output_blocked_total").increment(1);
            output.push_wait(frame);
        }
    }
    metrics::gauge!("udf_queue_depth", "queue" => "output").set(output.len() as f64);
}
