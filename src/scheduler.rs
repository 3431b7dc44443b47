//! Running extraction jobs on a bounded pool of workers
//! and keeping count of how many are left.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use log::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::job::{ExtractionJob, JobSettings};
use crate::read::ArchiveHandle;
use crate::result::*;

/// More workers than this just fight over the disk.
pub const MAX_WORKERS: usize = 8;

/// One worker per core, up to [`MAX_WORKERS`].
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map_or(1, |n| n.get())
        .min(MAX_WORKERS)
}

/// How many jobs a batch has, and how many haven't finished yet.
///
/// `remaining` only ever goes down, once per job,
/// whether that job succeeded, failed, or was skipped.
/// Reads never block, so a progress display can poll it
/// while the workers chew through the batch.
#[derive(Debug)]
pub struct ExtractionState {
    total: usize,
    remaining: AtomicUsize,
    cancelled: AtomicBool,
    lock: Mutex<()>,
    changed: Condvar,
}

impl ExtractionState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            remaining: AtomicUsize::new(total),
            cancelled: AtomicBool::new(false),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Asks the batch to stop: jobs that haven't started yet are skipped,
    /// and [`wait()`](Self::wait) returns right away.
    /// Jobs already underway run to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Blocks until every job has finished,
    /// or fails with [`ExtractError::InterruptedWait`] if the batch is cancelled first.
    pub fn wait(&self) -> ExtractResult<()> {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.remaining() == 0 {
                return Ok(());
            }
            if self.is_cancelled() {
                return Err(ExtractError::InterruptedWait);
            }
            guard = self
                .changed
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn complete_one(&self) {
        let before = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "More completions than jobs");
        if before == 1 {
            self.notify();
        }
    }

    fn notify(&self) {
        // Taking the lock means a waiter is either before its check
        // (and will see the new value) or parked (and will get woken).
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.changed.notify_all();
    }
}

/// Counts a job as done when dropped,
/// so it's counted exactly once even if the job panics.
struct Completion(Arc<ExtractionState>);

impl Drop for Completion {
    fn drop(&mut self) {
        self.0.complete_one();
    }
}

/// What happened to one job
#[derive(Debug)]
pub enum JobOutcome {
    Extracted(PathBuf),
    Failed(ExtractError),
    /// The batch was cancelled before the job started.
    Skipped,
}

/// A job that didn't make it to disk, and why
#[derive(Debug)]
pub struct JobFailure {
    pub entry: Utf8PathBuf,
    pub error: ExtractError,
}

/// The results of a whole batch
#[derive(Debug, Default)]
pub struct ExtractionReport {
    /// Destinations of every file and symlink written
    pub extracted: Vec<PathBuf>,
    pub failed: Vec<JobFailure>,
    pub skipped: Vec<Utf8PathBuf>,
}

impl ExtractionReport {
    pub fn succeeded(&self) -> usize {
        self.extracted.len()
    }

    /// True if every job made it to disk
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    fn record(&mut self, entry: Utf8PathBuf, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Extracted(path) => self.extracted.push(path),
            JobOutcome::Failed(error) => self.failed.push(JobFailure { entry, error }),
            JobOutcome::Skipped => self.skipped.push(entry),
        }
    }
}

/// Runs a batch of [`ExtractionJob`]s on a fixed-size pool.
///
/// Scheduling consumes the scheduler, taking its pool down with it,
/// so nothing can be submitted once a batch is done.
pub struct ExtractionScheduler {
    pool: ThreadPool,
    state: Arc<ExtractionState>,
}

impl ExtractionScheduler {
    /// Starts `workers` threads (clamped to `1..=MAX_WORKERS`)
    /// that will count their jobs off against `state`.
    pub fn new(workers: usize, state: Arc<ExtractionState>) -> ExtractResult<Self> {
        let workers = workers.clamp(1, MAX_WORKERS);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("zipper-worker-{}", i))
            .panic_handler(|_| error!("An extraction job panicked"))
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .io_context(|| format!("Couldn't start {} extraction workers", workers))?;
        debug!("Started {} extraction workers", workers);
        Ok(Self { pool, state })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn total_count(&self) -> usize {
        self.state.total()
    }

    pub fn remaining_count(&self) -> usize {
        self.state.remaining()
    }

    /// Submits every job, then blocks until all of them have finished
    /// (or the batch is cancelled).
    ///
    /// A failing job is logged and recorded in the report;
    /// it doesn't stop any of the others.
    pub fn schedule(
        self,
        archive: Arc<ArchiveHandle>,
        jobs: Vec<ExtractionJob>,
        settings: JobSettings,
    ) -> ExtractResult<ExtractionReport> {
        debug_assert_eq!(jobs.len(), self.state.total());
        let (sender, results) = mpsc::channel();

        for job in jobs {
            let archive = Arc::clone(&archive);
            let sender = sender.clone();
            // Counted down after the result is sent (locals drop in reverse order),
            // so by the time wait() returns, every result is in the channel.
            let completion = Completion(Arc::clone(&self.state));
            self.pool.spawn(move || {
                let completion = completion;
                let entry = job.entry().path.clone().into_owned();
                let outcome = run_job(&completion.0, &entry, || job.execute(&archive, &settings));
                // Nobody's listening if the batch was cancelled. That's fine.
                let _ = sender.send((entry, outcome));
            });
        }
        drop(sender);

        self.state.wait()?;

        let mut report = ExtractionReport::default();
        for (entry, outcome) in results.try_iter() {
            report.record(entry, outcome);
        }
        info!(
            "{} of {} extracted, {} failed",
            report.succeeded(),
            self.state.total(),
            report.failed.len()
        );
        Ok(report)
    }
}

/// Runs one job unless the batch was cancelled,
/// turning a panic into a failure so the report still adds up.
fn run_job<F>(state: &ExtractionState, entry: &Utf8Path, job: F) -> JobOutcome
where
    F: FnOnce() -> ExtractResult<PathBuf>,
{
    if state.is_cancelled() {
        debug!("Skipping {}", entry);
        return JobOutcome::Skipped;
    }
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(path)) => JobOutcome::Extracted(path),
        Ok(Err(error)) => {
            warn!("Couldn't extract {}: {}", entry, error);
            JobOutcome::Failed(error)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Extracting {} panicked: {}", entry, message);
            JobOutcome::Failed(ExtractError::Panicked(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
