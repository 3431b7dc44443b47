//! Extracting a whole archive: validate, open, enumerate, then run every job.
//!
//! ```no_run
//! # use zipper::*;
//! let mut engine = ExtractionEngine::new("foo.zip", "out/");
//! engine.prepare()?;
//! println!("{} files to extract", engine.total_count());
//!
//! // Progress can be polled from another thread while run() blocks.
//! let progress = engine.progress();
//! std::thread::spawn(move || {
//!     println!("{}/{}", progress.remaining(), progress.total());
//! });
//!
//! let report = engine.run()?;
//! for failure in &report.failed {
//!     eprintln!("{}: {}", failure.entry, failure.error);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fmt;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::*;

use crate::job::{self, ExtractionJob, JobSettings, DEFAULT_BUFFER_SIZE};
use crate::platform::Capabilities;
use crate::read::ArchiveHandle;
use crate::result::*;
use crate::scheduler::{self, ExtractionReport, ExtractionScheduler, ExtractionState};
use crate::signature;

/// Where an [`ExtractionEngine`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Prepared,
    Running,
    Done,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Created => "not prepared",
            EngineState::Prepared => "prepared",
            EngineState::Running => "running",
            EngineState::Done => "done",
            EngineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Knobs for an extraction
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Worker threads to use; defaults to one per core.
    /// Always clamped to `1..=`[`MAX_WORKERS`](crate::scheduler::MAX_WORKERS).
    pub workers: Option<usize>,
    /// Bytes each worker copies at a time
    pub buffer_size: usize,
    /// Create symlinks even if they point outside the target directory.
    pub allow_escaping_symlinks: bool,
    /// Pretend the platform can (or can't) do permissions and symlinks.
    pub capabilities: Option<Capabilities>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            workers: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            allow_escaping_symlinks: false,
            capabilities: None,
        }
    }
}

impl ExtractOptions {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn allow_escaping_symlinks(mut self, allow: bool) -> Self {
        self.allow_escaping_symlinks = allow;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

/// Extracts one archive into one directory.
///
/// Call [`prepare()`](Self::prepare), then [`run()`](Self::run), once each.
pub struct ExtractionEngine {
    archive_path: PathBuf,
    target: PathBuf,
    options: ExtractOptions,
    state: EngineState,
    archive: Option<ArchiveHandle>,
    jobs: Vec<ExtractionJob>,
    progress: Arc<ExtractionState>,
}

impl ExtractionEngine {
    pub fn new<A: AsRef<Path>, T: AsRef<Path>>(archive_path: A, target: T) -> Self {
        Self::with_options(archive_path, target, ExtractOptions::default())
    }

    pub fn with_options<A: AsRef<Path>, T: AsRef<Path>>(
        archive_path: A,
        target: T,
        options: ExtractOptions,
    ) -> Self {
        Self {
            archive_path: archive_path.as_ref().to_owned(),
            target: target.as_ref().to_owned(),
            options,
            state: EngineState::Created,
            archive: None,
            jobs: Vec::new(),
            progress: Arc::new(ExtractionState::new(0)),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Files and symlinks to extract (directories don't count)
    pub fn total_count(&self) -> usize {
        self.progress.total()
    }

    /// Files and symlinks not yet extracted
    pub fn remaining_count(&self) -> usize {
        self.progress.remaining()
    }

    /// A handle for polling progress (or cancelling) from another thread.
    ///
    /// Only meaningful once [`prepare()`](Self::prepare) has succeeded.
    pub fn progress(&self) -> Arc<ExtractionState> {
        Arc::clone(&self.progress)
    }

    /// Validates and opens the archive, lists its entries,
    /// creates the target directory, and lines up one job per file or symlink.
    ///
    /// Nothing is created on disk unless the archive checks out.
    pub fn prepare(&mut self) -> ExtractResult<()> {
        if self.state != EngineState::Created {
            return Err(ExtractError::InvalidState {
                operation: "prepare",
                state: self.state,
            });
        }
        match self.try_prepare() {
            Ok(()) => {
                self.state = EngineState::Prepared;
                Ok(())
            }
            Err(e) => {
                // Drops (and so unmaps) the archive if we got that far.
                self.archive = None;
                self.jobs.clear();
                self.state = EngineState::Failed;
                Err(e)
            }
        }
    }

    fn try_prepare(&mut self) -> ExtractResult<()> {
        let signature = signature::sniff(&self.archive_path);
        if !signature.is_extractable() {
            return Err(ExtractError::InvalidArchiveFormat(signature));
        }

        info!("Reading zip file {}", self.archive_path.display());
        let archive = ArchiveHandle::open(&self.archive_path).map_err(|e| match e {
            ZipError::Io(source) => ExtractError::Io {
                context: format!("Couldn't open {}", self.archive_path.display()),
                source,
            },
            other => other.into(),
        })?;
        let entries = archive.entries()?;

        fs::create_dir_all(&self.target)
            .io_context(|| format!("Can't create output dir {}", self.target.display()))?;

        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.is_dir() {
                // Not a job, but create it now so empty directories survive.
                if let Err(e) = job::create_directory(&self.target, &entry.path) {
                    warn!("{}", e);
                }
            } else {
                jobs.push(ExtractionJob::new(entry, self.target.clone()));
            }
        }

        info!("{} files will be extracted", jobs.len());
        self.progress = Arc::new(ExtractionState::new(jobs.len()));
        self.jobs = jobs;
        self.archive = Some(archive);
        Ok(())
    }

    /// Extracts every file and symlink, blocking until all have been attempted.
    ///
    /// Entries that fail are logged and listed in the returned report;
    /// they don't stop the rest.
    /// Returns [`ExtractError::InterruptedWait`] if the extraction is cancelled
    /// through [`progress()`](Self::progress).
    pub fn run(&mut self) -> ExtractResult<ExtractionReport> {
        let archive = match (self.state, self.archive.take()) {
            (EngineState::Prepared, Some(archive)) => archive,
            (state, _) => {
                return Err(ExtractError::InvalidState {
                    operation: "run",
                    state,
                })
            }
        };
        self.state = EngineState::Running;

        let settings = JobSettings {
            capabilities: self.options.capabilities.unwrap_or_else(Capabilities::detect),
            buffer_size: self.options.buffer_size,
            allow_escaping_symlinks: self.options.allow_escaping_symlinks,
        };
        debug!("{:?}", settings);
        let workers = self.options.workers.unwrap_or_else(scheduler::default_workers);

        // The workers share the handle; it's unmapped once the last of them is done.
        let result = ExtractionScheduler::new(workers, Arc::clone(&self.progress)).and_then(
            |scheduler| scheduler.schedule(Arc::new(archive), mem::take(&mut self.jobs), settings),
        );

        self.state = match result {
            Ok(_) => EngineState::Done,
            Err(_) => EngineState::Failed,
        };
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::signature::Signature;

    #[test]
    fn run_before_prepare() {
        let mut engine = ExtractionEngine::new("nope.zip", "out");
        match engine.run() {
            Err(ExtractError::InvalidState { operation, state }) => {
                assert_eq!(operation, "run");
                assert_eq!(state, EngineState::Created);
            }
            other => panic!("Expected an invalid state error, got {:?}", other),
        }
        // Refusing to run doesn't break the engine.
        assert_eq!(engine.state(), EngineState::Created);
        assert_eq!(engine.total_count(), 0);
        assert_eq!(engine.remaining_count(), 0);
    }

    #[test]
    fn failed_prepare_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        let mut engine = ExtractionEngine::new(dir.path().join("missing.zip"), &target);

        assert!(matches!(
            engine.prepare(),
            Err(ExtractError::InvalidArchiveFormat(Signature::NotRecognized))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(!target.exists());

        assert!(matches!(
            engine.prepare(),
            Err(ExtractError::InvalidState {
                operation: "prepare",
                state: EngineState::Failed
            })
        ));
        assert!(matches!(
            engine.run(),
            Err(ExtractError::InvalidState { operation: "run", .. })
        ));
    }

    #[test]
    fn empty_archives_create_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.zip");
        let mut eocdr = vec![0u8; 22];
        eocdr[..4].copy_from_slice(b"PK\x05\x06");
        std::fs::write(&archive, eocdr).unwrap();

        let target = dir.path().join("out");
        let mut engine = ExtractionEngine::new(&archive, &target);
        assert!(matches!(
            engine.prepare(),
            Err(ExtractError::InvalidArchiveFormat(Signature::Empty))
        ));
        assert!(!target.exists());
    }

    #[test]
    fn options() {
        let defaults = ExtractOptions::default();
        assert_eq!(defaults.workers, None);
        assert_eq!(defaults.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!defaults.allow_escaping_symlinks);

        let tuned = ExtractOptions::default()
            .workers(2)
            .buffer_size(4096)
            .capabilities(Capabilities::plain_files());
        assert_eq!(tuned.workers, Some(2));
        assert_eq!(tuned.buffer_size, 4096);
        assert_eq!(tuned.capabilities, Some(Capabilities::plain_files()));
    }

    #[test]
    fn state_names() {
        assert_eq!(EngineState::Created.to_string(), "not prepared");
        assert_eq!(EngineState::Done.to_string(), "done");
    }
}
