//! zipper extracts Zip archives using every core you give it:
//!
//! ```no_run
//! # use zipper::*;
//! let mut engine = ExtractionEngine::new("foo.zip", "foo/");
//! engine.prepare()?;
//! let report = engine.run()?;
//! println!("Extracted {} of {} files", report.succeeded(), engine.total_count());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Zip is an interesting archive format: unlike compressed tarballs often seen
//! in Linux land (`*.tar.gz`, `*.tar.zst`, ...),
//! each file in a Zip archive is compressed independently,
//! with a central directory telling us where to find each file.
//! This allows us to extract multiple files simultaneously so long as we can
//! read from multiple places at once.
//!
//! We [memory-map](https://docs.rs/memmap2) the archive, so every worker reads
//! straight out of one shared, immutable byte range.
//! (On 64-bit systems, this works even if the file is _much_ larger than
//! physical RAM. 32-bit systems are limited by address space to archives
//! under 4 GB.)
//!
//! Extraction goes:
//!
//! 1. [`signature`] sniffs the first few bytes to make sure we have a ZIP archive
//!    (and not, say, an empty or spanned one).
//! 2. [`read`] maps the archive and lists its entries from the central directory.
//! 3. Each file or symlink becomes a [`job::ExtractionJob`].
//! 4. [`scheduler`] runs the jobs on a small pool of threads,
//!    counting down as each finishes so progress can be polled.
//!
//! [`engine::ExtractionEngine`] ties these together.
//! If you just want to read entries, [`ZipArchive`] works on any byte slice:
//!
//! ```no_run
//! # use std::fs;
//! # use std::io;
//! # use zipper::*;
//! let bytes = fs::read("foo.zip")?;
//! let archive = ZipArchive::new(&bytes)?;
//! for entry in archive.entries().iter().filter(|e| e.is_file()) {
//!     let mut reader = archive.read(entry)?;
//!     io::copy(&mut reader, &mut io::sink())?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engine;
pub mod job;
pub mod permissions;
pub mod platform;
pub mod read;
pub mod result;
pub mod scheduler;
pub mod signature;

pub use engine::{EngineState, ExtractOptions, ExtractionEngine};
pub use platform::Capabilities;
pub use read::{ArchiveEntry, ArchiveHandle, CompressionMethod, ZipArchive};
pub use result::{ExtractError, ExtractResult, ZipError, ZipResult};
pub use scheduler::ExtractionReport;
pub use signature::{Format, Signature};

mod arch;
mod crc_reader;
mod structures;
