//! Error types and the related `Result<T>`s
//!
//! [`ZipError`] covers problems with the archive's structure and contents.
//! [`ExtractError`] covers everything the extraction engine can run into,
//! from a bad signature up front to a single entry failing to land on disk.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::engine::EngineState;
use crate::signature::Signature;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from underlying I/O
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The ZIP archive contained invalid data per APPNOTE.TXT.
    #[error("Invalid Zip archive: {0}")]
    InvalidArchive(&'static str),

    /// Decoding a UTF-8 name or symlink target failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The ZIP archive uses an unsupported feature
    #[error("Unsupported Zip archive: {0}")]
    UnsupportedArchive(String),

    /// The ZIP archive is prepended some unknown bytes.
    /// (Use [`ZipArchive::with_prepended_data()`] if this is okay.)
    ///
    /// [`ZipArchive::with_prepended_data()`]: ../read/struct.ZipArchive.html#method.with_prepended_data
    #[error("Archive prepended with {0} unknown bytes")]
    PrependedWithUnknownBytes(usize),

    /// A symlink target was requested for an entry that isn't a symlink.
    #[error("{0} is not a symbolic link")]
    NotASymlink(Utf8PathBuf),

    /// A cast from a 64-bit int to a usize failed while mapping the file,
    /// probably on a 32-bit system.
    #[error("Zip archive too large for address space")]
    InsufficientAddressSpace,
}

pub type ExtractResult<T> = Result<T, ExtractError>;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The file's leading bytes aren't those of an archive we can extract.
    #[error("Can't extract archive: {0}")]
    InvalidArchiveFormat(Signature),

    /// The signature looked fine, but the archive's records didn't.
    #[error(transparent)]
    Archive(#[from] ZipError),

    /// Reading the archive or writing the target tree failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// An entry's name would place it outside the target directory
    /// (`..` segments, absolute paths, drive prefixes).
    #[error("Refusing to extract {0} outside the target directory")]
    UnsafePath(Utf8PathBuf),

    /// A symlink entry points somewhere outside the target directory.
    #[error("Refusing to link {path} to {target}, which escapes the target directory")]
    UnsafeSymlink { path: Utf8PathBuf, target: String },

    /// An extraction job panicked. The message is the panic's, if it had one.
    #[error("Extraction job panicked: {0}")]
    Panicked(String),

    /// Cancelled while waiting for extraction jobs to finish.
    #[error("Extraction was interrupted")]
    InterruptedWait,

    /// `prepare()` and `run()` were called out of order.
    #[error("Can't {operation} an extraction that is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
}

/// Attaches a human-readable context to I/O errors,
/// turning them into [`ExtractError::Io`].
pub(crate) trait IoContext<T> {
    fn io_context<C, F>(self, context: F) -> ExtractResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<C, F>(self, context: F) -> ExtractResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| ExtractError::Io {
            context: context().into(),
            source,
        })
    }
}
