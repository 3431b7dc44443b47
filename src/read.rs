//! Tools for reading a ZIP archive.
//!
//! [`ZipArchive`] reads entries out of any byte slice.
//! [`ArchiveHandle`] owns a memory map of an archive on disk,
//! which is what the extraction engine hands to its workers.
//!
//! Every file in a ZIP archive is compressed independently, and both types
//! only need `&self` to start reading an entry, so any number of entries
//! can be streamed out of one archive from as many threads as you'd like.
//! Locating an entry is just slicing into the mapping, so there's no seek
//! position (or lock around one) for readers to fight over.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use camino::Utf8Path;
use chrono::NaiveDateTime;
use flate2::read::DeflateDecoder;
use log::*;
use memmap2::Mmap;

use crate::arch::usize;
use crate::crc_reader::Crc32Reader;
use crate::result::*;
use crate::structures::{self, S_IFDIR, S_IFLNK, S_IFMT};

/// Longest symlink target we'll read out of an archive.
/// (`PATH_MAX` on Linux; nobody has a good reason to go past it.)
pub const MAX_SYMLINK_TARGET: usize = 4096;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    None,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// Metadata for a file, directory, or symlink in the archive,
/// retrieved from its central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry<'a> {
    /// Uncompressed size of the file in bytes
    pub size: usize,

    /// Compressed size of the file in bytes
    pub compressed_size: usize,

    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// True if the file is encrypted (decryption is unsupported)
    pub encrypted: bool,

    /// The entry's path, relative to the root of the archive.
    ///
    /// This is whatever the archiver wrote down; nothing stops it from
    /// being absolute or containing `..`. See [`crate::job::resolve_destination()`].
    pub path: Cow<'a, Utf8Path>,

    /// When the file was last modified, if the archive has a sensible date
    pub last_modified: Option<NaiveDateTime>,

    /// Unix `st_mode` (file type and permission bits),
    /// if the file was archived on a Unix.
    ///
    /// DOS attributes aren't converted into rough Unix equivalents.
    pub unix_mode: Option<u16>,

    /// The offset to the local file header in the archive
    pub(crate) header_offset: usize,
}

impl ArchiveEntry<'_> {
    /// Returns true if the given entry is a directory
    pub fn is_dir(&self) -> bool {
        // Path::ends_with() doesn't consider separators,
        // so we need a different approach.
        self.path.as_str().ends_with('/')
            || self.unix_mode.map_or(false, |m| m & S_IFMT == S_IFDIR)
    }

    /// Returns true if the entry was archived as a symbolic link.
    /// Its contents are the link's target.
    pub fn is_symlink(&self) -> bool {
        !self.is_dir() && self.unix_mode.map_or(false, |m| m & S_IFMT == S_IFLNK)
    }

    /// Returns true if the given entry is a regular file
    pub fn is_file(&self) -> bool {
        !self.is_dir() && !self.is_symlink()
    }

    /// The low 12 bits of the Unix mode: permissions plus setuid, setgid and sticky.
    pub fn permission_bits(&self) -> Option<u16> {
        self.unix_mode.map(|m| m & 0o7777)
    }

    pub fn into_owned(self) -> ArchiveEntry<'static> {
        ArchiveEntry {
            size: self.size,
            compressed_size: self.compressed_size,
            compression_method: self.compression_method,
            crc32: self.crc32,
            encrypted: self.encrypted,
            path: Cow::Owned(self.path.into_owned()),
            last_modified: self.last_modified,
            unix_mode: self.unix_mode,
            header_offset: self.header_offset,
        }
    }
}

/// A ZIP archive to be read
pub struct ZipArchive<'a> {
    /// The contents of the ZIP archive, as a byte slice.
    mapping: &'a [u8],
    /// A list of entries from the ZIP's central directory
    entries: Vec<ArchiveEntry<'a>>,
}

impl<'a> ZipArchive<'a> {
    /// Reads a ZIP archive from a byte slice.
    ///
    /// ```no_run
    /// # use std::fs;
    /// # use zipper::*;
    /// let bytes = fs::read("foo.zip")?;
    /// let archive = ZipArchive::new(&bytes)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(mapping: &'a [u8]) -> ZipResult<Self> {
        let (new_archive, archive_offset) = Self::with_prepended_data(mapping)?;
        if archive_offset != 0 {
            return Err(ZipError::PrependedWithUnknownBytes(archive_offset));
        }
        Ok(new_archive)
    }

    /// Like `ZipArchive::new()`, but allows arbitrary data to prepend the archive.
    /// Returns the ZipArchive and the number of bytes prepended to the archive.
    ///
    /// Since a ZIP archive's metadata sits at the back of the file,
    /// many formats consist of ZIP archives prepended with some other data.
    /// For example, a self-extracting archive is one with an executable in the front.
    pub fn with_prepended_data(mut mapping: &'a [u8]) -> ZipResult<(Self, usize)> {
        let eocdr_posit = structures::find_eocdr(mapping)?;
        let eocdr = structures::EndOfCentralDirectory::parse(&mapping[eocdr_posit..])?;
        trace!("{:?}", eocdr);

        if eocdr.disk_number != eocdr.disk_with_central_directory {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
                eocdr.disk_number, eocdr.disk_with_central_directory
            )));
        }
        if eocdr.entries != eocdr.entries_on_this_disk {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: entries ({}) != entries this disk ({})",
                eocdr.entries, eocdr.entries_on_this_disk
            )));
        }

        let nominal_central_directory_offset: usize;
        let entry_count: u64;

        // Zip files can be prepended by arbitrary junk,
        // so all the given positions might be off.
        // Calculate the offset.
        let archive_offset;

        let zip64_locator = eocdr_posit
            .checked_sub(structures::Zip64EndOfCentralDirectoryLocator::size_in_file())
            .and_then(|posit| {
                structures::Zip64EndOfCentralDirectoryLocator::parse(&mapping[posit..])
            });

        if let Some(zip64_eocdr_locator) = zip64_locator {
            trace!("{:?}", zip64_eocdr_locator);

            if eocdr.disk_number as u32 != zip64_eocdr_locator.disk_with_central_directory {
                return Err(ZipError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: disk ({}) != disk with zip64 central directory ({})",
                    eocdr.disk_number, zip64_eocdr_locator.disk_with_central_directory
                )));
            }
            if zip64_eocdr_locator.disks != 1 {
                return Err(ZipError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: Zip64 EOCDR locator reports {} disks",
                    zip64_eocdr_locator.disks
                )));
            }

            // Search for the zip64 EOCDR, from its nominal starting position
            // to the end of where it could be.
            let zip64_eocdr_search_start = usize(zip64_eocdr_locator.zip64_eocdr_offset)?;
            let zip64_eocdr_search_end = eocdr_posit
                - structures::Zip64EndOfCentralDirectoryLocator::size_in_file();
            let zip64_eocdr_search_space = mapping
                .get(zip64_eocdr_search_start..zip64_eocdr_search_end)
                .ok_or(ZipError::InvalidArchive(
                    "Invalid Zip64 End Of Central Directory Record offset",
                ))?;

            let zip64_eocdr_posit = structures::find_zip64_eocdr(zip64_eocdr_search_space)?;
            // Since we're searching starting at the provided offset,
            // the returned position is the archive offset.
            archive_offset = zip64_eocdr_posit;
            let zip64_eocdr = structures::Zip64EndOfCentralDirectory::parse(
                &zip64_eocdr_search_space[zip64_eocdr_posit..],
            )?;
            trace!("{:?}", zip64_eocdr);

            nominal_central_directory_offset = usize(zip64_eocdr.central_directory_offset)?;
            entry_count = zip64_eocdr.entries;
        } else {
            // The offset is the actual position versus the stored one.
            let actual_cdr_posit = eocdr_posit.checked_sub(usize(eocdr.central_directory_size)?);
            let nominal_offset = usize(eocdr.central_directory_offset)?;
            archive_offset = actual_cdr_posit
                .and_then(|off| off.checked_sub(nominal_offset))
                .ok_or(ZipError::InvalidArchive(
                    "Invalid central directory size or offset",
                ))?;
            nominal_central_directory_offset = nominal_offset;
            entry_count = eocdr.entries as u64;
        }

        mapping = &mapping[archive_offset..];
        trace!(
            "{} entries at nominal offset {}",
            entry_count,
            nominal_central_directory_offset
        );

        let mut central_directory =
            mapping
                .get(nominal_central_directory_offset..)
                .ok_or(ZipError::InvalidArchive(
                    "Central directory offset is past the end of the archive",
                ))?;

        // Don't trust the count for preallocation;
        // each record is at least 46 bytes.
        let plausible = central_directory.len() / 46;
        let mut entries = Vec::with_capacity(usize(entry_count)?.min(plausible));

        for _ in 0..entry_count {
            let dir_entry = structures::CentralDirectoryEntry::parse_and_consume(
                &mut central_directory,
            )?;
            trace!("{:?}", dir_entry);

            let entry = ArchiveEntry::from_cde(&dir_entry)?;
            debug!("{:?}", entry);
            entries.push(entry);
        }

        Ok((ZipArchive { mapping, entries }, archive_offset))
    }

    /// Returns the entries found in the ZIP archive's central directory,
    /// in the order they were stored.
    ///
    /// No effort is made to deduplicate or otherwise validate these entries.
    pub fn entries(&self) -> &[ArchiveEntry<'a>] {
        &self.entries
    }

    /// Consumes the archive, keeping just its entries.
    pub fn into_entries(self) -> Vec<ArchiveEntry<'a>> {
        self.entries
    }

    /// Reads the given file from the ZIP archive.
    ///
    /// Since each file in a ZIP archive is compressed independently,
    /// multiple files can be read in parallel.
    pub fn read(&self, entry: &ArchiveEntry) -> ZipResult<Box<dyn Read + Send + 'a>> {
        read_entry(self.mapping, entry)
    }

    /// Reads the target of a symlink entry.
    pub fn symlink_target(&self, entry: &ArchiveEntry) -> ZipResult<String> {
        read_symlink_target(self.mapping, entry)
    }
}

/// An archive on disk, memory-mapped for the duration of an extraction.
///
/// Dropping the handle unmaps the archive.
pub struct ArchiveHandle {
    path: PathBuf,
    mapping: Mmap,
}

impl ArchiveHandle {
    /// Maps the archive at the given path.
    ///
    /// This only checks that the file can be opened and mapped;
    /// [`entries()`](Self::entries) does the actual parsing.
    pub fn open<P: AsRef<Path>>(path: P) -> ZipResult<Self> {
        let path = path.as_ref();
        info!("Memory mapping {}", path.display());
        let file = File::open(path)?;
        // Safety: we only ever read the mapping, and the archive changing
        // out from under us while we extract it is no worse than a torn read.
        let mapping = unsafe { Mmap::map(&file)? };
        if mapping.len() < structures::EndOfCentralDirectory::size_in_file() {
            return Err(ZipError::InvalidArchive(
                "Too small for an End Of Central Directory Record",
            ));
        }
        Ok(Self {
            path: path.to_owned(),
            mapping,
        })
    }

    /// Parses the central directory and returns every entry in it.
    ///
    /// Archives prepended with other data (self-extractors, etc.) are refused;
    /// use [`ZipArchive::with_prepended_data()`] directly for those.
    pub fn entries(&self) -> ZipResult<Vec<ArchiveEntry<'static>>> {
        let entries = ZipArchive::new(&self.mapping)?
            .into_entries()
            .into_iter()
            .map(ArchiveEntry::into_owned)
            .collect();
        Ok(entries)
    }

    /// Opens a stream of the given entry's decompressed contents.
    pub fn read(&self, entry: &ArchiveEntry) -> ZipResult<Box<dyn Read + Send + '_>> {
        read_entry(&self.mapping, entry)
    }

    /// Reads the target of a symlink entry.
    pub fn symlink_target(&self, entry: &ArchiveEntry) -> ZipResult<String> {
        read_symlink_target(&self.mapping, entry)
    }
}

impl Drop for ArchiveHandle {
    fn drop(&mut self) {
        debug!("Closing {}", self.path.display());
    }
}

fn read_entry<'a>(mapping: &'a [u8], entry: &ArchiveEntry) -> ZipResult<Box<dyn Read + Send + 'a>> {
    let mut file_slice = mapping
        .get(entry.header_offset..)
        .ok_or(ZipError::InvalidArchive(
            "Local file header offset is past the end of the archive",
        ))?;
    let local_header = structures::LocalFileHeader::parse_and_consume(&mut file_slice)?;
    trace!("{:?}", local_header);
    let local_entry = ArchiveEntry::from_local_header(&local_header, entry)?;
    debug!("Reading {:?}", local_entry);
    if cfg!(feature = "check-local-metadata") && *entry != local_entry {
        return Err(ZipError::InvalidArchive(
            "Central directory entry doesn't match local file header",
        ));
    }

    if entry.encrypted {
        return Err(ZipError::UnsupportedArchive(format!(
            "Can't read encrypted file {}",
            entry.path
        )));
    }

    let compressed = file_slice
        .get(..entry.compressed_size)
        .ok_or(ZipError::InvalidArchive(
            "File data runs past the end of the archive",
        ))?;

    make_reader(entry.compression_method, entry.crc32, entry.size, compressed)
}

fn read_symlink_target(mapping: &[u8], entry: &ArchiveEntry) -> ZipResult<String> {
    if !entry.is_symlink() {
        return Err(ZipError::NotASymlink(entry.path.clone().into_owned()));
    }
    if entry.size > MAX_SYMLINK_TARGET {
        return Err(ZipError::UnsupportedArchive(format!(
            "Symlink {} has a {} byte target",
            entry.path, entry.size
        )));
    }
    let mut target = Vec::with_capacity(entry.size);
    read_entry(mapping, entry)?.read_to_end(&mut target)?;
    String::from_utf8(target).map_err(|e| ZipError::Encoding(e.utf8_error()))
}

/// Returns a boxed read trait for a compressed file,
/// given its compression method, expected CRC, and uncompressed size.
///
/// Output is capped at the recorded size, so a lying entry
/// can't decompress into more than it claims (and will fail its CRC).
fn make_reader<'a, R: io::Read + Send + 'a>(
    compression_method: CompressionMethod,
    crc32: u32,
    size: usize,
    reader: R,
) -> ZipResult<Box<dyn Read + Send + 'a>> {
    let limit = size as u64;
    match compression_method {
        CompressionMethod::None => Ok(Box::new(Crc32Reader::new(reader.take(limit), crc32))),
        CompressionMethod::Deflate => {
            let deflate_reader = DeflateDecoder::new(reader);
            Ok(Box::new(Crc32Reader::new(deflate_reader.take(limit), crc32)))
        }
        CompressionMethod::Unsupported(code) => Err(ZipError::UnsupportedArchive(format!(
            "Compression method {} not supported",
            code
        ))),
    }
}
