//! Sniffing an archive's format from its first few bytes.
//!
//! This is a fast pre-filter, not validation:
//! a file that starts like a ZIP archive can still be garbage,
//! which [`ArchiveHandle::entries()`](crate::read::ArchiveHandle::entries) will find out.
//! See <https://en.wikipedia.org/wiki/List_of_file_signatures>.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::*;

/// Archive formats we can recognize (but, `Zip` aside, not extract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Zip,
    SevenZip,
    Gzip,
    Bzip2,
    /// `compress`'s Lempel-Ziv-Welch `.Z` files
    Compress,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Zip => "zip",
            Format::SevenZip => "7z",
            Format::Gzip => "gzip",
            Format::Bzip2 => "bzip2",
            Format::Compress => "compress (.Z)",
        };
        f.write_str(name)
    }
}

/// What a file's leading bytes say about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// Starts like an archive of the given format.
    Valid(Format),
    /// A ZIP archive with no entries: it's all End Of Central Directory Record.
    Empty,
    /// An archive we know about and refuse to read.
    Unsupported(&'static str),
    /// Unreadable, too short, or not any archive we know.
    NotRecognized,
}

impl Signature {
    /// True if the engine can go on to open the archive.
    pub fn is_extractable(&self) -> bool {
        *self == Signature::Valid(Format::Zip)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Valid(format) => write!(f, "{} archive", format),
            Signature::Empty => f.write_str("empty zip archive"),
            Signature::Unsupported(reason) => f.write_str(reason),
            Signature::NotRecognized => f.write_str("unrecognized file signature"),
        }
    }
}

/// Leading bytes of each format we know, longest first within a family.
const MAGIC_TABLE: &[(&[u8], Signature)] = &[
    // Local file header: the first entry of a normal archive
    (&[0x50, 0x4B, 0x03, 0x04], Signature::Valid(Format::Zip)),
    // End of central directory record, with nothing before it
    (&[0x50, 0x4B, 0x05, 0x06], Signature::Empty),
    // Spanned archives start with a data descriptor signature
    (
        &[0x50, 0x4B, 0x07, 0x08],
        Signature::Unsupported("spanned (multi-volume) zip archives are not supported"),
    ),
    (
        &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C],
        Signature::Valid(Format::SevenZip),
    ),
    (&[0x1F, 0x8B], Signature::Valid(Format::Gzip)),
    (&[0x42, 0x5A, 0x68], Signature::Valid(Format::Bzip2)),
    (&[0x1F, 0x9D], Signature::Valid(Format::Compress)),
];

/// The most bytes any entry in the table needs
const LONGEST_MAGIC: usize = 6;

/// Classifies a file by its leading bytes.
pub fn classify(leading: &[u8]) -> Signature {
    MAGIC_TABLE
        .iter()
        .find(|(magic, _)| leading.starts_with(magic))
        .map_or(Signature::NotRecognized, |(_, signature)| *signature)
}

/// Reads the first few bytes of the file at `path` and classifies them.
///
/// The file is closed again before this returns.
/// Errors opening or reading it just mean we don't recognize it.
pub fn sniff<P: AsRef<Path>>(path: P) -> Signature {
    let path = path.as_ref();
    let mut leading = Vec::with_capacity(LONGEST_MAGIC);
    let read = File::open(path)
        .and_then(|file| file.take(LONGEST_MAGIC as u64).read_to_end(&mut leading));
    if let Err(e) = read {
        debug!("Couldn't read signature of {}: {}", path.display(), e);
        return Signature::NotRecognized;
    }
    let signature = classify(&leading);
    debug!("{} looks like: {}", path.display(), signature);
    signature
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    #[test]
    fn zip_family() {
        assert_eq!(classify(b"PK\x03\x04rest"), Signature::Valid(Format::Zip));
        assert_eq!(classify(b"PK\x05\x06"), Signature::Empty);
        assert!(matches!(
            classify(b"PK\x07\x08"),
            Signature::Unsupported(_)
        ));
        assert!(classify(b"PK\x03\x04").is_extractable());
        assert!(!classify(b"PK\x05\x06").is_extractable());
    }

    #[test]
    fn other_formats() {
        assert_eq!(
            classify(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0]),
            Signature::Valid(Format::SevenZip)
        );
        assert_eq!(classify(&[0x1F, 0x8B, 8, 0]), Signature::Valid(Format::Gzip));
        assert_eq!(classify(b"BZh91AY"), Signature::Valid(Format::Bzip2));
        assert_eq!(classify(&[0x1F, 0x9D, 0x90]), Signature::Valid(Format::Compress));
        assert!(!Signature::Valid(Format::Gzip).is_extractable());
    }

    #[test]
    fn everything_else() {
        assert_eq!(classify(b"hello"), Signature::NotRecognized);
        assert_eq!(classify(b"PK"), Signature::NotRecognized);
        assert_eq!(classify(b""), Signature::NotRecognized);
        // Truncated 7z magic
        assert_eq!(classify(&[0x37, 0x7A, 0xBC]), Signature::NotRecognized);
    }

    #[test]
    fn sniffing_files() {
        let dir = tempfile::tempdir().unwrap();

        let zip = dir.path().join("a.zip");
        fs::write(&zip, b"PK\x03\x04\x14\x00").unwrap();
        assert_eq!(sniff(&zip), Signature::Valid(Format::Zip));

        let spanned = dir.path().join("spanned.zip");
        fs::write(&spanned, b"PK\x07\x08PK\x03\x04").unwrap();
        assert!(matches!(sniff(&spanned), Signature::Unsupported(_)));

        let text = dir.path().join("notes.txt");
        fs::write(&text, b"not an archive").unwrap();
        assert_eq!(sniff(&text), Signature::NotRecognized);

        assert_eq!(sniff(dir.path().join("missing.zip")), Signature::NotRecognized);
        // Directories can be opened on some platforms, but not read.
        assert_eq!(sniff(dir.path()), Signature::NotRecognized);
    }
}
