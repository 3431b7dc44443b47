//! A reader that checks an entry's CRC-32 once its data runs out

use std::io;
use std::io::prelude::*;

use crc32fast::Hasher;

/// Hashes everything read through it and fails the final (EOF) read
/// if the result doesn't match the checksum the archive recorded.
pub struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    expected: u32,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, expected: u32) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            expected,
        }
    }

    fn actual(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        if count == 0 && !buf.is_empty() {
            let actual = self.actual();
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Invalid checksum: archive says {:#010x}, contents hash to {:#010x}",
                        self.expected, actual
                    ),
                ));
            }
        }
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    #[test]
    fn empty_input() {
        let data: &[u8] = b"";
        let mut buf = [0; 1];

        let mut reader = Crc32Reader::new(data, 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        let mut reader = Crc32Reader::new(data, 1);
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Invalid checksum"));
    }

    #[test]
    fn whole_buffer_then_eof() {
        let data: &[u8] = b"1234";
        let mut out = Vec::new();

        let mut reader = Crc32Reader::new(data, 0x9be3e0a3);
        assert_eq!(reader.read_to_end(&mut out).unwrap(), 4);
        assert_eq!(out, b"1234");
        // Reading past the end keeps succeeding.
        assert_eq!(reader.read(&mut [0; 8]).unwrap(), 0);
    }

    #[test]
    fn mismatch_surfaces_at_eof() {
        let data: &[u8] = b"1234";
        let mut reader = Crc32Reader::new(data, 0xdeadbeef);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn zero_length_reads_dont_trigger_the_check() {
        let data: &[u8] = b"1234";
        let mut buf = [0; 5];

        let mut reader = Crc32Reader::new(data, 0xdeadbeef);
        assert_eq!(reader.read(&mut buf[..0]).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
    }
}
