use std::convert::TryFrom;

use crate::result::*;

/// A checked cast from any unsigned offset or size field to usize.
///
/// Archive records store 16, 32 and 64-bit values,
/// and we index our memory map with them directly.
/// That only fails on targets where usize is narrower than the field.
pub fn usize<I: Into<u64>>(i: I) -> ZipResult<usize> {
    usize::try_from(i.into()).map_err(|_| ZipError::InsufficientAddressSpace)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn narrow_fields_always_fit() {
        assert_eq!(usize(u16::MAX).unwrap(), 65535);
        assert_eq!(usize(u32::MAX).unwrap(), 4_294_967_295);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn wide_fields_fit_on_64_bit() {
        assert_eq!(usize(u64::MAX).unwrap(), usize::MAX);
    }
}
