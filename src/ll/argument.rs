//! Argument decomposition for FUSE request payloads.
//!
//! Splits the opaque bytes that follow the 40-byte request header into
//! fixed-layout records, NUL-terminated strings and trailing data blobs.
//! Records are read by value, so the payload buffer needs no particular
//! alignment.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;

use zerocopy::FromBytes;

/// Why a request payload could not be decoded.
///
/// These are non-fatal: the dispatcher logs the frame and drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// Fewer payload bytes than the fixed record requires.
    DataLenShort,
    /// A string argument is missing its NUL terminator.
    MissingNul,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::DataLenShort => write!(f, "payload shorter than the fixed record"),
            DecodeError::MissingNul => write!(f, "string argument without NUL terminator"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Cursor that fetches typed arguments from a payload slice.
pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    pub(crate) fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Remaining undecoded bytes.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Consume the rest of the payload.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Consume exactly `size_of::<T>()` bytes as a fixed-layout record.
    pub(crate) fn fetch<T: FromBytes>(&mut self) -> Result<T, DecodeError> {
        let (value, rest) =
            T::read_from_prefix(self.data).map_err(|_| DecodeError::DataLenShort)?;
        self.data = rest;
        Ok(value)
    }

    /// Consume a NUL-terminated string (may be non-UTF-8). The terminator
    /// is dropped from the returned value.
    pub(crate) fn fetch_str(&mut self) -> Result<&'a OsStr, DecodeError> {
        let len = memchr::memchr(0, self.data).ok_or(DecodeError::MissingNul)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Ok(OsStr::from_bytes(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::{FromBytes, Immutable, KnownLayout};

    const TEST_DATA: [u8; 10] = [0x66, 0x6f, 0x6f, 0x00, 0x62, 0x61, 0x72, 0x00, 0x62, 0x61];

    #[repr(C)]
    #[derive(FromBytes, KnownLayout, Immutable)]
    struct TestArgument {
        p1: u8,
        p2: u8,
        p3: u16,
    }

    #[test]
    fn all_data() {
        let mut it = ArgumentIterator::new(&TEST_DATA);
        it.fetch_str().unwrap();
        assert_eq!(it.fetch_all(), [0x62, 0x61, 0x72, 0x00, 0x62, 0x61]);
    }

    #[test]
    fn generic_argument() {
        let mut it = ArgumentIterator::new(&TEST_DATA);
        let arg: TestArgument = it.fetch().unwrap();
        assert_eq!(arg.p1, 0x66);
        assert_eq!(arg.p2, 0x6f);
        assert_eq!(arg.p3, 0x006f);
        let arg: TestArgument = it.fetch().unwrap();
        assert_eq!(arg.p1, 0x62);
        assert_eq!(arg.p2, 0x61);
        assert_eq!(arg.p3, 0x0072);
        assert_eq!(it.len(), 2);
    }

    #[test]
    fn string_arguments() {
        let mut it = ArgumentIterator::new(&TEST_DATA);
        assert_eq!(it.fetch_str().unwrap(), "foo");
        assert_eq!(it.fetch_str().unwrap(), "bar");
        assert_eq!(it.len(), 2);
    }

    #[test]
    fn mixed_arguments() {
        let mut it = ArgumentIterator::new(&TEST_DATA);
        let arg: TestArgument = it.fetch().unwrap();
        assert_eq!(arg.p3, 0x006f);
        assert_eq!(it.fetch_str().unwrap(), "bar");
        assert_eq!(it.fetch_all(), [0x62, 0x61]);
    }

    #[test]
    fn out_of_data() {
        let mut it = ArgumentIterator::new(&TEST_DATA);
        it.fetch::<u64>().unwrap();
        assert_eq!(it.fetch::<u64>(), Err(DecodeError::DataLenShort));
        assert_eq!(it.len(), 2);
        assert_eq!(it.fetch_str(), Err(DecodeError::MissingNul));
        assert_eq!(it.len(), 2);
    }
}
