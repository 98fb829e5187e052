//! Error numbers as they travel in the reply header.
//!
//! The out-header carries a signed errno: zero for success, otherwise the
//! negated kernel code — with one historical exception, `ENOTDIR`, which
//! is transmitted as positive `20` for compatibility with existing
//! filesystems built against this wire contract.

use std::fmt;
use std::num::NonZeroI32;

/// A non-success operation result, encoded ready for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(NonZeroI32);

macro_rules! errno_consts {
    ($($(#[$doc:meta])* $name:ident = $wire:expr;)*) => {
        $(
            $(#[$doc])*
            pub const $name: Errno = Errno::from_wire($wire);
        )*
    };
}

impl Errno {
    const fn from_wire(wire: i32) -> Errno {
        match NonZeroI32::new(wire) {
            Some(v) => Errno(v),
            None => panic!("errno must be non-zero"),
        }
    }

    errno_consts! {
        /// Operation not permitted.
        EPERM = -libc::EPERM;
        /// No such file or directory.
        ENOENT = -libc::ENOENT;
        /// Interrupted system call.
        EINTR = -libc::EINTR;
        /// I/O error.
        EIO = -libc::EIO;
        /// Bad file descriptor.
        EBADF = -libc::EBADF;
        /// Try again.
        EAGAIN = -libc::EAGAIN;
        /// Permission denied.
        EACCES = -libc::EACCES;
        /// File exists.
        EEXIST = -libc::EEXIST;
        /// No such device.
        ENODEV = -libc::ENODEV;
        /// Not a directory. Transmitted positive; see the module docs.
        ENOTDIR = libc::ENOTDIR;
        /// Is a directory.
        EISDIR = -libc::EISDIR;
        /// Invalid argument.
        EINVAL = -libc::EINVAL;
        /// File too large.
        EFBIG = -libc::EFBIG;
        /// No space left on device.
        ENOSPC = -libc::ENOSPC;
        /// Result not representable in the provided buffer.
        ERANGE = -libc::ERANGE;
        /// File name too long.
        ENAMETOOLONG = -libc::ENAMETOOLONG;
        /// Operation not implemented.
        ENOSYS = -libc::ENOSYS;
        /// Directory not empty.
        ENOTEMPTY = -libc::ENOTEMPTY;
        /// No data available; what getxattr reports for an absent attribute.
        ENODATA = -libc::ENODATA;
        /// Operation not supported.
        EOPNOTSUPP = -libc::EOPNOTSUPP;
    }

    /// Alias kept for xattr call sites; identical to [`Errno::ENODATA`].
    pub const ENOATTR: Errno = Errno::ENODATA;
    /// Alias of [`Errno::EOPNOTSUPP`].
    pub const ENOTSUP: Errno = Errno::EOPNOTSUPP;

    /// Build from a plain (positive) OS error code such as `libc::EACCES`.
    ///
    /// Returns `EINVAL` for zero or already-negative input, so a buggy
    /// caller cannot fabricate a success header.
    pub fn from_os(code: i32) -> Errno {
        if code == libc::ENOTDIR {
            return Errno::ENOTDIR;
        }
        match NonZeroI32::new(code) {
            Some(c) if c.get() > 0 => Errno(NonZeroI32::new(-c.get()).unwrap_or(c)),
            _ => Errno::EINVAL,
        }
    }

    /// The signed value written into the out-header.
    pub fn wire(self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(Errno::ENOENT.wire(), -2);
        assert_eq!(Errno::EIO.wire(), -5);
        assert_eq!(Errno::EAGAIN.wire(), -11);
        assert_eq!(Errno::EACCES.wire(), -13);
        assert_eq!(Errno::EEXIST.wire(), -17);
        assert_eq!(Errno::ERANGE.wire(), -34);
        assert_eq!(Errno::ENOSYS.wire(), -38);
        assert_eq!(Errno::ENODATA.wire(), -61);
        assert_eq!(Errno::EOPNOTSUPP.wire(), -95);
    }

    #[test]
    fn notdir_stays_positive() {
        assert_eq!(Errno::ENOTDIR.wire(), 20);
        assert_eq!(Errno::from_os(libc::ENOTDIR).wire(), 20);
    }

    #[test]
    fn from_os_negates() {
        assert_eq!(Errno::from_os(libc::ENOENT), Errno::ENOENT);
        assert_eq!(Errno::from_os(0), Errno::EINVAL);
        assert_eq!(Errno::from_os(-5), Errno::EINVAL);
    }

    #[test]
    fn aliases() {
        assert_eq!(Errno::ENOATTR, Errno::ENODATA);
        assert_eq!(Errno::ENOTSUP, Errno::EOPNOTSUPP);
    }
}
