//! Protocol flag sets.
//!
//! Bit positions are fixed by the kernel ABI; see `fuse_kernel.h`.

use bitflags::bitflags;

bitflags! {
    /// Capability bits exchanged during the INIT handshake.
    ///
    /// `ConnInfo::capable` holds the subset the kernel advertised,
    /// `ConnInfo::want` the subset this side enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InitFlags: u32 {
        /// Asynchronous read requests.
        const ASYNC_READ = 1 << 0;
        /// Remote locking for POSIX file locks.
        const POSIX_LOCKS = 1 << 1;
        /// Kernel sends file handle for fstat and friends.
        const FILE_OPS = 1 << 2;
        /// The filesystem handles the `O_TRUNC` open flag itself.
        const ATOMIC_O_TRUNC = 1 << 3;
        /// The filesystem handles lookups of "." and "..".
        const EXPORT_SUPPORT = 1 << 4;
        /// Write requests may exceed 4 KiB.
        const BIG_WRITES = 1 << 5;
        /// Don't apply umask to file modes on create.
        const DONT_MASK = 1 << 6;
        /// Kernel supports splice writes on the device.
        const SPLICE_WRITE = 1 << 7;
        /// Kernel supports splice moves on the device.
        const SPLICE_MOVE = 1 << 8;
        /// Kernel supports splice reads on the device.
        const SPLICE_READ = 1 << 9;
        /// Remote locking for BSD-style flock locks.
        const FLOCK_LOCKS = 1 << 10;
        /// Kernel supports ioctl on directories.
        const IOCTL_DIR = 1 << 11;
        /// Automatically invalidate cached pages.
        const AUTO_INVAL_DATA = 1 << 12;
        /// READDIRPLUS (readdir + lookup in one round trip).
        const READDIRPLUS = 1 << 13;
        /// Adaptive readdirplus.
        const READDIRPLUS_AUTO = 1 << 14;
        /// Asynchronous direct I/O submission.
        const ASYNC_DIO = 1 << 15;
        /// Writeback caching for buffered writes.
        const WRITEBACK_CACHE = 1 << 16;
        /// Kernel supports zero-message opens.
        const NO_OPEN_SUPPORT = 1 << 17;
        /// Parallel lookup and readdir on one directory.
        const PARALLEL_DIROPS = 1 << 18;
        /// Filesystem kills suid/sgid/caps on write/chown/trunc.
        const HANDLE_KILLPRIV = 1 << 19;
        /// Filesystem supports POSIX ACLs.
        const POSIX_ACL = 1 << 20;
    }
}

impl InitFlags {
    /// Capabilities switched on whenever the kernel offers them.
    pub(crate) const DEFAULT_WANT: InitFlags = InitFlags::ASYNC_READ
        .union(InitFlags::PARALLEL_DIROPS)
        .union(InitFlags::AUTO_INVAL_DATA)
        .union(InitFlags::HANDLE_KILLPRIV)
        .union(InitFlags::ASYNC_DIO)
        .union(InitFlags::IOCTL_DIR)
        .union(InitFlags::ATOMIC_O_TRUNC);
}

bitflags! {
    /// Flags returned in the open response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct FopenFlags: u32 {
        /// Bypass the page cache for this open file.
        const DIRECT_IO = 1 << 0;
        /// Don't invalidate the data cache on open.
        const KEEP_CACHE = 1 << 1;
        /// The file is not seekable.
        const NONSEEKABLE = 1 << 2;
    }
}

bitflags! {
    /// Valid-field selectors in `fuse_setattr_in.valid`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SetattrValid: u32 {
        /// `mode` is meaningful.
        const MODE = 1 << 0;
        /// `uid` is meaningful.
        const UID = 1 << 1;
        /// `gid` is meaningful.
        const GID = 1 << 2;
        /// `size` is meaningful.
        const SIZE = 1 << 3;
        /// `atime` is meaningful.
        const ATIME = 1 << 4;
        /// `mtime` is meaningful.
        const MTIME = 1 << 5;
        /// `fh` is meaningful.
        const FH = 1 << 6;
        /// Set atime to now.
        const ATIME_NOW = 1 << 7;
        /// Set mtime to now.
        const MTIME_NOW = 1 << 8;
        /// `lock_owner` is meaningful.
        const LOCKOWNER = 1 << 9;
        /// `ctime` is meaningful.
        const CTIME = 1 << 10;
    }
}

bitflags! {
    /// `setxattr(2)` operation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct XattrFlags: i32 {
        /// Fail if the attribute already exists.
        const CREATE = 0x1;
        /// Fail if the attribute does not exist.
        const REPLACE = 0x2;
    }
}

bitflags! {
    /// `fuse_lk_in.lk_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct LockFlags: u32 {
        /// The request came from flock(2), not fcntl(2).
        const FLOCK = 1 << 0;
    }
}

bitflags! {
    /// `fuse_ioctl_in.flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoctlFlags: u32 {
        /// 32-bit compat ioctl on a 64-bit machine.
        const COMPAT = 1 << 0;
        /// Not restricted to well-formed ioctls, retry allowed.
        const UNRESTRICTED = 1 << 1;
        /// Retry with new iovecs.
        const RETRY = 1 << 2;
        /// 32-bit ioctl.
        const IOCTL_32BIT = 1 << 3;
        /// The target is a directory.
        const DIR = 1 << 4;
    }
}

// Write request flags
pub(crate) const FUSE_WRITE_CACHE: u32 = 1 << 0;
pub(crate) const FUSE_WRITE_LOCKOWNER: u32 = 1 << 1;

// Read request flags
pub(crate) const FUSE_READ_LOCKOWNER: u32 = 1 << 1;

// Release request flags
pub(crate) const FUSE_RELEASE_FLUSH: u32 = 1 << 0;
pub(crate) const FUSE_RELEASE_FLOCK_UNLOCK: u32 = 1 << 1;

// Getattr request flags
pub(crate) const FUSE_GETATTR_FH: u32 = 1 << 0;

// Fsync request flags
pub(crate) const FUSE_FSYNC_FDATASYNC: u32 = 1 << 0;

// Poll request flags
pub(crate) const FUSE_POLL_SCHEDULE_NOTIFY: u32 = 1 << 0;
