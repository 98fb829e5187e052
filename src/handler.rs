//! The callback surface a host filesystem implements.
//!
//! [`Filesystem`] mirrors the low-level (inode-oriented) FUSE operation
//! set. Every method has a default implementation, so a host overrides
//! only what it serves; unimplemented operations answer `ENOSYS` except
//! for the handful the protocol treats as trivially successful (open,
//! opendir, flush, release, releasedir and statfs).

use std::any::Any;
use std::ffi::{OsStr, OsString};
use std::time::SystemTime;

use bitflags::bitflags;
use log::warn;

use crate::conn::{Config, ConnInfo};
use crate::ll::Errno;
use crate::ll::flags::SetattrValid;
use crate::{FileStat, FileType, Statfs};

/// Opaque per-session value produced by [`Filesystem::init`] and handed
/// back to [`Filesystem::destroy`].
pub type UserData = Box<dyn Any + Send>;

bitflags! {
    /// Which negotiation-relevant handlers a host actually implements.
    ///
    /// Trait default methods make "is this overridden?" unobservable, so
    /// hosts declare it explicitly via [`Filesystem::handlers`]. The INIT
    /// exchange enables `POSIX_LOCKS` only when both lock handlers are
    /// declared, and `READDIRPLUS`/`READDIRPLUS_AUTO` only when
    /// `READDIRPLUS` is declared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandlerSet: u32 {
        /// `getlk` is implemented.
        const GETLK = 1 << 0;
        /// `setlk` is implemented.
        const SETLK = 1 << 1;
        /// `readdirplus` is implemented.
        const READDIRPLUS = 1 << 2;
    }
}

/// Per-request context handed to every handler.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    /// Correlation token of this request; replies carry it back.
    pub unique: u64,
    /// Effective user id of the calling process.
    pub uid: u32,
    /// Effective group id of the calling process.
    pub gid: u32,
    /// Process id of the caller.
    pub pid: u32,
    /// Negotiated connection parameters (snapshot).
    pub conn: ConnInfo,
    /// Session configuration (snapshot).
    pub config: Config,
}

/// Per-open state carried into and out of the file operation handlers.
///
/// `fh` is a host-chosen handle stored by `open`/`opendir`/`create` and
/// replayed on every subsequent operation until the matching release.
/// The advisory booleans set during open are reported to the kernel and
/// influence its caching.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileInfo {
    /// open(2) flags. Available in open and release.
    pub flags: i32,
    /// The write was caused by a page writeback, not a direct write.
    pub writepage: bool,
    /// May be set by open: bypass the page cache for this file.
    pub direct_io: bool,
    /// May be set by open: keep previously cached data intact.
    pub keep_cache: bool,
    /// Set for flush operations and some release paths.
    pub flush: bool,
    /// May be set by open: the file is not seekable.
    pub nonseekable: bool,
    /// Set in release when flock locks held on the file must go.
    pub flock_release: bool,
    /// File handle chosen by the host in open; echoed everywhere else.
    pub fh: u64,
    /// Lock owner id, valid in locking operations and flush.
    pub lock_owner: u64,
    /// Requested poll events; only set by poll requests.
    pub poll_events: u32,
}

/// A time value in setattr: either an explicit stamp or "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    /// Set to the given time.
    SpecificTime(SystemTime),
    /// Set to the current time.
    Now,
}

/// Decoded setattr request: only fields selected by `valid` are `Some`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    /// Raw selector bits as received.
    pub valid: SetattrValid,
    /// New file mode.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New size (truncate/extend).
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<TimeOrNow>,
    /// New modification time.
    pub mtime: Option<TimeOrNow>,
    /// New change time.
    pub ctime: Option<SystemTime>,
    /// File handle, when the request came from ftruncate(2).
    pub fh: Option<u64>,
    /// Lock owner, when the kernel provided one.
    pub lock_owner: Option<u64>,
}

/// A POSIX advisory lock description, the shape fcntl(2) uses.
///
/// `len == 0` means the lock reaches end-of-file; on the wire that is the
/// `0x7fffffffffffffff` end sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flock {
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub typ: i32,
    /// Interpretation base for `start`; always `SEEK_SET` here.
    pub whence: i32,
    /// First byte of the locked range.
    pub start: i64,
    /// Length of the range, 0 for "to end of file".
    pub len: i64,
    /// Process holding the lock (getlk output).
    pub pid: u32,
}

/// One directory entry produced by a readdir handler.
///
/// `off` is the entry's position cookie as the host tracks it; when the
/// reply is framed the session rewrites it to the cumulative byte offset
/// the kernel uses for resumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Inode number.
    pub ino: u64,
    /// Host-side position of this entry.
    pub off: u64,
    /// Entry type.
    pub kind: FileType,
    /// Entry name, no NUL.
    pub name: OsString,
}

/// One readdirplus entry: a directory entry plus the attributes a
/// separate lookup would have produced.
#[derive(Debug, Clone)]
pub struct DirentPlus {
    /// Entry name, no NUL.
    pub name: OsString,
    /// Inode identity and attributes of the entry.
    pub stat: FileStat,
}

/// One record of a BATCH_FORGET request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForgetOne {
    /// Inode whose lookup count drops.
    pub nodeid: u64,
    /// How many lookups to forget.
    pub nlookup: u64,
}

/// Result record of an ioctl handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoctlReply {
    /// Value returned to the calling ioctl(2).
    pub result: i32,
    /// Reply flags; only meaningful for unrestricted ioctls.
    pub flags: u32,
    /// Number of input iovecs.
    pub in_iovs: u32,
    /// Number of output iovecs.
    pub out_iovs: u32,
}

/// Kernel poll handle, present when the kernel asked to be notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollHandle {
    /// Kernel-side handle to pass back in a poll wakeup notification.
    pub kh: u64,
}

/// The filesystem operation callbacks.
///
/// Handlers run on session worker threads, so implementations must be
/// `Send + Sync`. Each handler returns its typed result or an [`Errno`]
/// that is propagated verbatim into the reply header.
#[allow(unused_variables)]
pub trait Filesystem: Send + Sync + 'static {
    /// Declare which negotiation-relevant handlers exist; see [`HandlerSet`].
    fn handlers(&self) -> HandlerSet {
        HandlerSet::empty()
    }

    /// Called once when the INIT exchange completes, before any other
    /// operation. The returned value is stored on the session and handed
    /// back to [`destroy`](Self::destroy).
    fn init(&self, req: &Request, conn: &ConnInfo) -> Option<UserData> {
        None
    }

    /// Clean up on filesystem teardown. The connection to the kernel may
    /// already be gone when this runs.
    fn destroy(&self, userdata: Option<UserData>) {}

    /// Look up a directory entry by name and return its attributes.
    fn lookup(&self, req: &Request, parent: u64, name: &OsStr) -> Result<FileStat, Errno> {
        warn!("[not implemented] lookup(parent: {parent:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Forget about an inode: the kernel dropped `nlookup` references.
    /// On unmount there is no guarantee every inode receives a forget.
    fn forget(&self, req: &Request, nodeid: u64, nlookup: u64) {}

    /// Batched forget. Defaults to one [`forget`](Self::forget) per record.
    fn batch_forget(&self, req: &Request, nodes: &[ForgetOne]) {
        for node in nodes {
            self.forget(req, node.nodeid, node.nlookup);
        }
    }

    /// Get file attributes. `fh` is set when the kernel passed a handle.
    fn getattr(&self, req: &Request, nodeid: u64, fh: Option<u64>) -> Result<FileStat, Errno> {
        warn!("[not implemented] getattr(nodeid: {nodeid:#x})");
        Err(Errno::ENOSYS)
    }

    /// Set the attributes selected in `changes` and return the result.
    fn setattr(&self, req: &Request, nodeid: u64, changes: &SetAttr) -> Result<FileStat, Errno> {
        warn!("[not implemented] setattr(nodeid: {nodeid:#x}, valid: {:?})", changes.valid);
        Err(Errno::ENOSYS)
    }

    /// Read the target of a symbolic link.
    fn readlink(&self, req: &Request, nodeid: u64) -> Result<OsString, Errno> {
        warn!("[not implemented] readlink(nodeid: {nodeid:#x})");
        Err(Errno::ENOSYS)
    }

    /// Create a file node (regular, device, fifo or socket).
    fn mknod(
        &self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<FileStat, Errno> {
        warn!("[not implemented] mknod(parent: {parent:#x}, name: {name:?}, mode: {mode:#o})");
        Err(Errno::ENOSYS)
    }

    /// Create a directory.
    fn mkdir(
        &self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<FileStat, Errno> {
        warn!("[not implemented] mkdir(parent: {parent:#x}, name: {name:?}, mode: {mode:#o})");
        Err(Errno::ENOSYS)
    }

    /// Remove a file.
    fn unlink(&self, req: &Request, parent: u64, name: &OsStr) -> Result<(), Errno> {
        warn!("[not implemented] unlink(parent: {parent:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Remove a directory.
    fn rmdir(&self, req: &Request, parent: u64, name: &OsStr) -> Result<(), Errno> {
        warn!("[not implemented] rmdir(parent: {parent:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Create a symbolic link in `parent` named `name` pointing at `target`.
    fn symlink(
        &self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<FileStat, Errno> {
        warn!("[not implemented] symlink(parent: {parent:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Rename a file. `flags` carries RENAME_EXCHANGE / RENAME_NOREPLACE
    /// semantics when the request came in as RENAME2, zero otherwise.
    fn rename(
        &self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        warn!("[not implemented] rename(parent: {parent:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Create a hard link to `nodeid` under `newparent`.
    fn link(
        &self,
        req: &Request,
        nodeid: u64,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<FileStat, Errno> {
        warn!("[not implemented] link(nodeid: {nodeid:#x}, newname: {newname:?})");
        Err(Errno::ENOSYS)
    }

    /// Open a file. The host may store a handle in `fi.fh` and set the
    /// caching advisories. The default accepts the open statelessly.
    fn open(&self, req: &Request, nodeid: u64, fi: &mut FileInfo) -> Result<(), Errno> {
        Ok(())
    }

    /// Read `size` bytes at `offset`. Short reads mean end-of-file unless
    /// the file was opened in direct-I/O mode.
    fn read(
        &self,
        req: &Request,
        nodeid: u64,
        size: u32,
        offset: u64,
        fi: &FileInfo,
    ) -> Result<Vec<u8>, Errno> {
        warn!("[not implemented] read(nodeid: {nodeid:#x}, size: {size}, offset: {offset})");
        Err(Errno::ENOSYS)
    }

    /// Write `data` at `offset`, returning the number of bytes accepted.
    fn write(
        &self,
        req: &Request,
        nodeid: u64,
        data: &[u8],
        offset: u64,
        fi: &FileInfo,
    ) -> Result<u32, Errno> {
        warn!(
            "[not implemented] write(nodeid: {nodeid:#x}, len: {}, offset: {offset})",
            data.len()
        );
        Err(Errno::ENOSYS)
    }

    /// Called on every close(2) of an open file; may be called many times
    /// per open. The default succeeds.
    fn flush(&self, req: &Request, nodeid: u64, fi: &FileInfo) -> Result<(), Errno> {
        Ok(())
    }

    /// Release an open file; exactly one release per successful open.
    /// Errors are not observable by the closing process.
    fn release(&self, req: &Request, nodeid: u64, fi: &FileInfo) -> Result<(), Errno> {
        Ok(())
    }

    /// Flush file contents. With `datasync` only user data needs to reach
    /// stable storage, not metadata.
    fn fsync(
        &self,
        req: &Request,
        nodeid: u64,
        datasync: bool,
        fi: &FileInfo,
    ) -> Result<(), Errno> {
        warn!("[not implemented] fsync(nodeid: {nodeid:#x}, datasync: {datasync})");
        Err(Errno::ENOSYS)
    }

    /// Open a directory; same handle rules as [`open`](Self::open).
    fn opendir(&self, req: &Request, nodeid: u64, fi: &mut FileInfo) -> Result<(), Errno> {
        Ok(())
    }

    /// List directory entries starting at `offset`. The session frames as
    /// many returned entries as fit in `size` bytes and silently drops
    /// the rest; the kernel re-requests with a later offset.
    fn readdir(
        &self,
        req: &Request,
        nodeid: u64,
        size: u32,
        offset: u64,
        fi: &FileInfo,
    ) -> Result<Vec<Dirent>, Errno> {
        warn!("[not implemented] readdir(nodeid: {nodeid:#x}, offset: {offset})");
        Err(Errno::ENOSYS)
    }

    /// Like [`readdir`](Self::readdir) but each entry carries the
    /// attributes a lookup would return, saving the round trip.
    fn readdirplus(
        &self,
        req: &Request,
        nodeid: u64,
        size: u32,
        offset: u64,
        fi: &FileInfo,
    ) -> Result<Vec<DirentPlus>, Errno> {
        warn!("[not implemented] readdirplus(nodeid: {nodeid:#x}, offset: {offset})");
        Err(Errno::ENOSYS)
    }

    /// Release an open directory; exactly one per successful opendir.
    fn releasedir(&self, req: &Request, nodeid: u64, fi: &FileInfo) -> Result<(), Errno> {
        Ok(())
    }

    /// Flush directory contents.
    fn fsyncdir(
        &self,
        req: &Request,
        nodeid: u64,
        datasync: bool,
        fi: &FileInfo,
    ) -> Result<(), Errno> {
        warn!("[not implemented] fsyncdir(nodeid: {nodeid:#x}, datasync: {datasync})");
        Err(Errno::ENOSYS)
    }

    /// Filesystem statistics. The default reports a minimal synthetic
    /// filesystem (`bsize` 512, `namelen` 255).
    fn statfs(&self, req: &Request, nodeid: u64) -> Result<Statfs, Errno> {
        Ok(Statfs::default())
    }

    /// Set an extended attribute.
    fn setxattr(
        &self,
        req: &Request,
        nodeid: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        warn!("[not implemented] setxattr(nodeid: {nodeid:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Get an extended attribute value.
    ///
    /// When `size` is zero the kernel is probing for the value length and
    /// only the returned length is transmitted. When `size` is non-zero
    /// and the value does not fit, return `ERANGE`.
    fn getxattr(
        &self,
        req: &Request,
        nodeid: u64,
        name: &OsStr,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        warn!("[not implemented] getxattr(nodeid: {nodeid:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// List extended attribute names as one NUL-separated byte string
    /// (no trailing separator). Same size-probe protocol as
    /// [`getxattr`](Self::getxattr).
    fn listxattr(&self, req: &Request, nodeid: u64, size: u32) -> Result<Vec<u8>, Errno> {
        warn!("[not implemented] listxattr(nodeid: {nodeid:#x}, size: {size})");
        Err(Errno::ENOSYS)
    }

    /// Remove an extended attribute.
    fn removexattr(&self, req: &Request, nodeid: u64, name: &OsStr) -> Result<(), Errno> {
        warn!("[not implemented] removexattr(nodeid: {nodeid:#x}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Check access permissions for access(2).
    fn access(&self, req: &Request, nodeid: u64, mask: i32) -> Result<(), Errno> {
        warn!("[not implemented] access(nodeid: {nodeid:#x}, mask: {mask:#o})");
        Err(Errno::ENOSYS)
    }

    /// Atomically create and open a file. The handle rules of
    /// [`open`](Self::open) apply to `fi`.
    fn create(
        &self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        fi: &mut FileInfo,
    ) -> Result<FileStat, Errno> {
        warn!("[not implemented] create(parent: {parent:#x}, name: {name:?}, mode: {mode:#o})");
        Err(Errno::ENOSYS)
    }

    /// Test for a POSIX lock; return the conflicting lock, or one with
    /// `F_UNLCK` type when the range is free.
    fn getlk(
        &self,
        req: &Request,
        nodeid: u64,
        fi: &FileInfo,
        lock: &Flock,
    ) -> Result<Flock, Errno> {
        warn!("[not implemented] getlk(nodeid: {nodeid:#x})");
        Err(Errno::ENOSYS)
    }

    /// Acquire, modify or release a POSIX lock. `sleep` distinguishes
    /// SETLKW from SETLK. Only interesting for network filesystems;
    /// without these handlers the kernel still locks locally.
    fn setlk(
        &self,
        req: &Request,
        nodeid: u64,
        fi: &FileInfo,
        lock: &Flock,
        sleep: bool,
    ) -> Result<(), Errno> {
        warn!("[not implemented] setlk(nodeid: {nodeid:#x}, sleep: {sleep})");
        Err(Errno::ENOSYS)
    }

    /// Map a block index within the file to a device block index. Only
    /// meaningful for block-device-backed filesystems.
    fn bmap(&self, req: &Request, nodeid: u64, blocksize: u32, idx: u64) -> Result<u64, Errno> {
        warn!("[not implemented] bmap(nodeid: {nodeid:#x}, blocksize: {blocksize})");
        Err(Errno::ENOSYS)
    }

    /// Driver-specific control operation.
    fn ioctl(
        &self,
        req: &Request,
        nodeid: u64,
        cmd: u32,
        arg: u64,
        fi: &FileInfo,
        in_data: &[u8],
        out_size: u32,
    ) -> Result<IoctlReply, Errno> {
        warn!("[not implemented] ioctl(nodeid: {nodeid:#x}, cmd: {cmd:#x})");
        Err(Errno::ENOSYS)
    }

    /// Poll for I/O readiness; returns the ready event mask. `ph` is
    /// present when the kernel wants a wakeup notification later.
    fn poll(
        &self,
        req: &Request,
        nodeid: u64,
        fi: &FileInfo,
        ph: Option<PollHandle>,
    ) -> Result<u32, Errno> {
        warn!("[not implemented] poll(nodeid: {nodeid:#x})");
        Err(Errno::ENOSYS)
    }

    /// Preallocate or deallocate file space.
    fn fallocate(
        &self,
        req: &Request,
        nodeid: u64,
        mode: u32,
        offset: u64,
        length: u64,
        fi: &FileInfo,
    ) -> Result<(), Errno> {
        warn!("[not implemented] fallocate(nodeid: {nodeid:#x}, mode: {mode:#x})");
        Err(Errno::ENOSYS)
    }

    /// The kernel asked to interrupt the in-flight request identified by
    /// `unique`. The session does not abort handlers on its own; hosts
    /// that track long-running operations can react here.
    fn interrupt(&self, req: &Request, unique: u64) {}
}
