//! Reply frame construction.
//!
//! A [`Response`] is the typed result of dispatching one request;
//! [`Response::into_vec`] serializes it into the final frame: a 16-byte
//! out-header whose `len` covers the whole vector, followed by the body.
//! Error replies are header-only.

use std::os::unix::ffi::OsStrExt;
use std::time::{SystemTime, UNIX_EPOCH};

use smallvec::SmallVec;
use zerocopy::{Immutable, IntoBytes};

use crate::handler::{Dirent, DirentPlus, IoctlReply};
use crate::ll::Errno;
use crate::ll::flags::FopenFlags;
use crate::ll::fuse_abi as abi;
use crate::{FileAttr, FileStat, FileType, Statfs};

/// Bodies at or below this size stay inline on the stack.
const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;
pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

/// Byte offset of the name within an encoded dirent.
pub(crate) const DIRENT_NAME_OFFSET: usize = size_of::<abi::fuse_dirent>();
const DIRENTPLUS_NAME_OFFSET: usize = size_of::<abi::fuse_direntplus>();

/// The result of one dispatched request, ready to serialize.
#[derive(Debug)]
pub(crate) enum Response {
    /// Success with an empty body.
    Empty,
    /// Failure; the signed errno travels in the header.
    Error(Errno),
    /// Success with an opcode-specific body.
    Data(ResponseBuf),
}

impl Response {
    /// Serialize into the frame written to the device.
    pub(crate) fn into_vec(self, unique: u64) -> Vec<u8> {
        let (error, body) = match self {
            Response::Empty => (0, ResponseBuf::new()),
            Response::Error(errno) => (errno.wire(), ResponseBuf::new()),
            Response::Data(buf) => (0, buf),
        };
        let header = abi::fuse_out_header {
            len: (abi::OUT_HEADER_LEN + body.len()) as u32,
            error,
            unique,
        };
        let mut frame = Vec::with_capacity(abi::OUT_HEADER_LEN + body.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    pub(crate) fn from_record<T: IntoBytes + Immutable>(record: &T) -> Response {
        Response::Data(ResponseBuf::from_slice(record.as_bytes()))
    }

    /// Raw body bytes, used for read replies.
    pub(crate) fn data(bytes: &[u8]) -> Response {
        Response::Data(ResponseBuf::from_slice(bytes))
    }

    /// ENTRY reply: inode identity plus attributes under one cache TTL.
    pub(crate) fn entry(stat: &FileStat, attr_timeout: f64) -> Response {
        Response::from_record(&entry_out(stat, attr_timeout))
    }

    /// ATTR reply.
    pub(crate) fn attr(attr: &FileAttr, attr_timeout: f64) -> Response {
        let (sec, nsec) = timeout_parts(attr_timeout);
        Response::from_record(&abi::fuse_attr_out {
            attr_valid: sec,
            attr_valid_nsec: nsec,
            dummy: 0,
            attr: fuse_attr_from(attr),
        })
    }

    /// READLINK reply: the target path with an explicit trailing NUL.
    pub(crate) fn readlink(target: &std::ffi::OsStr) -> Response {
        let bytes = target.as_bytes();
        let mut buf = ResponseBuf::with_capacity(bytes.len() + 1);
        buf.extend_from_slice(bytes);
        buf.push(0);
        Response::Data(buf)
    }

    /// OPEN reply.
    pub(crate) fn open(fh: u64, open_flags: FopenFlags) -> Response {
        Response::from_record(&abi::fuse_open_out {
            fh,
            open_flags: open_flags.bits(),
            padding: 0,
        })
    }

    /// CREATE reply: ENTRY immediately followed by OPEN.
    pub(crate) fn create(
        stat: &FileStat,
        attr_timeout: f64,
        fh: u64,
        open_flags: FopenFlags,
    ) -> Response {
        Response::from_record(&abi::fuse_create_out(
            entry_out(stat, attr_timeout),
            abi::fuse_open_out {
                fh,
                open_flags: open_flags.bits(),
                padding: 0,
            },
        ))
    }

    /// WRITE reply: the byte count accepted, not the data.
    pub(crate) fn write(written: u32) -> Response {
        Response::from_record(&abi::fuse_write_out {
            size: written,
            padding: 0,
        })
    }

    /// STATFS reply.
    pub(crate) fn statfs(st: &Statfs) -> Response {
        Response::from_record(&abi::fuse_statfs_out {
            st: abi::fuse_kstatfs {
                blocks: st.blocks,
                bfree: st.bfree,
                bavail: st.bavail,
                files: st.files,
                ffree: st.ffree,
                bsize: st.bsize,
                namelen: st.namelen,
                frsize: st.frsize,
                padding: 0,
                spare: [0; 6],
            },
        })
    }

    /// Size-probe reply for GETXATTR/LISTXATTR with `size == 0`: the
    /// value length only, no value bytes.
    pub(crate) fn xattr_size(size: u32) -> Response {
        Response::from_record(&abi::fuse_getxattr_out { size, padding: 0 })
    }

    /// Value reply for GETXATTR/LISTXATTR with `size > 0`: the length
    /// header, the value bytes and a trailing NUL.
    pub(crate) fn xattr_value(value: &[u8]) -> Response {
        let header = abi::fuse_getxattr_out {
            size: value.len() as u32,
            padding: 0,
        };
        let mut buf = ResponseBuf::with_capacity(size_of::<abi::fuse_getxattr_out>() + value.len() + 1);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(value);
        buf.push(0);
        Response::Data(buf)
    }

    /// GETLK reply.
    pub(crate) fn lock(lk: abi::fuse_file_lock) -> Response {
        Response::from_record(&abi::fuse_lk_out { lk })
    }

    /// BMAP reply.
    pub(crate) fn bmap(block: u64) -> Response {
        Response::from_record(&abi::fuse_bmap_out { block })
    }

    /// IOCTL reply, fixed part only.
    pub(crate) fn ioctl(reply: &IoctlReply) -> Response {
        Response::from_record(&abi::fuse_ioctl_out {
            result: reply.result,
            flags: reply.flags,
            in_iovs: reply.in_iovs,
            out_iovs: reply.out_iovs,
        })
    }

    /// POLL reply.
    pub(crate) fn poll(revents: u32) -> Response {
        Response::from_record(&abi::fuse_poll_out {
            revents,
            padding: 0,
        })
    }

    /// INIT reply.
    pub(crate) fn init(out: &abi::fuse_init_out) -> Response {
        Response::from_record(out)
    }
}

/// Split a fractional-second timeout into the `(sec, nsec)` pair stamped
/// into ENTRY/ATTR replies. The nanosecond part never reaches 1e9.
pub(crate) fn timeout_parts(timeout: f64) -> (u64, u32) {
    if timeout <= 0.0 {
        return (0, 0);
    }
    let sec = if timeout >= u64::MAX as f64 {
        u64::MAX
    } else {
        timeout as u64
    };
    let frac = timeout - sec as f64;
    let nsec = if frac <= 0.0 {
        0
    } else if frac >= 0.999_999_999 {
        999_999_999
    } else {
        (frac * 1.0e9) as u32
    };
    (sec, nsec)
}

fn entry_out(stat: &FileStat, attr_timeout: f64) -> abi::fuse_entry_out {
    let (sec, nsec) = timeout_parts(attr_timeout);
    abi::fuse_entry_out {
        nodeid: stat.nodeid,
        generation: stat.generation,
        entry_valid: sec,
        attr_valid: sec,
        entry_valid_nsec: nsec,
        attr_valid_nsec: nsec,
        attr: fuse_attr_from(&stat.attr),
    }
}

pub(crate) fn time_from_system_time(time: &SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(before_epoch) => (
            -(before_epoch.duration().as_secs() as i64),
            before_epoch.duration().subsec_nanos(),
        ),
    }
}

/// Combine a file kind and permission bits into a stat mode word.
pub(crate) fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (match kind {
        FileType::NamedPipe => libc::S_IFIFO,
        FileType::CharDevice => libc::S_IFCHR,
        FileType::BlockDevice => libc::S_IFBLK,
        FileType::Directory => libc::S_IFDIR,
        FileType::RegularFile => libc::S_IFREG,
        FileType::Symlink => libc::S_IFLNK,
        FileType::Socket => libc::S_IFSOCK,
    }) | u32::from(perm)
}

pub(crate) fn fuse_attr_from(attr: &FileAttr) -> abi::fuse_attr {
    let (atime, atimensec) = time_from_system_time(&attr.atime);
    let (mtime, mtimensec) = time_from_system_time(&attr.mtime);
    let (ctime, ctimensec) = time_from_system_time(&attr.ctime);
    abi::fuse_attr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime,
        mtime,
        ctime,
        atimensec,
        mtimensec,
        ctimensec,
        mode: mode_from_kind_and_perm(attr.kind, attr.perm),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        padding: 0,
    }
}

fn dirent_type(kind: FileType) -> u32 {
    mode_from_kind_and_perm(kind, 0) >> 12
}

/// READDIR reply body under construction.
///
/// The `off` written for the i-th entry is the cumulative padded byte
/// length of entries 0..=i; the kernel passes it back as the resume
/// offset. The buffer never exceeds the request's size cap.
#[derive(Debug)]
pub(crate) struct DirEntList {
    buf: ResponseBuf,
    max_size: usize,
}

impl DirEntList {
    pub(crate) fn new(max_size: usize) -> Self {
        DirEntList {
            buf: ResponseBuf::new(),
            max_size,
        }
    }

    /// Append one entry. Returns `false` without appending once the next
    /// entry would overflow the cap; the caller stops iterating.
    #[must_use]
    pub(crate) fn push(&mut self, ent: &Dirent) -> bool {
        let name = ent.name.as_os_str().as_bytes();
        let entlen = DIRENT_NAME_OFFSET + name.len();
        let entsize = entlen.next_multiple_of(size_of::<u64>());
        if self.buf.len() + entsize > self.max_size {
            return false;
        }
        let header = abi::fuse_dirent {
            ino: ent.ino,
            off: (self.buf.len() + entsize) as u64,
            namelen: name.len() as u32,
            typ: dirent_type(ent.kind),
        };
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(self.buf.len() + (entsize - entlen), 0);
        true
    }
}

impl From<DirEntList> for Response {
    fn from(list: DirEntList) -> Response {
        debug_assert!(list.buf.len() <= list.max_size);
        Response::Data(list.buf)
    }
}

/// READDIRPLUS reply body under construction; same offset and size-cap
/// rules as [`DirEntList`], with a full entry-out per record.
#[derive(Debug)]
pub(crate) struct DirEntPlusList {
    buf: ResponseBuf,
    max_size: usize,
}

impl DirEntPlusList {
    pub(crate) fn new(max_size: usize) -> Self {
        DirEntPlusList {
            buf: ResponseBuf::new(),
            max_size,
        }
    }

    #[must_use]
    pub(crate) fn push(&mut self, ent: &DirentPlus, attr_timeout: f64) -> bool {
        let name = ent.name.as_os_str().as_bytes();
        let entlen = DIRENTPLUS_NAME_OFFSET + name.len();
        let entsize = entlen.next_multiple_of(size_of::<u64>());
        if self.buf.len() + entsize > self.max_size {
            return false;
        }
        let attr = fuse_attr_from(&ent.stat.attr);
        let header = abi::fuse_direntplus {
            entry_out: entry_out(&ent.stat, attr_timeout),
            dirent: abi::fuse_dirent {
                ino: attr.ino,
                off: (self.buf.len() + entsize) as u64,
                namelen: name.len() as u32,
                typ: attr.mode >> 12,
            },
        };
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(self.buf.len() + (entsize - entlen), 0);
        true
    }
}

impl From<DirEntPlusList> for Response {
    fn from(list: DirEntPlusList) -> Response {
        debug_assert!(list.buf.len() <= list.max_size);
        Response::Data(list.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::time::Duration;
    use zerocopy::FromBytes;

    fn sample_attr() -> FileAttr {
        FileAttr {
            ino: 0x11,
            size: 0x22,
            blocks: 0x33,
            atime: UNIX_EPOCH + Duration::new(0x1234, 0x5678),
            mtime: UNIX_EPOCH + Duration::new(0x1234, 0x5678),
            ctime: UNIX_EPOCH + Duration::new(0x1234, 0x5678),
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 0x55,
            uid: 0x66,
            gid: 0x77,
            rdev: 0x88,
            blksize: 0xbb,
        }
    }

    #[test]
    fn reply_empty() {
        let frame = Response::Empty.into_vec(0xdeadbeef);
        assert_eq!(
            frame,
            vec![
                0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00,
            ],
        );
    }

    #[test]
    fn reply_error() {
        let frame = Response::Error(Errno::ENOENT).into_vec(0xdeadbeef);
        assert_eq!(
            frame,
            vec![
                0x10, 0x00, 0x00, 0x00, 0xfe, 0xff, 0xff, 0xff, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00,
            ],
        );
    }

    #[test]
    fn header_accounting() {
        let frame = Response::data(&[0xde, 0xad, 0xbe, 0xef]).into_vec(0x99);
        assert_eq!(frame.len(), 20);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 20);
        assert_eq!(u64::from_le_bytes(frame[8..16].try_into().unwrap()), 0x99);
        assert_eq!(&frame[16..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn reply_write() {
        let frame = Response::write(0x1122).into_vec(0xdeadbeef);
        assert_eq!(
            frame,
            vec![
                0x18, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00, 0x22, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        );
    }

    #[test]
    fn reply_xattr_size_probe() {
        let frame = Response::xattr_size(2).into_vec(1);
        assert_eq!(frame.len(), 24);
        assert_eq!(u32::from_le_bytes(frame[16..20].try_into().unwrap()), 2);
        assert_eq!(&frame[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn reply_xattr_value() {
        let frame = Response::xattr_value(b"v1").into_vec(1);
        // header + 8-byte size record + "v1" + NUL
        assert_eq!(frame.len(), 16 + 8 + 3);
        assert_eq!(u32::from_le_bytes(frame[16..20].try_into().unwrap()), 2);
        assert_eq!(&frame[24..], b"v1\0");
    }

    #[test]
    fn reply_entry_fields() {
        let stat = FileStat {
            nodeid: 2,
            generation: 0xaa,
            attr: sample_attr(),
        };
        let frame = Response::entry(&stat, 2.5).into_vec(7);
        assert_eq!(frame.len(), 16 + 128);
        let out = abi::fuse_entry_out::read_from_bytes(&frame[16..]).unwrap();
        assert_eq!(out.nodeid, 2);
        assert_eq!(out.generation, 0xaa);
        assert_eq!(out.attr_valid, 2);
        assert_eq!(out.attr_valid_nsec, 500_000_000);
        assert_eq!(out.entry_valid, 2);
        assert_eq!(out.attr.ino, 0x11);
        assert_eq!(out.attr.mode, libc::S_IFREG | 0o644);
        assert_eq!(out.attr.atime, 0x1234);
        assert_eq!(out.attr.atimensec, 0x5678);
    }

    #[test]
    fn reply_attr_fields() {
        let frame = Response::attr(&sample_attr(), 2.0).into_vec(7);
        assert_eq!(frame.len(), 16 + 104);
        let out = abi::fuse_attr_out::read_from_bytes(&frame[16..]).unwrap();
        assert_eq!(out.attr_valid, 2);
        assert_eq!(out.attr_valid_nsec, 0);
        assert_eq!(out.attr.blksize, 0xbb);
    }

    #[test]
    fn reply_open_flag_bits() {
        let frame =
            Response::open(0x1122, FopenFlags::DIRECT_IO | FopenFlags::NONSEEKABLE).into_vec(1);
        let out = abi::fuse_open_out::read_from_bytes(&frame[16..]).unwrap();
        assert_eq!(out.fh, 0x1122);
        assert_eq!(out.open_flags, 0b101);
    }

    #[test]
    fn reply_readlink_appends_nul() {
        let frame = Response::readlink(std::ffi::OsStr::new("/tmp/x")).into_vec(1);
        assert_eq!(&frame[16..], b"/tmp/x\0");
    }

    #[test]
    fn reply_statfs_default_shape() {
        let frame = Response::statfs(&Statfs::default()).into_vec(1);
        assert_eq!(frame.len(), 16 + 80);
        let out = abi::fuse_statfs_out::read_from_bytes(&frame[16..]).unwrap();
        assert_eq!(out.st.namelen, 255);
        assert_eq!(out.st.bsize, 512);
    }

    #[test]
    fn timeout_split() {
        assert_eq!(timeout_parts(2.0), (2, 0));
        assert_eq!(timeout_parts(0.5), (0, 500_000_000));
        assert_eq!(timeout_parts(-1.0), (0, 0));
        assert_eq!(timeout_parts(1.9999999999), (1, 999_999_999));
    }

    #[test]
    fn dirent_offsets_accumulate() {
        let mut list = DirEntList::new(4096);
        for (ino, name, kind) in [
            (1u64, ".", FileType::Directory),
            (1, "..", FileType::Directory),
            (2, "hello", FileType::RegularFile),
        ] {
            let pushed = list.push(&Dirent {
                ino,
                off: 0,
                kind,
                name: OsString::from(name),
            });
            assert!(pushed);
        }
        let Response::Data(buf) = Response::from(list) else {
            panic!("directory reply must carry data");
        };
        // ".", ".." and "hello" each pad to 32 bytes.
        assert_eq!(buf.len(), 96);
        let first = abi::fuse_dirent::read_from_prefix(&buf).unwrap().0;
        assert_eq!(first.ino, 1);
        assert_eq!(first.off, 32);
        assert_eq!(first.typ, (libc::S_IFDIR >> 12));
        let second = abi::fuse_dirent::read_from_prefix(&buf[32..]).unwrap().0;
        assert_eq!(second.off, 64);
        let third = abi::fuse_dirent::read_from_prefix(&buf[64..]).unwrap().0;
        assert_eq!(third.ino, 2);
        assert_eq!(third.off, 96);
        assert_eq!(third.namelen, 5);
        assert_eq!(&buf[88..93], b"hello");
    }

    #[test]
    fn dirent_list_respects_size_cap() {
        let mut list = DirEntList::new(64);
        let ent = |name: &str| Dirent {
            ino: 1,
            off: 0,
            kind: FileType::RegularFile,
            name: OsString::from(name),
        };
        assert!(list.push(&ent("aaaa")));
        assert!(list.push(&ent("bbbb")));
        // a third 32-byte entry would exceed the 64-byte cap
        assert!(!list.push(&ent("cccc")));
        let Response::Data(buf) = Response::from(list) else {
            panic!("directory reply must carry data");
        };
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn direntplus_layout() {
        let mut list = DirEntPlusList::new(4096);
        let stat = FileStat {
            nodeid: 5,
            generation: 1,
            attr: FileAttr {
                ino: 5,
                ..sample_attr()
            },
        };
        assert!(list.push(
            &DirentPlus {
                name: OsString::from("file"),
                stat,
            },
            1.0,
        ));
        let Response::Data(buf) = Response::from(list) else {
            panic!("directory reply must carry data");
        };
        assert_eq!(buf.len(), 160); // 152 + 4 name bytes, padded to 8
        let rec = abi::fuse_direntplus::read_from_prefix(&buf).unwrap().0;
        assert_eq!(rec.entry_out.nodeid, 5);
        assert_eq!(rec.dirent.ino, 5);
        assert_eq!(rec.dirent.off, 160);
        assert_eq!(rec.dirent.namelen, 4);
    }
}
