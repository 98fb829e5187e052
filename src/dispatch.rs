//! Request dispatch.
//!
//! Turns one decoded request into at most one reply frame: looks up the
//! opcode, invokes the matching handler with a request context, and
//! translates the handler's result into the opcode's reply record. The
//! INIT exchange and its capability negotiation live here too, because
//! they gate every other opcode.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::handler::{
    FileInfo, Filesystem, Flock, HandlerSet, PollHandle, Request, SetAttr, TimeOrNow,
};
use crate::ll::Errno;
use crate::ll::flags::{
    FUSE_FSYNC_FDATASYNC, FUSE_GETATTR_FH, FUSE_POLL_SCHEDULE_NOTIFY, FUSE_READ_LOCKOWNER,
    FUSE_RELEASE_FLOCK_UNLOCK, FUSE_RELEASE_FLUSH, FUSE_WRITE_CACHE, FUSE_WRITE_LOCKOWNER,
    FopenFlags, InitFlags, IoctlFlags, LockFlags, SetattrValid,
};
use crate::ll::fuse_abi as abi;
use crate::ll::reply::{DirEntList, DirEntPlusList, Response};
use crate::ll::request::Operation;
use crate::session::{SessionShared, SessionState};

/// Handle one request frame. `None` means the opcode never replies or
/// the frame was dropped as undecodable.
pub(crate) fn handle_request<FS: Filesystem>(
    shared: &SessionShared<FS>,
    header: &abi::fuse_in_header,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let op = match Operation::decode(header.opcode, payload) {
        Ok(op) => op,
        Err(err) => {
            warn!(
                "dropping request unique {} (opcode {}): {err}",
                header.unique, header.opcode
            );
            return None;
        }
    };

    match shared.state() {
        SessionState::AwaitingInit if !matches!(op, Operation::Init { .. }) => {
            warn!("opcode {} received before INIT", header.opcode);
            return Some(Response::Error(Errno::EIO).into_vec(header.unique));
        }
        SessionState::Draining if !matches!(op, Operation::Destroy) => {
            warn!("opcode {} received while draining", header.opcode);
            return Some(Response::Error(Errno::EIO).into_vec(header.unique));
        }
        _ => {}
    }

    let req = Request {
        unique: header.unique,
        uid: header.uid,
        gid: header.gid,
        pid: header.pid,
        conn: *shared.conn.read(),
        config: shared.config,
    };
    let nodeid = header.nodeid;
    let ttl = shared.config.attr_timeout;
    let fs = &shared.fs;

    let response = match op {
        Operation::Init { arg } => do_init(shared, &req, &arg),

        Operation::Destroy => {
            shared.set_state(SessionState::Draining);
            let userdata = shared.userdata.lock().take();
            fs.destroy(userdata);
            return None;
        }

        Operation::Forget { nlookup } => {
            fs.forget(&req, nodeid, nlookup);
            return None;
        }

        Operation::BatchForget { nodes } => {
            fs.batch_forget(&req, &nodes);
            return None;
        }

        Operation::Interrupt { unique } => {
            debug!("interrupt requested for unique {unique}");
            fs.interrupt(&req, unique);
            return None;
        }

        Operation::Lookup { name } => match fs.lookup(&req, nodeid, name) {
            Ok(stat) => Response::entry(&stat, ttl),
            Err(err) => Response::Error(err),
        },

        Operation::Getattr { arg } => {
            let fh = (arg.getattr_flags & FUSE_GETATTR_FH != 0).then_some(arg.fh);
            match fs.getattr(&req, nodeid, fh) {
                Ok(stat) => Response::attr(&stat.attr, ttl),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Setattr { arg } => {
            let changes = setattr_from_wire(&arg);
            match fs.setattr(&req, nodeid, &changes) {
                Ok(stat) => Response::attr(&stat.attr, ttl),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Readlink => match fs.readlink(&req, nodeid) {
            Ok(target) => Response::readlink(&target),
            Err(err) => Response::Error(err),
        },

        Operation::Mknod { arg, name } => {
            match fs.mknod(&req, nodeid, name, arg.mode, arg.umask, arg.rdev) {
                Ok(stat) => Response::entry(&stat, ttl),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Mkdir { arg, name } => {
            match fs.mkdir(&req, nodeid, name, arg.mode, arg.umask) {
                Ok(stat) => Response::entry(&stat, ttl),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Unlink { name } => empty_or_error(fs.unlink(&req, nodeid, name)),
        Operation::Rmdir { name } => empty_or_error(fs.rmdir(&req, nodeid, name)),

        Operation::Symlink { name, target } => match fs.symlink(&req, nodeid, name, target) {
            Ok(stat) => Response::entry(&stat, ttl),
            Err(err) => Response::Error(err),
        },

        Operation::Rename {
            newdir,
            flags,
            name,
            newname,
        } => empty_or_error(fs.rename(&req, nodeid, name, newdir, newname, flags)),

        Operation::Link { oldnodeid, newname } => {
            match fs.link(&req, oldnodeid, nodeid, newname) {
                Ok(stat) => Response::entry(&stat, ttl),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Open { flags } => {
            let mut fi = FileInfo {
                flags,
                ..FileInfo::default()
            };
            match fs.open(&req, nodeid, &mut fi) {
                Ok(()) => Response::open(fi.fh, fopen_flags(&fi)),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Opendir { flags } => {
            let mut fi = FileInfo {
                flags,
                ..FileInfo::default()
            };
            match fs.opendir(&req, nodeid, &mut fi) {
                Ok(()) => Response::open(fi.fh, fopen_flags(&fi)),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Read { arg } => {
            let mut fi = FileInfo {
                fh: arg.fh,
                ..FileInfo::default()
            };
            if req.conn.minor >= 9 {
                fi.flags = arg.flags;
                if arg.read_flags & FUSE_READ_LOCKOWNER != 0 {
                    fi.lock_owner = arg.lock_owner;
                }
            }
            match fs.read(&req, nodeid, arg.size, arg.offset, &fi) {
                Ok(data) => Response::data(&data),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Write { arg, data } => {
            let mut fi = FileInfo {
                fh: arg.fh,
                ..FileInfo::default()
            };
            if arg.write_flags & FUSE_WRITE_CACHE != 0 {
                fi.writepage = true;
            }
            if req.conn.minor >= 9 {
                fi.flags = arg.flags;
                if arg.write_flags & FUSE_WRITE_LOCKOWNER != 0 {
                    fi.lock_owner = arg.lock_owner;
                }
            }
            match fs.write(&req, nodeid, data, arg.offset, &fi) {
                Ok(written) => Response::write(written),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Flush { arg } => {
            let mut fi = FileInfo {
                fh: arg.fh,
                flush: true,
                ..FileInfo::default()
            };
            if req.conn.minor >= 9 {
                fi.lock_owner = arg.lock_owner;
            }
            empty_or_error(fs.flush(&req, nodeid, &fi))
        }

        Operation::Release { arg } => {
            let fi = FileInfo {
                fh: arg.fh,
                flags: arg.flags,
                flush: arg.release_flags & FUSE_RELEASE_FLUSH != 0,
                flock_release: arg.release_flags & FUSE_RELEASE_FLOCK_UNLOCK != 0,
                lock_owner: arg.lock_owner,
                ..FileInfo::default()
            };
            empty_or_error(fs.release(&req, nodeid, &fi))
        }

        Operation::Releasedir { arg } => {
            let fi = FileInfo {
                fh: arg.fh,
                flags: arg.flags,
                ..FileInfo::default()
            };
            empty_or_error(fs.releasedir(&req, nodeid, &fi))
        }

        Operation::Fsync { fh, fsync_flags } => {
            let fi = FileInfo {
                fh,
                ..FileInfo::default()
            };
            let datasync = fsync_flags & FUSE_FSYNC_FDATASYNC != 0;
            empty_or_error(fs.fsync(&req, nodeid, datasync, &fi))
        }

        Operation::Fsyncdir { fh, fsync_flags } => {
            let fi = FileInfo {
                fh,
                ..FileInfo::default()
            };
            let datasync = fsync_flags & FUSE_FSYNC_FDATASYNC != 0;
            empty_or_error(fs.fsyncdir(&req, nodeid, datasync, &fi))
        }

        Operation::Readdir { arg } => {
            let fi = FileInfo {
                fh: arg.fh,
                ..FileInfo::default()
            };
            match fs.readdir(&req, nodeid, arg.size, arg.offset, &fi) {
                Ok(entries) => {
                    let mut list = DirEntList::new(arg.size as usize);
                    for entry in &entries {
                        if !list.push(entry) {
                            break;
                        }
                    }
                    list.into()
                }
                Err(err) => Response::Error(err),
            }
        }

        Operation::Readdirplus { arg } => {
            let fi = FileInfo {
                fh: arg.fh,
                ..FileInfo::default()
            };
            match fs.readdirplus(&req, nodeid, arg.size, arg.offset, &fi) {
                Ok(entries) => {
                    let mut list = DirEntPlusList::new(arg.size as usize);
                    for entry in &entries {
                        if !list.push(entry, ttl) {
                            break;
                        }
                    }
                    list.into()
                }
                Err(err) => Response::Error(err),
            }
        }

        Operation::Statfs => match fs.statfs(&req, nodeid) {
            Ok(st) => Response::statfs(&st),
            Err(err) => Response::Error(err),
        },

        Operation::Setxattr { flags, name, value } => {
            empty_or_error(fs.setxattr(&req, nodeid, name, value, flags))
        }

        Operation::Getxattr { size, name } => match fs.getxattr(&req, nodeid, name, size) {
            Ok(value) => xattr_response(size, &value),
            Err(err) => Response::Error(err),
        },

        Operation::Listxattr { size } => match fs.listxattr(&req, nodeid, size) {
            Ok(list) => xattr_response(size, &list),
            Err(err) => Response::Error(err),
        },

        Operation::Removexattr { name } => empty_or_error(fs.removexattr(&req, nodeid, name)),

        Operation::Access { mask } => empty_or_error(fs.access(&req, nodeid, mask)),

        Operation::Create { arg, name } => {
            let mut fi = FileInfo {
                flags: arg.flags,
                ..FileInfo::default()
            };
            match fs.create(&req, nodeid, name, arg.mode, arg.umask, &mut fi) {
                Ok(stat) => Response::create(&stat, ttl, fi.fh, fopen_flags(&fi)),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Getlk { arg } => {
            let fi = FileInfo {
                fh: arg.fh,
                lock_owner: arg.owner,
                ..FileInfo::default()
            };
            let lock = flock_from_wire(&arg.lk);
            match fs.getlk(&req, nodeid, &fi, &lock) {
                Ok(result) => Response::lock(flock_to_wire(&result)),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Setlk { arg, sleep } => {
            let fi = FileInfo {
                fh: arg.fh,
                lock_owner: arg.owner,
                ..FileInfo::default()
            };
            if LockFlags::from_bits_truncate(arg.lk_flags).contains(LockFlags::FLOCK) {
                let mut op = if arg.lk.typ == libc::F_RDLCK {
                    libc::LOCK_SH
                } else if arg.lk.typ == libc::F_WRLCK {
                    libc::LOCK_EX
                } else {
                    libc::LOCK_UN
                };
                if !sleep {
                    op |= libc::LOCK_NB;
                }
                // The advisory lock itself is not applied at this layer.
                debug!("flock-style setlk (op {op:#x}) not forwarded");
                Response::Error(Errno::ENOSYS)
            } else {
                let lock = flock_from_wire(&arg.lk);
                empty_or_error(fs.setlk(&req, nodeid, &fi, &lock, sleep))
            }
        }

        Operation::Bmap { block, blocksize } => match fs.bmap(&req, nodeid, blocksize, block) {
            Ok(block) => Response::bmap(block),
            Err(err) => Response::Error(err),
        },

        Operation::Ioctl { arg, in_data } => {
            let flags = IoctlFlags::from_bits_truncate(arg.flags);
            if flags.contains(IoctlFlags::DIR) && !req.conn.want.contains(InitFlags::IOCTL_DIR) {
                Response::Error(Errno::ENOSYS)
            } else {
                let fi = FileInfo {
                    fh: arg.fh,
                    ..FileInfo::default()
                };
                let in_data = &in_data[..in_data.len().min(arg.in_size as usize)];
                match fs.ioctl(&req, nodeid, arg.cmd, arg.arg, &fi, in_data, arg.out_size) {
                    Ok(reply) => Response::ioctl(&reply),
                    Err(err) => Response::Error(err),
                }
            }
        }

        Operation::Poll { arg } => {
            let fi = FileInfo {
                fh: arg.fh,
                poll_events: arg.events,
                ..FileInfo::default()
            };
            let ph = (arg.flags & FUSE_POLL_SCHEDULE_NOTIFY != 0).then_some(PollHandle { kh: arg.kh });
            match fs.poll(&req, nodeid, &fi, ph) {
                Ok(revents) => Response::poll(revents),
                Err(err) => Response::Error(err),
            }
        }

        Operation::Fallocate { arg } => {
            let fi = FileInfo {
                fh: arg.fh,
                ..FileInfo::default()
            };
            empty_or_error(fs.fallocate(&req, nodeid, arg.mode, arg.offset, arg.length, &fi))
        }

        Operation::Unsupported(opcode) => {
            warn!("unsupported opcode {opcode}");
            Response::Error(Errno::ENOSYS)
        }
    };

    Some(response.into_vec(header.unique))
}

fn empty_or_error(result: Result<(), Errno>) -> Response {
    match result {
        Ok(()) => Response::Empty,
        Err(err) => Response::Error(err),
    }
}

/// The two-phase xattr size probe: a zero-size request learns the value
/// length, a sized request fetches the value itself.
fn xattr_response(size: u32, value: &[u8]) -> Response {
    if size == 0 {
        Response::xattr_size(value.len() as u32)
    } else {
        Response::xattr_value(value)
    }
}

fn fopen_flags(fi: &FileInfo) -> FopenFlags {
    let mut flags = FopenFlags::empty();
    if fi.direct_io {
        flags |= FopenFlags::DIRECT_IO;
    }
    if fi.keep_cache {
        flags |= FopenFlags::KEEP_CACHE;
    }
    if fi.nonseekable {
        flags |= FopenFlags::NONSEEKABLE;
    }
    flags
}

fn do_init<FS: Filesystem>(
    shared: &SessionShared<FS>,
    req: &Request,
    arg: &abi::fuse_init_in,
) -> Response {
    debug!(
        "INIT: kernel {}.{}, max_readahead {}, flags {:#x}",
        arg.major, arg.minor, arg.max_readahead, arg.flags
    );

    let mut conn = *shared.conn.read();
    conn.major = arg.major;
    conn.minor = arg.minor;
    conn.max_readahead = arg.max_readahead;

    let mut bufsize = shared.bufsize;
    if bufsize < abi::FUSE_MIN_READ_BUFFER {
        warn!("buffer size too small: {bufsize}");
        bufsize = abi::FUSE_MIN_READ_BUFFER;
    }
    bufsize -= abi::BUFFER_HEADER_SIZE;
    if (bufsize as u32) < conn.max_write {
        conn.max_write = bufsize as u32;
    }

    conn.capable = InitFlags::from_bits_truncate(arg.flags);
    let mut want = InitFlags::DEFAULT_WANT;
    if shared
        .handlers
        .contains(HandlerSet::GETLK | HandlerSet::SETLK)
    {
        want |= InitFlags::POSIX_LOCKS;
    }
    if shared.handlers.contains(HandlerSet::READDIRPLUS) {
        want |= InitFlags::READDIRPLUS | InitFlags::READDIRPLUS_AUTO;
    }
    conn.want = want & conn.capable;

    let out = abi::fuse_init_out {
        major: abi::FUSE_KERNEL_VERSION,
        minor: abi::FUSE_KERNEL_MINOR_VERSION,
        max_readahead: conn.max_readahead,
        flags: conn.want.bits(),
        max_background: conn.max_background,
        congestion_threshold: conn.congestion_threshold,
        max_write: conn.max_write,
        time_gran: conn.time_gran,
        unused: [0; 9],
    };
    *shared.conn.write() = conn;
    shared.set_state(SessionState::Ready);
    debug!(
        "INIT response: ABI {}.{}, flags {:#x}, max_write {}",
        out.major, out.minor, out.flags, out.max_write
    );

    // the init hook sees the negotiated parameters, not the snapshot
    // taken before the exchange
    let req = Request { conn, ..*req };
    if let Some(userdata) = shared.fs.init(&req, &conn) {
        *shared.userdata.lock() = Some(userdata);
    }

    Response::init(&out)
}

fn setattr_from_wire(arg: &abi::fuse_setattr_in) -> SetAttr {
    let valid = SetattrValid::from_bits_truncate(arg.valid);
    let atime = if valid.contains(SetattrValid::ATIME_NOW) {
        Some(TimeOrNow::Now)
    } else if valid.contains(SetattrValid::ATIME) {
        Some(TimeOrNow::SpecificTime(system_time_from_parts(
            arg.atime,
            arg.atimensec,
        )))
    } else {
        None
    };
    let mtime = if valid.contains(SetattrValid::MTIME_NOW) {
        Some(TimeOrNow::Now)
    } else if valid.contains(SetattrValid::MTIME) {
        Some(TimeOrNow::SpecificTime(system_time_from_parts(
            arg.mtime,
            arg.mtimensec,
        )))
    } else {
        None
    };
    SetAttr {
        valid,
        mode: valid.contains(SetattrValid::MODE).then_some(arg.mode),
        uid: valid.contains(SetattrValid::UID).then_some(arg.uid),
        gid: valid.contains(SetattrValid::GID).then_some(arg.gid),
        size: valid.contains(SetattrValid::SIZE).then_some(arg.size),
        atime,
        mtime,
        ctime: valid
            .contains(SetattrValid::CTIME)
            .then(|| system_time_from_parts(arg.ctime, arg.ctimensec)),
        fh: valid.contains(SetattrValid::FH).then_some(arg.fh),
        lock_owner: valid
            .contains(SetattrValid::LOCKOWNER)
            .then_some(arg.lock_owner),
    }
}

fn system_time_from_parts(secs: i64, nsecs: u32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), nsecs)
    }
}

fn flock_from_wire(lk: &abi::fuse_file_lock) -> Flock {
    Flock {
        typ: lk.typ,
        whence: libc::SEEK_SET,
        start: lk.start as i64,
        len: if lk.end == abi::OFFSET_MAX {
            0
        } else {
            (lk.end - lk.start + 1) as i64
        },
        pid: lk.pid,
    }
}

fn flock_to_wire(lock: &Flock) -> abi::fuse_file_lock {
    let mut lk = abi::fuse_file_lock {
        start: 0,
        end: 0,
        typ: lock.typ,
        pid: lock.pid,
    };
    if lock.typ != libc::F_UNLCK {
        lk.start = lock.start as u64;
        lk.end = if lock.len == 0 {
            abi::OFFSET_MAX
        } else {
            (lock.start + lock.len - 1) as u64
        };
    }
    lk
}
