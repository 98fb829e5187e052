//! Typed decoding of request payloads.
//!
//! One [`Operation`] variant per opcode the dispatcher services. String
//! and data arguments borrow from the payload buffer; fixed records are
//! copied out so the buffer needs no alignment.

use std::ffi::OsStr;

use crate::handler::ForgetOne;
use crate::ll::argument::{ArgumentIterator, DecodeError};
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::Opcode;

/// A request payload decoded against its opcode.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Lookup {
        name: &'a OsStr,
    },
    Forget {
        nlookup: u64,
    },
    Getattr {
        arg: abi::fuse_getattr_in,
    },
    Setattr {
        arg: abi::fuse_setattr_in,
    },
    Readlink,
    Symlink {
        name: &'a OsStr,
        target: &'a OsStr,
    },
    Mknod {
        arg: abi::fuse_mknod_in,
        name: &'a OsStr,
    },
    Mkdir {
        arg: abi::fuse_mkdir_in,
        name: &'a OsStr,
    },
    Unlink {
        name: &'a OsStr,
    },
    Rmdir {
        name: &'a OsStr,
    },
    Rename {
        newdir: u64,
        flags: u32,
        name: &'a OsStr,
        newname: &'a OsStr,
    },
    Link {
        oldnodeid: u64,
        newname: &'a OsStr,
    },
    Open {
        flags: i32,
    },
    Read {
        arg: abi::fuse_read_in,
    },
    Write {
        arg: abi::fuse_write_in,
        data: &'a [u8],
    },
    Flush {
        arg: abi::fuse_flush_in,
    },
    Release {
        arg: abi::fuse_release_in,
    },
    Fsync {
        fh: u64,
        fsync_flags: u32,
    },
    Opendir {
        flags: i32,
    },
    Readdir {
        arg: abi::fuse_read_in,
    },
    Releasedir {
        arg: abi::fuse_release_in,
    },
    Fsyncdir {
        fh: u64,
        fsync_flags: u32,
    },
    Statfs,
    Setxattr {
        flags: i32,
        name: &'a OsStr,
        value: &'a [u8],
    },
    Getxattr {
        size: u32,
        name: &'a OsStr,
    },
    Listxattr {
        size: u32,
    },
    Removexattr {
        name: &'a OsStr,
    },
    Access {
        mask: i32,
    },
    Create {
        arg: abi::fuse_create_in,
        name: &'a OsStr,
    },
    Getlk {
        arg: abi::fuse_lk_in,
    },
    Setlk {
        arg: abi::fuse_lk_in,
        sleep: bool,
    },
    Bmap {
        block: u64,
        blocksize: u32,
    },
    Ioctl {
        arg: abi::fuse_ioctl_in,
        in_data: &'a [u8],
    },
    Poll {
        arg: abi::fuse_poll_in,
    },
    Fallocate {
        arg: abi::fuse_fallocate_in,
    },
    BatchForget {
        nodes: Vec<ForgetOne>,
    },
    Interrupt {
        unique: u64,
    },
    Init {
        arg: abi::fuse_init_in,
    },
    Destroy,
    Readdirplus {
        arg: abi::fuse_read_in,
    },
    /// An opcode outside the dispatch surface; answered with `ENOSYS`.
    Unsupported(u32),
}

impl<'a> Operation<'a> {
    /// Decode `payload` according to `opcode`.
    pub(crate) fn decode(opcode: u32, payload: &'a [u8]) -> Result<Operation<'a>, DecodeError> {
        let Ok(opcode) = Opcode::try_from(opcode) else {
            return Ok(Operation::Unsupported(opcode));
        };
        let mut it = ArgumentIterator::new(payload);
        let op = match opcode {
            Opcode::Lookup => Operation::Lookup {
                name: it.fetch_str()?,
            },
            Opcode::Forget => {
                let arg: abi::fuse_forget_in = it.fetch()?;
                Operation::Forget {
                    nlookup: arg.nlookup,
                }
            }
            Opcode::Getattr => Operation::Getattr { arg: it.fetch()? },
            Opcode::Setattr => Operation::Setattr { arg: it.fetch()? },
            Opcode::Readlink => Operation::Readlink,
            Opcode::Symlink => Operation::Symlink {
                name: it.fetch_str()?,
                target: it.fetch_str()?,
            },
            Opcode::Mknod => Operation::Mknod {
                arg: it.fetch()?,
                name: it.fetch_str()?,
            },
            Opcode::Mkdir => Operation::Mkdir {
                arg: it.fetch()?,
                name: it.fetch_str()?,
            },
            Opcode::Unlink => Operation::Unlink {
                name: it.fetch_str()?,
            },
            Opcode::Rmdir => Operation::Rmdir {
                name: it.fetch_str()?,
            },
            Opcode::Rename => {
                let arg: abi::fuse_rename_in = it.fetch()?;
                Operation::Rename {
                    newdir: arg.newdir,
                    flags: 0,
                    name: it.fetch_str()?,
                    newname: it.fetch_str()?,
                }
            }
            Opcode::Rename2 => {
                let arg: abi::fuse_rename2_in = it.fetch()?;
                Operation::Rename {
                    newdir: arg.newdir,
                    flags: arg.flags,
                    name: it.fetch_str()?,
                    newname: it.fetch_str()?,
                }
            }
            Opcode::Link => {
                let arg: abi::fuse_link_in = it.fetch()?;
                Operation::Link {
                    oldnodeid: arg.oldnodeid,
                    newname: it.fetch_str()?,
                }
            }
            Opcode::Open => {
                let arg: abi::fuse_open_in = it.fetch()?;
                Operation::Open { flags: arg.flags }
            }
            Opcode::Read => Operation::Read { arg: it.fetch()? },
            Opcode::Write => {
                let arg: abi::fuse_write_in = it.fetch()?;
                Operation::Write {
                    arg,
                    data: it.fetch_all(),
                }
            }
            Opcode::Flush => Operation::Flush { arg: it.fetch()? },
            Opcode::Release => Operation::Release { arg: it.fetch()? },
            Opcode::Fsync => {
                let arg: abi::fuse_fsync_in = it.fetch()?;
                Operation::Fsync {
                    fh: arg.fh,
                    fsync_flags: arg.fsync_flags,
                }
            }
            Opcode::Opendir => {
                let arg: abi::fuse_open_in = it.fetch()?;
                Operation::Opendir { flags: arg.flags }
            }
            Opcode::Readdir => Operation::Readdir { arg: it.fetch()? },
            Opcode::Releasedir => Operation::Releasedir { arg: it.fetch()? },
            Opcode::Fsyncdir => {
                let arg: abi::fuse_fsync_in = it.fetch()?;
                Operation::Fsyncdir {
                    fh: arg.fh,
                    fsync_flags: arg.fsync_flags,
                }
            }
            Opcode::Statfs => Operation::Statfs,
            Opcode::Setxattr => {
                let arg: abi::fuse_setxattr_in = it.fetch()?;
                Operation::Setxattr {
                    flags: arg.flags,
                    name: it.fetch_str()?,
                    value: it.fetch_str()?.as_encoded_bytes(),
                }
            }
            Opcode::Getxattr => {
                let arg: abi::fuse_getxattr_in = it.fetch()?;
                Operation::Getxattr {
                    size: arg.size,
                    name: it.fetch_str()?,
                }
            }
            Opcode::Listxattr => {
                let arg: abi::fuse_getxattr_in = it.fetch()?;
                Operation::Listxattr { size: arg.size }
            }
            Opcode::Removexattr => Operation::Removexattr {
                name: it.fetch_str()?,
            },
            Opcode::Access => {
                let arg: abi::fuse_access_in = it.fetch()?;
                Operation::Access { mask: arg.mask }
            }
            Opcode::Create => Operation::Create {
                arg: it.fetch()?,
                name: it.fetch_str()?,
            },
            Opcode::Getlk => Operation::Getlk { arg: it.fetch()? },
            Opcode::Setlk => Operation::Setlk {
                arg: it.fetch()?,
                sleep: false,
            },
            Opcode::Setlkw => Operation::Setlk {
                arg: it.fetch()?,
                sleep: true,
            },
            Opcode::Bmap => {
                let arg: abi::fuse_bmap_in = it.fetch()?;
                Operation::Bmap {
                    block: arg.block,
                    blocksize: arg.blocksize,
                }
            }
            Opcode::Ioctl => {
                let arg: abi::fuse_ioctl_in = it.fetch()?;
                Operation::Ioctl {
                    arg,
                    in_data: it.fetch_all(),
                }
            }
            Opcode::Poll => Operation::Poll { arg: it.fetch()? },
            Opcode::Fallocate => Operation::Fallocate { arg: it.fetch()? },
            Opcode::BatchForget => {
                let arg: abi::fuse_batch_forget_in = it.fetch()?;
                let mut nodes = Vec::with_capacity(arg.count as usize);
                for _ in 0..arg.count {
                    let one: abi::fuse_forget_one = it.fetch()?;
                    nodes.push(ForgetOne {
                        nodeid: one.nodeid,
                        nlookup: one.nlookup,
                    });
                }
                Operation::BatchForget { nodes }
            }
            Opcode::Interrupt => {
                let arg: abi::fuse_interrupt_in = it.fetch()?;
                Operation::Interrupt { unique: arg.unique }
            }
            Opcode::Init => Operation::Init { arg: it.fetch()? },
            Opcode::Destroy => Operation::Destroy,
            Opcode::Readdirplus => Operation::Readdirplus { arg: it.fetch()? },
            Opcode::NotifyReply | Opcode::Lseek | Opcode::CuseInit => {
                Operation::Unsupported(opcode as u32)
            }
        };
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn lookup_name() {
        let op = Operation::decode(Opcode::Lookup as u32, b"hello\0").unwrap();
        match op {
            Operation::Lookup { name } => assert_eq!(name, "hello"),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn lookup_without_nul_is_rejected() {
        assert_eq!(
            Operation::decode(Opcode::Lookup as u32, b"hello").unwrap_err(),
            DecodeError::MissingNul
        );
    }

    #[test]
    fn symlink_two_names() {
        let op = Operation::decode(Opcode::Symlink as u32, b"alias\0/real/path\0").unwrap();
        match op {
            Operation::Symlink { name, target } => {
                assert_eq!(name, "alias");
                assert_eq!(target, "/real/path");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn symlink_one_name_is_short() {
        assert_eq!(
            Operation::decode(Opcode::Symlink as u32, b"alias\0").unwrap_err(),
            DecodeError::MissingNul
        );
    }

    #[test]
    fn rename_carries_both_names() {
        let mut payload = 7u64.to_le_bytes().to_vec();
        payload.extend_from_slice(b"old\0new\0");
        let op = Operation::decode(Opcode::Rename as u32, &payload).unwrap();
        match op {
            Operation::Rename {
                newdir,
                flags,
                name,
                newname,
            } => {
                assert_eq!(newdir, 7);
                assert_eq!(flags, 0);
                assert_eq!(name, "old");
                assert_eq!(newname, "new");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn rename2_keeps_flags() {
        let mut payload = 9u64.to_le_bytes().to_vec();
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(b"a\0b\0");
        match Operation::decode(Opcode::Rename2 as u32, &payload).unwrap() {
            Operation::Rename { newdir, flags, .. } => {
                assert_eq!(newdir, 9);
                assert_eq!(flags, 2);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn write_splits_fixed_part_and_data() {
        let arg = abi::fuse_write_in {
            fh: 3,
            offset: 4096,
            size: 5,
            write_flags: 1,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(b"bytes");
        match Operation::decode(Opcode::Write as u32, &payload).unwrap() {
            Operation::Write { arg, data } => {
                assert_eq!(arg.fh, 3);
                assert_eq!(arg.offset, 4096);
                assert_eq!(arg.write_flags, 1);
                assert_eq!(data, b"bytes");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn setxattr_name_and_value() {
        let arg = abi::fuse_setxattr_in { size: 2, flags: 1 };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(b"user.k\0v1\0");
        match Operation::decode(Opcode::Setxattr as u32, &payload).unwrap() {
            Operation::Setxattr { flags, name, value } => {
                assert_eq!(flags, 1);
                assert_eq!(name, "user.k");
                assert_eq!(value, b"v1");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn listxattr_has_no_name() {
        let arg = abi::fuse_getxattr_in {
            size: 64,
            padding: 0,
        };
        match Operation::decode(Opcode::Listxattr as u32, arg.as_bytes()).unwrap() {
            Operation::Listxattr { size } => assert_eq!(size, 64),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn batch_forget_unpacks_records() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        for (node, lookups) in [(5u64, 1u64), (9, 3)] {
            payload.extend_from_slice(&node.to_le_bytes());
            payload.extend_from_slice(&lookups.to_le_bytes());
        }
        match Operation::decode(Opcode::BatchForget as u32, &payload).unwrap() {
            Operation::BatchForget { nodes } => {
                assert_eq!(
                    nodes,
                    vec![
                        ForgetOne {
                            nodeid: 5,
                            nlookup: 1
                        },
                        ForgetOne {
                            nodeid: 9,
                            nlookup: 3
                        },
                    ]
                );
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn batch_forget_count_beyond_payload_is_short() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            Operation::decode(Opcode::BatchForget as u32, &payload).unwrap_err(),
            DecodeError::DataLenShort
        );
    }

    #[test]
    fn short_fixed_record_is_rejected() {
        assert_eq!(
            Operation::decode(Opcode::Read as u32, &[0u8; 12]).unwrap_err(),
            DecodeError::DataLenShort
        );
    }

    #[test]
    fn setlkw_sets_sleep() {
        let arg = abi::fuse_lk_in {
            fh: 1,
            owner: 2,
            lk: abi::fuse_file_lock {
                start: 0,
                end: 10,
                typ: libc::F_RDLCK,
                pid: 100,
            },
            lk_flags: 0,
            padding: 0,
        };
        match Operation::decode(Opcode::Setlkw as u32, arg.as_bytes()).unwrap() {
            Operation::Setlk { sleep, .. } => assert!(sleep),
            other => panic!("decoded {other:?}"),
        }
        match Operation::decode(Opcode::Setlk as u32, arg.as_bytes()).unwrap() {
            Operation::Setlk { sleep, .. } => assert!(!sleep),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_unsupported() {
        match Operation::decode(999, &[]).unwrap() {
            Operation::Unsupported(999) => {}
            other => panic!("decoded {other:?}"),
        }
        match Operation::decode(Opcode::Lseek as u32, &[0u8; 24]).unwrap() {
            Operation::Unsupported(46) => {}
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn fixed_records_reencode_to_input() {
        let arg = abi::fuse_read_in {
            fh: 11,
            offset: 22,
            size: 33,
            read_flags: 0,
            lock_owner: 44,
            flags: 0,
            padding: 0,
        };
        let payload = arg.as_bytes().to_vec();
        match Operation::decode(Opcode::Read as u32, &payload).unwrap() {
            Operation::Read { arg } => assert_eq!(arg.as_bytes(), &payload[..]),
            other => panic!("decoded {other:?}"),
        }
    }
}
