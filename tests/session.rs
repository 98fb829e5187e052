//! End-to-end pipeline tests over a socketpair standing in for the
//! mount device. Datagram sockets preserve message boundaries, matching
//! the one-frame-per-syscall contract of the real device.

use std::ffi::OsStr;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use fusebridge::{Errno, FileAttr, FileStat, FileType, Filesystem, Request, Session};

const INIT: u32 = 26;
const LOOKUP: u32 = 1;

fn frame(opcode: u32, unique: u64, nodeid: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40 + payload.len());
    buf.extend_from_slice(&((40 + payload.len()) as u32).to_le_bytes());
    buf.extend_from_slice(&opcode.to_le_bytes());
    buf.extend_from_slice(&unique.to_le_bytes());
    buf.extend_from_slice(&nodeid.to_le_bytes());
    buf.extend_from_slice(&501u32.to_le_bytes());
    buf.extend_from_slice(&20u32.to_le_bytes());
    buf.extend_from_slice(&4242u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn init_frame(unique: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    for word in [7u32, 28, 131072, 0x003f_ffff] {
        payload.extend_from_slice(&word.to_le_bytes());
    }
    frame(INIT, unique, 0, &payload)
}

fn reply_len(reply: &[u8]) -> u32 {
    u32::from_le_bytes(reply[0..4].try_into().unwrap())
}

fn reply_error(reply: &[u8]) -> i32 {
    i32::from_le_bytes(reply[4..8].try_into().unwrap())
}

fn reply_unique(reply: &[u8]) -> u64 {
    u64::from_le_bytes(reply[8..16].try_into().unwrap())
}

fn recv_reply(kernel: &UnixDatagram) -> Vec<u8> {
    let mut buf = vec![0u8; 64 * 1024];
    let n = kernel.recv(&mut buf).expect("expected a reply frame");
    buf.truncate(n);
    assert_eq!(reply_len(&buf) as usize, buf.len());
    buf
}

fn hello_stat() -> FileStat {
    FileStat {
        nodeid: 2,
        generation: 0,
        attr: FileAttr {
            ino: 2,
            size: 13,
            blocks: 1,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o444,
            nlink: 1,
            uid: 501,
            gid: 20,
            rdev: 0,
            blksize: 4096,
        },
    }
}

struct HelloFs;

impl Filesystem for HelloFs {
    fn lookup(&self, _req: &Request, parent: u64, name: &OsStr) -> Result<FileStat, Errno> {
        if parent == 1 && name == "hello" {
            Ok(hello_stat())
        } else {
            Err(Errno::ENOENT)
        }
    }
}

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

/// Blocks every lookup on a gate the test opens explicitly.
struct BlockingFs {
    gate: Arc<Gate>,
    entered: Arc<AtomicUsize>,
}

impl Filesystem for BlockingFs {
    fn lookup(&self, _req: &Request, _parent: u64, _name: &OsStr) -> Result<FileStat, Errno> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate.wait();
        Ok(hello_stat())
    }
}

fn start<FS: Filesystem>(
    fs: FS,
    max_concurrent: usize,
) -> (Arc<Session<FS>>, UnixDatagram, thread::JoinHandle<std::io::Result<()>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (kernel, device) = UnixDatagram::pair().expect("socketpair");
    kernel
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let session = Arc::new(Session::new("/tmp/fusebridge-test", fs, max_concurrent));
    session.set_dev(OwnedFd::from(device));
    let runner = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.run())
    };
    (session, kernel, runner)
}

#[test]
fn init_handshake_then_lookup() {
    let (session, kernel, runner) = start(HelloFs, 4);

    kernel.send(&init_frame(1)).unwrap();
    let reply = recv_reply(&kernel);
    assert_eq!(reply.len(), 16 + 64);
    assert_eq!(reply_error(&reply), 0);
    assert_eq!(reply_unique(&reply), 1);
    let body = &reply[16..];
    let major = u32::from_le_bytes(body[0..4].try_into().unwrap());
    let minor = u32::from_le_bytes(body[4..8].try_into().unwrap());
    let flags = u32::from_le_bytes(body[12..16].try_into().unwrap());
    assert_eq!(major, 7);
    assert_eq!(minor, 26);
    // everything granted was offered
    assert_eq!(flags & 0x003f_ffff, flags);

    kernel.send(&frame(LOOKUP, 2, 1, b"hello\0")).unwrap();
    let reply = recv_reply(&kernel);
    assert_eq!(reply_error(&reply), 0);
    assert_eq!(reply_unique(&reply), 2);
    let body = &reply[16..];
    assert_eq!(body.len(), 128);
    let nodeid = u64::from_le_bytes(body[0..8].try_into().unwrap());
    assert_eq!(nodeid, 2);
    // attr.mode sits 60 bytes into the attr, which starts at entry offset 40
    let mode = u32::from_le_bytes(body[40 + 60..40 + 64].try_into().unwrap());
    assert_eq!(mode, libc_mode());

    kernel.send(&frame(LOOKUP, 3, 1, b"missing\0")).unwrap();
    let reply = recv_reply(&kernel);
    assert_eq!(reply.len(), 16);
    assert_eq!(reply_error(&reply), -2);
    assert_eq!(reply_unique(&reply), 3);

    session.close();
    runner.join().expect("run thread").expect("clean shutdown");
}

fn libc_mode() -> u32 {
    0o100000 | 0o444 // S_IFREG | r--r--r--
}

#[test]
fn replies_arrive_for_concurrent_requests() {
    let (session, kernel, runner) = start(HelloFs, 8);
    kernel.send(&init_frame(1)).unwrap();
    recv_reply(&kernel);

    for unique in 10..18u64 {
        kernel.send(&frame(LOOKUP, unique, 1, b"hello\0")).unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..8 {
        let reply = recv_reply(&kernel);
        assert_eq!(reply_error(&reply), 0);
        seen.push(reply_unique(&reply));
    }
    seen.sort_unstable();
    assert_eq!(seen, (10..18u64).collect::<Vec<_>>());

    session.close();
    runner.join().expect("run thread").expect("clean shutdown");
}

#[test]
fn close_under_load_drops_pending_replies() {
    let gate = Arc::new(Gate::default());
    let entered = Arc::new(AtomicUsize::new(0));
    let fs = BlockingFs {
        gate: Arc::clone(&gate),
        entered: Arc::clone(&entered),
    };
    let (session, kernel, runner) = start(fs, 16);

    kernel.send(&init_frame(1)).unwrap();
    recv_reply(&kernel);

    for unique in 100..116u64 {
        kernel.send(&frame(LOOKUP, unique, 1, b"hello\0")).unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(3);
    while entered.load(Ordering::SeqCst) < 16 {
        assert!(Instant::now() < deadline, "workers never picked up load");
        thread::sleep(Duration::from_millis(5));
    }

    session.close();

    // nothing may reach the device after close, even once the blocked
    // handlers finish
    kernel
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(kernel.recv(&mut [0u8; 1024]).is_err());

    gate.release();
    let start = Instant::now();
    runner.join().expect("run thread").expect("clean shutdown");
    // the reader observes the close within one event-loop tick
    assert!(start.elapsed() < Duration::from_secs(2));

    assert!(kernel.recv(&mut [0u8; 1024]).is_err());
}

#[test]
fn run_without_device_fails() {
    let session = Session::new("/tmp/never-mounted", HelloFs, 1);
    assert!(session.run().is_err());
}
