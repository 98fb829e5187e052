//! Filesystem session.
//!
//! A session runs a filesystem implementation while it is mounted at a
//! mountpoint. The mount device fd comes from an external mount helper
//! via [`Session::set_dev`]; [`Session::run`] then drives four concurrent
//! stages until unmount or [`Session::close`]:
//!
//! reader (event loop, one frame per readable wakeup)
//!   → bounded request channel
//!   → worker pool (decode, dispatch, build reply)
//!   → bounded reply channel
//!   → writer (one write syscall per reply)
//!
//! Replies may reach the kernel in any order; it correlates them with
//! requests by the `unique` token.

use std::io;
use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{error, info, warn};
use nix::sys::epoll::EpollFlags;
use parking_lot::{Mutex, RwLock};
use zerocopy::FromBytes;

use crate::channel::{DeviceChannel, ReadOutcome};
use crate::conn::{Config, ConnInfo};
use crate::dispatch;
use crate::evloop::EventLoop;
use crate::handler::{Filesystem, HandlerSet, UserData};
use crate::ll::fuse_abi as abi;

/// Pages of payload the read buffer accommodates.
const KERNEL_BUF_PAGES: usize = 32;

/// How long one event-loop wait may block. Shutdown is observed within
/// one tick even when the kernel sends nothing.
const TICK_MS: u16 = 1000;

/// Where the session stands in the protocol lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Mounted; the first frame must be INIT.
    AwaitingInit,
    /// INIT exchanged; all opcodes are unlocked.
    Ready,
    /// DESTROY received; the mount is going away.
    Draining,
}

/// State shared between the pipeline stages.
pub(crate) struct SessionShared<FS: Filesystem> {
    pub(crate) fs: FS,
    pub(crate) config: Config,
    /// Written only while INIT is processed, read-only afterwards.
    pub(crate) conn: RwLock<ConnInfo>,
    pub(crate) userdata: Mutex<Option<UserData>>,
    /// Which negotiation-relevant handlers the host declared.
    pub(crate) handlers: HandlerSet,
    /// Read buffer size: 32 pages of payload plus header room.
    pub(crate) bufsize: usize,
    state: Mutex<SessionState>,
    running: AtomicBool,
}

impl<FS: Filesystem> SessionShared<FS> {
    pub(crate) fn new(fs: FS, config: Config) -> Self {
        let handlers = fs.handlers();
        SessionShared {
            fs,
            config,
            conn: RwLock::new(ConnInfo::default()),
            userdata: Mutex::new(None),
            handlers,
            bufsize: KERNEL_BUF_PAGES * page_size::get() + abi::BUFFER_HEADER_SIZE,
            state: Mutex::new(SessionState::AwaitingInit),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// One mounted filesystem instance.
///
/// The session owns the device fd and the pipeline channels exclusively.
/// It is `Sync`; wrap it in an `Arc` to call [`Session::close`] from
/// another thread while [`Session::run`] blocks.
pub struct Session<FS: Filesystem> {
    shared: Arc<SessionShared<FS>>,
    mountpoint: String,
    max_concurrent: usize,
    dev: Mutex<Option<OwnedFd>>,
    close_signal: Mutex<Option<Sender<()>>>,
}

impl<FS: Filesystem> Session<FS> {
    /// Create a session for `filesystem`, to be served at `mountpoint`,
    /// with at most `max_concurrent` requests in flight.
    pub fn new(mountpoint: impl Into<String>, filesystem: FS, max_concurrent: usize) -> Self {
        Session::with_config(mountpoint, filesystem, max_concurrent, Config::default())
    }

    /// Like [`Session::new`] with explicit configuration.
    pub fn with_config(
        mountpoint: impl Into<String>,
        filesystem: FS,
        max_concurrent: usize,
        config: Config,
    ) -> Self {
        Session {
            shared: Arc::new(SessionShared::new(filesystem, config)),
            mountpoint: mountpoint.into(),
            max_concurrent: max_concurrent.max(1),
            dev: Mutex::new(None),
            close_signal: Mutex::new(None),
        }
    }

    /// Path this session serves.
    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    /// Snapshot of the negotiated connection parameters.
    pub fn conn_info(&self) -> ConnInfo {
        *self.shared.conn.read()
    }

    /// Session configuration.
    pub fn config(&self) -> Config {
        self.shared.config
    }

    /// Attach the already-open mount device fd obtained by the mount
    /// helper. Must happen before [`Session::run`].
    pub fn set_dev(&self, fd: OwnedFd) {
        *self.dev.lock() = Some(fd);
    }

    /// Serve the mount until it is unmounted, a fatal device error
    /// occurs, or [`Session::close`] is called.
    pub fn run(&self) -> io::Result<()> {
        let fd = self.dev.lock().take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                "no device attached; call set_dev first",
            )
        })?;
        let dev = Arc::new(DeviceChannel::new(fd));
        self.shared.running.store(true, Ordering::SeqCst);

        let (req_tx, req_rx) = bounded::<(abi::fuse_in_header, Vec<u8>)>(self.max_concurrent);
        let (rep_tx, rep_rx) = bounded::<Vec<u8>>(self.max_concurrent);
        let (close_tx, close_rx) = bounded::<()>(0);
        *self.close_signal.lock() = Some(close_tx);

        let writer = {
            let dev = Arc::clone(&dev);
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("fuse-writer".into())
                .spawn(move || writer_loop(&shared, &dev, &rep_rx))?
        };

        let mut workers = Vec::with_capacity(self.max_concurrent);
        for idx in 0..self.max_concurrent {
            let shared = Arc::clone(&self.shared);
            let req_rx = req_rx.clone();
            let rep_tx = rep_tx.clone();
            let close_rx = close_rx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("fuse-worker-{idx}"))
                    .spawn(move || worker_loop(&shared, &req_rx, &rep_tx, &close_rx))?,
            );
        }
        drop(req_rx);
        drop(rep_tx);
        drop(close_rx);

        let result = self.reader_loop(&dev, req_tx);

        // The request channel is closed now, so workers drain and exit;
        // the writer follows once the last reply sender is gone.
        for worker in workers {
            let _ = worker.join();
        }
        let _ = writer.join();
        self.close_signal.lock().take();
        self.shared.stop();
        result
    }

    /// Stop the session: the reader exits within one tick, workers stop
    /// enqueueing replies, the writer drains, and the device fd is
    /// released when [`Session::run`] returns. Safe to call repeatedly.
    pub fn close(&self) {
        self.shared.stop();
        self.close_signal.lock().take();
    }

    fn reader_loop(
        &self,
        dev: &Arc<DeviceChannel>,
        req_tx: Sender<(abi::fuse_in_header, Vec<u8>)>,
    ) -> io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let reader_shared = Arc::clone(&self.shared);
        let reader_dev = Arc::clone(dev);
        let mut buffer = vec![0u8; shared.bufsize.max(abi::FUSE_MIN_READ_BUFFER)];
        let fd = dev.raw_fd();

        let mut evloop = EventLoop::new()?;
        evloop.register(
            fd,
            EpollFlags::EPOLLIN,
            Box::new(move |_, _| {
                match reader_dev.receive(&mut buffer)? {
                    ReadOutcome::Retry => {}
                    ReadOutcome::Unmounted => {
                        info!("fuse device detached, shutting down");
                        reader_shared.stop();
                    }
                    ReadOutcome::Frame(len) => {
                        if len < abi::IN_HEADER_LEN {
                            warn!("dropping short frame of {len} bytes");
                            return Ok(());
                        }
                        let Ok((header, _)) = abi::fuse_in_header::read_from_prefix(&buffer[..len])
                        else {
                            return Ok(());
                        };
                        let payload = buffer[abi::IN_HEADER_LEN..len].to_vec();
                        if reader_shared.running() {
                            // Blocks when max_concurrent requests are in
                            // flight; that is the concurrency bound.
                            let _ = req_tx.send((header, payload));
                        }
                    }
                }
                Ok(())
            }),
        )?;

        let mut result = Ok(());
        while shared.running() {
            if let Err(err) = evloop.process(TICK_MS) {
                error!("fatal device error: {err}");
                shared.stop();
                result = Err(err);
            }
        }
        let _ = evloop.unregister(fd);
        result
    }
}

impl<FS: Filesystem> std::fmt::Debug for Session<FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mountpoint", &self.mountpoint)
            .field("max_concurrent", &self.max_concurrent)
            .field("running", &self.shared.running())
            .finish()
    }
}

fn worker_loop<FS: Filesystem>(
    shared: &SessionShared<FS>,
    req_rx: &Receiver<(abi::fuse_in_header, Vec<u8>)>,
    rep_tx: &Sender<Vec<u8>>,
    close_rx: &Receiver<()>,
) {
    while let Ok((header, payload)) = req_rx.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatch::handle_request(shared, &header, &payload)
        }));
        let frame = match outcome {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => {
                error!(
                    "handler panicked on opcode {} (unique {})",
                    header.opcode, header.unique
                );
                continue;
            }
        };
        // Never touch a closing session's reply channel: the close
        // signal wins over the enqueue and the reply is dropped.
        select! {
            recv(close_rx) -> _ => {}
            send(rep_tx, frame) -> res => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
}

fn writer_loop(
    shared: &SessionShared<impl Filesystem>,
    dev: &DeviceChannel,
    rep_rx: &Receiver<Vec<u8>>,
) {
    for frame in rep_rx {
        if !shared.running() {
            // Drain without touching the device once the session closed.
            continue;
        }
        if let Err(err) = dev.send(&frame) {
            error!("failed to write reply: {err}");
        }
    }
}
