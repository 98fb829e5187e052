//! Readiness event loop.
//!
//! A thin single-threaded multiplexer over epoll: file descriptors are
//! registered together with a handler closure, and [`EventLoop::process`]
//! blocks up to a timeout before invoking the handler of every ready
//! descriptor exactly once. The session uses it to watch the mount device
//! with a bounded tick, so a shutdown request is observed within one tick
//! even when the kernel stays silent.

use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

/// Most events drained per wakeup.
const MAX_EVENTS: usize = 128;

/// Callback invoked for one ready descriptor. An error aborts the
/// current `process` pass and is returned to the caller.
pub(crate) type EventHandler<'h> = Box<dyn FnMut(RawFd, EpollFlags) -> io::Result<()> + 'h>;

pub(crate) struct EventLoop<'h> {
    epoll: Epoll,
    handlers: HashMap<RawFd, EventHandler<'h>>,
}

impl<'h> EventLoop<'h> {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(EventLoop {
            epoll,
            handlers: HashMap::new(),
        })
    }

    /// Watch `fd` for `interest`. Registering an already-watched fd
    /// upgrades its interest mask and replaces its handler in place.
    ///
    /// The caller keeps `fd` open for as long as it stays registered.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        interest: EpollFlags,
        handler: EventHandler<'h>,
    ) -> io::Result<()> {
        let mut event = EpollEvent::new(interest, fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if self.handlers.contains_key(&fd) {
            self.epoll.modify(borrowed, &mut event)?;
        } else {
            self.epoll.add(borrowed, event)?;
        }
        self.handlers.insert(fd, handler);
        Ok(())
    }

    /// Stop watching `fd`. Unknown descriptors are ignored.
    pub(crate) fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.handlers.remove(&fd).is_some() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.epoll.delete(borrowed)?;
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` and run the handler of each ready fd.
    /// Returns how many descriptors were serviced; an interrupted wait
    /// counts as none ready.
    pub(crate) fn process(&mut self, timeout_ms: u16) -> io::Result<usize> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let ready = match self.epoll.wait(&mut events, EpollTimeout::from(timeout_ms)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(err) => return Err(err.into()),
        };
        for event in &events[..ready] {
            let fd = event.data() as RawFd;
            if let Some(handler) = self.handlers.get_mut(&fd) {
                handler(fd, event.events())?;
            }
        }
        Ok(ready)
    }
}

impl std::fmt::Debug for EventLoop<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("fds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::write;
    use std::cell::Cell;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[test]
    fn fires_handler_once_per_ready_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut evloop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let counted = hits.clone();
        evloop
            .register(
                b.as_raw_fd(),
                EpollFlags::EPOLLIN,
                Box::new(move |_, _| {
                    counted.set(counted.get() + 1);
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(evloop.process(0).unwrap(), 0);
        write(&a, b"x").unwrap();
        assert_eq!(evloop.process(1000).unwrap(), 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn reregistration_upgrades_in_place() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut evloop = EventLoop::new().unwrap();
        evloop
            .register(b.as_raw_fd(), EpollFlags::EPOLLIN, Box::new(|_, _| Ok(())))
            .unwrap();
        // second registration must not fail with EEXIST
        evloop
            .register(
                b.as_raw_fd(),
                EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT,
                Box::new(|_, _| Ok(())),
            )
            .unwrap();
        evloop.unregister(b.as_raw_fd()).unwrap();
        evloop.unregister(b.as_raw_fd()).unwrap();
    }

    #[test]
    fn times_out_when_idle() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut evloop = EventLoop::new().unwrap();
        evloop
            .register(b.as_raw_fd(), EpollFlags::EPOLLIN, Box::new(|_, _| Ok(())))
            .unwrap();
        let start = std::time::Instant::now();
        assert_eq!(evloop.process(50).unwrap(), 0);
        assert!(start.elapsed() >= std::time::Duration::from_millis(40));
    }
}
