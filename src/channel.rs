//! Raw I/O on the mount device.
//!
//! The device transfers one protocol frame per syscall in both
//! directions, so a read always yields a whole request and a write must
//! hand over a whole reply. The fd is obtained by an external mount
//! helper and attached via `Session::set_dev`; this module never opens
//! the device itself.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use log::warn;
use nix::unistd;

/// What a read attempt on the device produced.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// One whole request frame of the given length is in the buffer.
    Frame(usize),
    /// Transient condition (EINTR/EAGAIN/ENOENT); try again later.
    Retry,
    /// The mount is being torn down (ENODEV); exit cleanly.
    Unmounted,
}

#[derive(Debug)]
pub(crate) struct DeviceChannel {
    fd: OwnedFd,
}

impl DeviceChannel {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        DeviceChannel { fd }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// One read syscall; the kernel emits exactly one request per read.
    pub(crate) fn receive(&self, buffer: &mut [u8]) -> io::Result<ReadOutcome> {
        match unistd::read(self.fd.as_fd(), buffer) {
            Ok(n) => Ok(ReadOutcome::Frame(n)),
            // ENOENT: the operation was interrupted; safe to retry
            Err(nix::errno::Errno::ENOENT)
            | Err(nix::errno::Errno::EINTR)
            | Err(nix::errno::Errno::EAGAIN) => Ok(ReadOutcome::Retry),
            // ENODEV: the filesystem was unmounted
            Err(nix::errno::Errno::ENODEV) => Ok(ReadOutcome::Unmounted),
            Err(err) => Err(err.into()),
        }
    }

    /// One write syscall carrying a whole reply frame.
    pub(crate) fn send(&self, frame: &[u8]) -> io::Result<()> {
        let written = unistd::write(self.fd.as_fd(), frame)?;
        if written != frame.len() {
            warn!(
                "short write to fuse device: {written} of {} bytes",
                frame.len()
            );
        }
        Ok(())
    }
}
