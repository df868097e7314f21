use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

/// Cross-thread wakeup backed by `eventfd(2)`.
///
/// The eventfd is a 64-bit counter. A wake writes an 8-byte increment,
/// which makes the fd readable and unblocks the owning loop's wait; the
/// loop's read handler drains the counter with an 8-byte read. Short
/// transfers are logged, never fatal.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a fresh, valid fd.
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn wake(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )) {
            Ok(8) => {}
            Ok(n) => error!("wakeup write transferred {} bytes instead of 8", n),
            Err(err) => error!("wakeup write failed: {}", err),
        }
    }

    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(8) => {}
            Ok(n) => error!("wakeup read transferred {} bytes instead of 8", n),
            Err(err) => error!("wakeup read failed: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
