//! A minimal `eventfd(2)` wrapper used as the selector's cross-thread
//! wakeup mechanism (§4.2's "notify_block"). Adapted from the teacher's
//! `sys::eventfd`, trimmed to the raw fd plumbing this crate needs: no
//! `Evented` impl (the selector talks to `epoll` directly through
//! `selector::sys`, not through the teacher's old registration trait).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// `EFD_CLOEXEC | EFD_NONBLOCK`, initial value 0.
    pub fn new() -> io::Result<EventFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventFd { fd })
    }

    /// Drains the counter, returning its value. `WouldBlock` means no
    /// writes have landed since the last read.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let ret = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u64::from_ne_bytes(buf))
    }

    /// Adds `val` to the counter, waking any waiter blocked on `epoll_wait`.
    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        let ret = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, 8) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EventFd;
    use std::io;

    #[test]
    fn write_then_read_round_trips() {
        let efd = EventFd::new().unwrap();
        efd.write(1).unwrap();
        efd.write(1).unwrap();
        assert_eq!(efd.read().unwrap(), 2);
    }

    #[test]
    fn read_with_nothing_pending_would_block() {
        let efd = EventFd::new().unwrap();
        let err = efd.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
