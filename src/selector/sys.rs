//! Thin wrapper over `epoll(7)`, adapted from the teacher's `sys::epoll`
//! backend: same `epoll_create1`/`epoll_ctl`/`epoll_wait` shape, trimmed to
//! the readable/writable/error/hup interest this crate actually uses.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::error::SelectorError;

use super::Interest;

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> Result<Epoll, SelectorError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SelectorError::Create(io::Error::last_os_error()));
        }
        Ok(Epoll { epfd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> Result<(), SelectorError> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info) };
        if ret < 0 {
            return Err(SelectorError::Ctl(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), SelectorError> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info) };
        if ret < 0 {
            return Err(SelectorError::Ctl(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> Result<(), SelectorError> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info) };
        if ret < 0 {
            return Err(SelectorError::Ctl(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> Result<(), SelectorError> {
        let timeout_ms = timeout
            .map(|d| std::cmp::min(d.as_millis(), libc::c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        let cap = events.capacity();
        let cnt = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), cap as i32, timeout_ms) };
        if cnt < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                unsafe { events.set_len(0) };
                return Ok(());
            }
            return Err(SelectorError::Wait(err));
        }
        unsafe { events.set_len(cnt as usize) };
        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind: c_int = 0;
    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    // Always watch for peer hangup/error so the engine sees a shutdown
    // half even when it only asked for one direction.
    kind |= EPOLLRDHUP | EPOLLERR | EPOLLHUP;
    kind as u32
}

// EPOLLRDHUP/EPOLLHUP/EPOLLERR are folded into the readable/writable bits
// they actually unblock, not a separate error bit: a peer FIN
// (EPOLLIN|EPOLLRDHUP) has to reach the read handler so it observes EOF via
// a 0-byte `read`, and a refused non-blocking `connect` (EPOLLOUT|EPOLLERR)
// has to reach the write handler so it can read `SO_ERROR` and drive the
// fallback loop. Folding either into `Interest::ERROR` and short-circuiting
// the dispatch there tears the connection down before either handler runs.
pub fn epoll_to_interest(raw: u32) -> Interest {
    let raw = raw as c_int;
    let mut interest = Interest::empty();
    if raw & (EPOLLIN | EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
        interest = interest | Interest::READABLE;
    }
    if raw & (EPOLLOUT | EPOLLHUP | EPOLLERR) != 0 {
        interest = interest | Interest::WRITABLE;
    }
    interest
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
