//! Raw non-blocking `connect(2)` plumbing for the address-fallback step of
//! §4.5.5. Built directly against `libc`, in the same style as
//! `selector::sys`, since the fallback needs `SO_ERROR` semantics a
//! `std::net::TcpStream` does not expose.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, sockaddr_in, sockaddr_in6, socklen_t};

pub enum ConnectResult {
    Connected,
    InProgress,
    Failed(io::Error),
}

/// Creates a non-blocking socket for `addr`'s family and starts `connect`.
/// Returns the fd regardless of outcome so the caller can close it on
/// failure; only a socket-creation failure itself yields `Err`.
pub fn create_and_connect(addr: SocketAddr) -> io::Result<(RawFd, ConnectResult)> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = match addr {
        SocketAddr::V4(v4) => {
            let mut sa: sockaddr_in = unsafe { mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            let ret = unsafe {
                libc::connect(
                    fd,
                    &sa as *const sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<sockaddr_in>() as socklen_t,
                )
            };
            connect_outcome(ret)
        }
        SocketAddr::V6(v6) => {
            let mut sa: sockaddr_in6 = unsafe { mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            let ret = unsafe {
                libc::connect(
                    fd,
                    &sa as *const sockaddr_in6 as *const libc::sockaddr,
                    mem::size_of::<sockaddr_in6>() as socklen_t,
                )
            };
            connect_outcome(ret)
        }
    };

    Ok((fd, result))
}

fn connect_outcome(ret: c_int) -> ConnectResult {
    if ret == 0 {
        return ConnectResult::Connected;
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS) {
        ConnectResult::InProgress
    } else {
        ConnectResult::Failed(err)
    }
}

/// Reads `SO_ERROR` off `fd`; `Ok(0)` means the connect succeeded.
pub fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}

pub fn close(fd: RawFd) {
    unsafe {
        let _ = libc::close(fd);
    }
}
