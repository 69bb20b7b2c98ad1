//! Raw non-blocking socket primitives shared by the SOCKS engine, the
//! management plane, and the origin-connect path. Kept as free functions
//! over `RawFd` rather than a `TcpStream` wrapper, since both the engine and
//! the selector already work in terms of bare descriptors.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use libc::{c_void, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};

/// Creates, binds and listens on `addr`. The returned fd is non-blocking.
pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const c_void,
            mem::size_of::<libc::c_int>() as socklen_t,
        );
    }

    let bind_ret = match addr {
        SocketAddr::V4(v4) => {
            let sa = sockaddr_in_from(v4);
            unsafe { libc::bind(fd, &sa as *const sockaddr_in as *const sockaddr, mem::size_of::<sockaddr_in>() as socklen_t) }
        }
        SocketAddr::V6(v6) => {
            let sa = sockaddr_in6_from(v6);
            unsafe {
                libc::bind(
                    fd,
                    &sa as *const sockaddr_in6 as *const sockaddr,
                    mem::size_of::<sockaddr_in6>() as socklen_t,
                )
            }
        }
    };
    if bind_ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if unsafe { libc::listen(fd, backlog) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

/// Accepts one connection. `Ok(None)` means no pending connection
/// (`EAGAIN`/`EWOULDBLOCK`); any other error is returned as-is.
pub fn accept(fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let client = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut sockaddr_storage as *mut sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if client < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    Ok(Some((client, sockaddr_storage_to_socketaddr(&storage))))
}

/// `Ok(None)` means `EAGAIN`/`EWOULDBLOCK`; `Ok(Some(0))` means EOF.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(ret as usize))
}

/// `Ok(None)` means `EAGAIN`/`EWOULDBLOCK`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(ret as usize))
}

pub fn shutdown(fd: RawFd, how: libc::c_int) {
    unsafe {
        let _ = libc::shutdown(fd, how);
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        let _ = libc::close(fd);
    }
}

fn sockaddr_in_from(v4: SocketAddrV4) -> sockaddr_in {
    let mut sa: sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = v4.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
    sa
}

fn sockaddr_in6_from(v6: SocketAddrV6) -> sockaddr_in6 {
    let mut sa: sockaddr_in6 = unsafe { mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = v6.port().to_be();
    sa.sin6_addr.s6_addr = v6.ip().octets();
    sa
}

fn sockaddr_storage_to_socketaddr(storage: &sockaddr_storage) -> SocketAddr {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sa: sockaddr_in = unsafe { mem::transmute_copy(storage) };
            let ip = Ipv4Addr::from(u32::from_ne_bytes(sa.sin_addr.s_addr.to_ne_bytes()));
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa: sockaddr_in6 = unsafe { mem::transmute_copy(storage) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(sa.sin6_port), 0, 0))
        }
        _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    }
}
