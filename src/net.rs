//! Low-level TCP socket plumbing shared by the acceptor and connections.

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// An owned non-blocking TCP socket.
///
/// Thin wrapper over the fd that carries the option setters the server
/// stack needs. The fd is closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec IPv4 stream socket.
    pub fn new_nonblocking() -> io::Result<Socket> {
        let fd = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        // SAFETY: `socket(2)` returned a fresh, valid fd.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Wraps an already-open fd, taking ownership.
    ///
    /// # Safety
    ///
    /// `fd` must be a valid open socket not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Binds to `addr`.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (raw_addr, raw_addr_len) = socket_addr(&addr);
        syscall!(bind(self.fd.as_raw_fd(), raw_addr.as_ptr(), raw_addr_len)).map(|_| ())
    }

    /// Starts listening with a backlog of 1024.
    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), 1024)).map(|_| ())
    }

    /// Accepts one pending connection; the returned socket is non-blocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` returned a fresh fd and filled `storage`.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((socket, addr))
    }

    /// Half-closes the write side.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd.as_raw_fd(), libc::SHUT_WR)).map(|_| ())
    }

    /// Sets `SO_REUSEADDR`.
    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    /// Sets `SO_REUSEPORT`.
    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    /// Sets `SO_KEEPALIVE`.
    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    /// Sets `TCP_NODELAY`.
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_bool_option(&self, level: libc::c_int, option: libc::c_int, on: bool) -> io::Result<()> {
        let val: libc::c_int = i32::from(on);
        syscall!(setsockopt(
            self.fd.as_raw_fd(),
            level,
            option,
            &val as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    /// Takes the pending socket error (`SO_ERROR`), if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut val: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))?;
        if val == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(val)))
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Raw `sockaddr` storage for either address family.
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const SocketAddrCRepr as *const libc::sockaddr
    }
}

/// Converts a `SocketAddr` into its C representation. The std types make
/// no layout guarantees, so the fields are copied explicitly.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    // `octets` is already in network order.
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sin },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sin6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Reads a `SocketAddr` out of kernel-filled `sockaddr_storage`.
///
/// # Safety
///
/// `storage` must point at storage initialised by the kernel for an
/// `AF_INET` or `AF_INET6` socket.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Single non-blocking `write(2)`, used for the direct-send fast path.
pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(
        fd,
        data.as_ptr() as *const libc::c_void,
        data.len(),
    ))?;
    Ok(n as usize)
}
