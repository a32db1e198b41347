//! IPv4 addressing and raw socket helpers.
//!
//! The loop watches plain file descriptors; these helpers create them the
//! way the loop expects (non-blocking, close-on-exec) and cover the few
//! socket options the tests and examples need. Anything richer belongs to
//! the caller.

use std::io;
use std::mem;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;

/// IPv4 endpoint in wire order: `ipv4` and `port` are big-endian, exactly
/// as they travel in `sockaddr_in`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAddress {
    pub family: u16,
    pub ipv4: u32,
    pub port: u16,
}

impl HostAddress {
    pub(crate) fn to_sockaddr_in(self) -> libc::sockaddr_in {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = self.ipv4;
        addr.sin_port = self.port;
        addr
    }

    pub(crate) fn from_sockaddr_in(addr: &libc::sockaddr_in) -> HostAddress {
        HostAddress {
            family: addr.sin_family,
            ipv4: addr.sin_addr.s_addr,
            port: addr.sin_port,
        }
    }
}

impl From<SocketAddrV4> for HostAddress {
    fn from(addr: SocketAddrV4) -> HostAddress {
        HostAddress {
            family: libc::AF_INET as u16,
            ipv4: u32::from_be_bytes(addr.ip().octets()).to_be(),
            port: addr.port().to_be(),
        }
    }
}

impl From<HostAddress> for SocketAddrV4 {
    fn from(addr: HostAddress) -> SocketAddrV4 {
        SocketAddrV4::new(u32::from_be(addr.ipv4).into(), u16::from_be(addr.port))
    }
}

fn socket_create(ty: libc::c_int) -> io::Result<RawFd> {
    syscall!(socket(
        libc::AF_INET,
        ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))
}

/// Non-blocking IPv4 datagram socket.
pub fn socket_udp() -> io::Result<RawFd> {
    socket_create(libc::SOCK_DGRAM)
}

/// Non-blocking IPv4 stream socket.
pub fn socket_tcp() -> io::Result<RawFd> {
    socket_create(libc::SOCK_STREAM)
}

pub fn socket_bind(fd: RawFd, address: &HostAddress) -> io::Result<()> {
    let addr = address.to_sockaddr_in();
    syscall!(bind(
        fd,
        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
    ))
    .map(|_| ())
}

pub fn socket_listen(fd: RawFd) -> io::Result<()> {
    syscall!(listen(fd, 1024)).map(|_| ())
}

pub fn socket_reuse_addr(fd: RawFd) -> io::Result<()> {
    let enable: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &enable as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map(|_| ())
}

/// Ask for a bigger receive buffer; the kernel may clamp the value.
pub fn socket_recv_buffer(fd: RawFd, size: usize) -> io::Result<()> {
    let size = size as libc::c_int;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_RCVBUF,
        &size as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map(|_| ())
}

/// Local address after bind, mainly to recover an ephemeral port.
pub fn socket_local_addr(fd: RawFd) -> io::Result<HostAddress> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
        &mut len
    ))?;
    Ok(HostAddress::from_sockaddr_in(&addr))
}

pub fn socket_close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_address_wire_order() {
        let addr: HostAddress = "127.0.0.1:8080".parse::<SocketAddrV4>().unwrap().into();
        assert_eq!(addr.family, libc::AF_INET as u16);
        assert_eq!(u32::from_be(addr.ipv4), 0x7f00_0001);
        assert_eq!(u16::from_be(addr.port), 8080);
        let back: SocketAddrV4 = addr.into();
        assert_eq!(back, "127.0.0.1:8080".parse().unwrap());
    }
}
