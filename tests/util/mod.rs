// Not all helpers are used by every test.
#![allow(dead_code)]

use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::Once;

use combio::{sock, EventLoop, HostAddress, Method};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn new_loop() -> EventLoop {
    init();
    EventLoop::new(Method::OsDefault).expect("unable to create event loop")
}

/// UDP socket bound to an ephemeral loopback port.
pub fn bound_udp() -> (RawFd, HostAddress) {
    let fd = sock::socket_udp().expect("udp socket");
    let any: SocketAddrV4 = "127.0.0.1:0".parse().unwrap();
    sock::socket_bind(fd, &any.into()).expect("bind");
    let addr = sock::socket_local_addr(fd).expect("local addr");
    (fd, addr)
}

/// TCP listener on an ephemeral loopback port.
pub fn bound_tcp_listener() -> (RawFd, HostAddress) {
    let fd = sock::socket_tcp().expect("tcp socket");
    sock::socket_reuse_addr(fd).expect("reuse addr");
    let any: SocketAddrV4 = "127.0.0.1:0".parse().unwrap();
    sock::socket_bind(fd, &any.into()).expect("bind");
    sock::socket_listen(fd).expect("listen");
    let addr = sock::socket_local_addr(fd).expect("local addr");
    (fd, addr)
}

/// Raw buffer handle tests pass into re-posting completion callbacks.
#[derive(Clone, Copy)]
pub struct RawBuf(pub *mut u8, pub usize);

unsafe impl Send for RawBuf {}

impl RawBuf {
    pub fn leaked(len: usize) -> RawBuf {
        let buf: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        RawBuf(buf.as_mut_ptr(), buf.len())
    }

    /// # Safety
    ///
    /// At most one live slice per buffer; callers serialise through the
    /// completion order of the operation the buffer is attached to.
    pub unsafe fn slice(&self) -> &'static mut [u8] {
        std::slice::from_raw_parts_mut(self.0, self.1)
    }
}
