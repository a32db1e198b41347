//! Combiner-serialised asynchronous I/O.
//!
//! Combio is an event loop for sockets, devices and timers built around
//! two ideas:
//!
//! * a pluggable readiness multiplexer (epoll by default on Linux, with a
//!   portable `poll(2)` fallback) behind one interface, armed one-shot and
//!   re-armed only when an object's queues want it;
//! * a *combiner* per I/O object: a single 64-bit atomic word both counts
//!   pending intents and elects the one thread that may touch the object's
//!   queues. Posting work from any thread is a `fetch_add` plus, at most,
//!   a spinlock-guarded list push; whoever moves the word off zero drains
//!   everything, so per-object state needs no mutex at all.
//!
//! Operations complete through callbacks, with a bounded synchronous fast
//! path: an operation that can finish immediately may invoke its callback
//! inline, up to 32 times per loop iteration per thread, after which
//! completions are parked on a per-thread finish queue and delivered by
//! the loop. Blocking-style variants (`co_read` and friends) suspend a
//! stackful [`coro::Coroutine`] instead of taking a callback.
//!
//! # Example
//!
//! An asynchronous UDP receiver:
//!
//! ```no_run
//! use std::net::SocketAddrV4;
//! use combio::{sock, EventLoop, Flags, Method};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new(Method::OsDefault)?;
//!
//!     let fd = sock::socket_udp()?;
//!     let addr: SocketAddrV4 = "127.0.0.1:9000".parse().unwrap();
//!     sock::socket_bind(fd, &addr.into())?;
//!     let server = event_loop.socket_io(fd)?;
//!
//!     let mut buf = vec![0u8; 1500];
//!     unsafe {
//!         server.read_msg(&mut buf, Flags::NONE, 0, |completion| {
//!             println!("{} bytes from {:?}", completion.bytes, completion.peer);
//!         });
//!     }
//!
//!     event_loop.run();
//!     Ok(())
//! }
//! ```

#![cfg(unix)]

#[macro_use]
mod macros;

mod aio;
mod base;
mod combiner;
mod context;
mod flags;
mod object;
mod op;
mod pool;
mod status;
mod sys;
mod tag;
mod timeout;

pub mod coro;
pub mod sock;

pub use base::{EventLoop, Method, UserEvent};
pub use flags::Flags;
pub use object::AioObject;
pub use op::Completion;
pub use sock::HostAddress;
pub use status::Status;
