#![cfg(unix)]

use std::net::{SocketAddrV4, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use combio::coro::Coroutine;
use combio::{sock, Flags, Status};

mod util;
use util::{bound_udp, new_loop};

const MESSAGE_SIZE: usize = 16;
const STACK_SIZE: usize = 256 * 1024;

fn blocking_sender(dest: SocketAddrV4, packets: u64) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let payload = [0x77_u8; MESSAGE_SIZE];
    for i in 0..packets {
        socket.send_to(&payload, dest).unwrap();
        if i % 100 == 99 {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// A coroutine receiver drains the socket in a blocking-style loop, then
/// observes a timeout once the sender stops and tears the object down.
#[test]
fn coroutine_receiver_drains_then_times_out() {
    const PACKETS: u64 = 2_000;

    let event_loop = new_loop();
    let (fd, addr) = bound_udp();
    sock::socket_recv_buffer(fd, 4 << 20).unwrap();
    let server = event_loop.socket_io(fd).unwrap();
    let (done_tx, done_rx) = mpsc::channel();

    // Coroutines belong to a loop thread, so a user event bootstraps it.
    let ev = {
        let mut entry = Some(move || {
            let mut buf = [0u8; 64];
            let mut received: u64 = 0;
            loop {
                match server.co_read_msg(&mut buf, Flags::NONE, 1_000_000) {
                    Ok((n, _peer)) => {
                        assert_eq!(n, MESSAGE_SIZE);
                        received += 1;
                    }
                    Err(Status::Timeout) => break,
                    Err(other) => panic!("unexpected status: {}", other),
                }
            }
            server.delete();
            let _ = done_tx.send(received);
        });
        event_loop
            .user_event(move || {
                if let Some(entry) = entry.take() {
                    Coroutine::new(STACK_SIZE, entry).call();
                }
            })
            .unwrap()
    };

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        ev.activate();
        blocking_sender(addr.into(), PACKETS);

        let received = done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("coroutine never finished");
        assert!(
            received * 100 >= PACKETS * 99,
            "received {} of {} packets",
            received,
            PACKETS
        );

        ev.delete();
        event_loop.post_quit();
    });
}

/// Blocking-style write and read between two coroutine-driven sockets.
#[test]
fn coroutine_datagram_round_trip() {
    let event_loop = new_loop();
    let (a_fd, a_addr) = bound_udp();
    let (b_fd, b_addr) = bound_udp();
    let a = event_loop.socket_io(a_fd).unwrap();
    let b = event_loop.socket_io(b_fd).unwrap();
    let (done_tx, done_rx) = mpsc::channel();

    let ev = {
        let mut entry = Some(move || {
            let sent = a
                .co_write_msg(b"ping pong chunk!", b_addr, Flags::NONE, 1_000_000)
                .expect("send failed");
            assert_eq!(sent, MESSAGE_SIZE);

            let mut buf = [0u8; 64];
            let (n, peer) = b
                .co_read_msg(&mut buf, Flags::NONE, 5_000_000)
                .expect("receive failed");
            assert_eq!(n, MESSAGE_SIZE);
            assert_eq!(&buf[..n], b"ping pong chunk!");
            assert_eq!(peer.port, a_addr.port);

            a.delete();
            b.delete();
            let _ = done_tx.send(());
        });
        event_loop
            .user_event(move || {
                if let Some(entry) = entry.take() {
                    Coroutine::new(STACK_SIZE, entry).call();
                }
            })
            .unwrap()
    };

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        ev.activate();
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("round trip never finished");

        ev.delete();
        event_loop.post_quit();
    });
}
