#![cfg(unix)]

use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use combio::{AioObject, EventLoop, Flags, Status};

mod util;
use util::{init, new_loop, RawBuf};

/// Connected non-blocking TCP pair registered with the loop.
fn tcp_pair(event_loop: &EventLoop) -> (AioObject, AioObject) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (peer, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    peer.set_nonblocking(true).unwrap();
    let client = event_loop.socket_io(client.into_raw_fd()).unwrap();
    let peer = event_loop.socket_io(peer.into_raw_fd()).unwrap();
    (client, peer)
}

#[test]
fn started_op_finishes_canceled_after_cancel_io() {
    init();
    let event_loop = new_loop();
    let (client, peer) = tcp_pair(&event_loop);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        let buf = RawBuf::leaked(1024);
        unsafe {
            client.read(buf.slice(), Flags::NONE, 0, move |completion| {
                tx.send(completion.status).unwrap();
            });
        }
        thread::sleep(Duration::from_millis(100));
        client.cancel_io();

        let status = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("cancel never delivered");
        assert_eq!(status, Status::Canceled);

        client.delete();
        peer.delete();
        event_loop.post_quit();
    });
}

/// Three threads cancel concurrently against two pending reads and one
/// pending write; every operation must finish exactly once, canceled.
#[test]
fn concurrent_cancel_io_from_three_threads() {
    init();
    let event_loop = new_loop();
    let (client, peer) = tcp_pair(&event_loop);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        for _ in 0..2 {
            let tx = tx.clone();
            let buf = RawBuf::leaked(1024);
            unsafe {
                client.read(buf.slice(), Flags::NONE, 0, move |completion| {
                    tx.send(completion.status).unwrap();
                });
            }
        }
        {
            // Big enough to jam both socket buffers and stay pending.
            let tx = tx.clone();
            let buf = RawBuf::leaked(64 << 20);
            unsafe {
                client.write(buf.slice(), Flags::WAIT_ALL, 0, move |completion| {
                    tx.send(completion.status).unwrap();
                });
            }
        }
        thread::sleep(Duration::from_millis(200));

        let mut cancellers = Vec::new();
        for _ in 0..3 {
            cancellers.push(s.spawn(|| client.cancel_io()));
        }
        for canceller in cancellers {
            canceller.join().unwrap();
        }

        for _ in 0..3 {
            let status = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("an operation never finished");
            assert_eq!(status, Status::Canceled);
        }

        // The object is idle again and still works.
        let (tx_after, rx_after) = mpsc::channel();
        let buf = RawBuf::leaked(1024);
        unsafe {
            client.read(buf.slice(), Flags::NONE, 200_000, move |completion| {
                tx_after.send(completion.status).unwrap();
            });
        }
        let status = rx_after
            .recv_timeout(Duration::from_secs(5))
            .expect("object wedged after cancel");
        assert_eq!(status, Status::Timeout);

        client.delete();
        peer.delete();
        event_loop.post_quit();
    });
}
