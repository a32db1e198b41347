#![cfg(unix)]

use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use combio::{sock, AioObject, EventLoop, Flags, Method, Status};
use rand::RngCore;

mod util;
use util::{bound_udp, init, new_loop, RawBuf};

const MESSAGE_SIZE: usize = 16;
const GROUP_SIZE: u64 = 100;

/// Blocking sender, paced in groups that fit the receive buffer even when
/// the receiver is starved for a while on a loaded CI machine.
fn blocking_sender(dest: SocketAddrV4, packets: u64) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut payload = [0u8; MESSAGE_SIZE];
    rand::rng().fill_bytes(&mut payload);
    for i in 0..packets {
        socket.send_to(&payload, dest).unwrap();
        if i % GROUP_SIZE == GROUP_SIZE - 1 {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Keep one receive slot armed: every successful datagram re-posts the
/// read; the trailing timeout reports the final count.
fn repost(server: AioObject, buf: RawBuf, received: Arc<AtomicU64>, done: mpsc::Sender<u64>) {
    unsafe {
        server.read_msg(buf.slice(), Flags::NONE, 1_000_000, move |completion| {
            match completion.status {
                Status::Success => {
                    assert_eq!(completion.bytes, MESSAGE_SIZE, "short datagram");
                    assert!(completion.peer.is_some());
                    received.fetch_add(1, Ordering::Relaxed);
                    repost(server, buf, received, done);
                }
                Status::Timeout => {
                    let _ = done.send(received.load(Ordering::Relaxed));
                }
                other => panic!("unexpected completion status: {}", other),
            }
        });
    }
}

fn run_loopback(event_loop: EventLoop, packets: u64) {
    let (fd, addr) = bound_udp();
    sock::socket_recv_buffer(fd, 4 << 20).unwrap();
    let server = event_loop.socket_io(fd).unwrap();

    let received = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = mpsc::channel();
    let started = Instant::now();

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        repost(server, RawBuf::leaked(2048), Arc::clone(&received), done_tx);
        blocking_sender(addr.into(), packets);

        let total = done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("receiver never drained");
        assert!(started.elapsed() > Duration::ZERO);
        assert!(
            total * 100 >= packets * 99,
            "received {} of {} packets",
            total,
            packets
        );

        server.delete();
        event_loop.post_quit();
    });
}

#[test]
fn single_sender_async_receiver() {
    run_loopback(new_loop(), 10_000);
}

#[test]
fn poll_backend_smoke() {
    init();
    let event_loop = EventLoop::new(Method::Poll).expect("poll backend");
    run_loopback(event_loop, 1_000);
}

#[test]
fn shared_socket_multiple_receivers() {
    const SENDERS: u64 = 4;
    const PER_SENDER: u64 = 2_500;
    const SLOTS: usize = 4;

    let event_loop = new_loop();
    let (fd, addr) = bound_udp();
    sock::socket_recv_buffer(fd, 4 << 20).unwrap();
    let server = event_loop.socket_io(fd).unwrap();

    let received = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| event_loop.run());
        s.spawn(|| event_loop.run());

        for _ in 0..SLOTS {
            repost(
                server,
                RawBuf::leaked(2048),
                Arc::clone(&received),
                done_tx.clone(),
            );
        }

        let mut senders = Vec::new();
        for _ in 0..SENDERS {
            senders.push(s.spawn(move || blocking_sender(addr.into(), PER_SENDER)));
        }
        for sender in senders {
            sender.join().unwrap();
        }

        // Every slot reports once its trailing read times out.
        for _ in 0..SLOTS {
            done_rx
                .recv_timeout(Duration::from_secs(30))
                .expect("receive slot never drained");
        }
        let total = received.load(Ordering::Relaxed);
        assert!(
            total * 100 >= SENDERS * PER_SENDER * 99,
            "received {} of {} packets",
            total,
            SENDERS * PER_SENDER
        );

        server.delete();
        event_loop.post_quit();
    });
}

/// Synchronous completions invoke the callback inline at most 32 times per
/// loop iteration; the rest must come back through the finish queue.
#[test]
fn synchronous_completion_budget() {
    const OPS: usize = 100;

    let event_loop = new_loop();
    let (fd, addr) = bound_udp();
    sock::socket_recv_buffer(fd, 1 << 20).unwrap();
    let server = event_loop.socket_io(fd).unwrap();

    // Pre-buffer datagrams so every read completes synchronously.
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for _ in 0..OPS {
        sender
            .send_to(&[1u8; MESSAGE_SIZE], SocketAddrV4::from(addr))
            .unwrap();
    }
    thread::sleep(Duration::from_millis(200));

    let submitting = Arc::new(AtomicBool::new(false));
    let inline = Arc::new(AtomicU32::new(0));
    let total = Arc::new(AtomicU32::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    let ev = {
        let submitting = Arc::clone(&submitting);
        let inline = Arc::clone(&inline);
        let total = Arc::clone(&total);
        let mut armed = Some(());
        event_loop
            .user_event(move || {
                if armed.take().is_none() {
                    return;
                }
                submitting.store(true, Ordering::SeqCst);
                for _ in 0..OPS {
                    let buf = RawBuf::leaked(64);
                    let submitting = Arc::clone(&submitting);
                    let inline = Arc::clone(&inline);
                    let total = Arc::clone(&total);
                    let done_tx = done_tx.clone();
                    unsafe {
                        server.read_msg(buf.slice(), Flags::NONE, 0, move |completion| {
                            assert_eq!(completion.status, Status::Success);
                            if submitting.load(Ordering::SeqCst) {
                                inline.fetch_add(1, Ordering::SeqCst);
                            }
                            if total.fetch_add(1, Ordering::SeqCst) + 1 == OPS as u32 {
                                let _ = done_tx.send(());
                            }
                        });
                    }
                }
                submitting.store(false, Ordering::SeqCst);
            })
            .unwrap()
    };

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        ev.activate();
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("not all reads completed");

        let inline = inline.load(Ordering::SeqCst);
        assert!(inline >= 1, "fast path never taken");
        assert!(inline <= 32, "budget exceeded: {} inline callbacks", inline);
        assert_eq!(total.load(Ordering::SeqCst), OPS as u32);

        server.delete();
        ev.delete();
        event_loop.post_quit();
    });
}
