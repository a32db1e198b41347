#![cfg(unix)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use combio::{Flags, Status};

mod util;
use util::{bound_udp, new_loop, RawBuf};

fn wait_for(counter: &AtomicU32, target: u32, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if counter.load(Ordering::SeqCst) >= target {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn periodic_timer_fires_count_times_then_stops() {
    let event_loop = new_loop();
    let fired = Arc::new(AtomicU32::new(0));
    let ev = {
        let fired = Arc::clone(&fired);
        event_loop
            .user_event(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        ev.start_timer(1_000, 5);
        assert!(wait_for(&fired, 5, Duration::from_secs(5)), "timer stalled");
        // The timer disarms itself after the fifth expiry.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 5);

        ev.delete();
        event_loop.post_quit();
    });
}

#[test]
fn stop_timer_suppresses_further_ticks() {
    let event_loop = new_loop();
    let fired = Arc::new(AtomicU32::new(0));
    let ev = {
        let fired = Arc::clone(&fired);
        event_loop
            .user_event(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        // Unbounded periodic timer, stopped by hand.
        ev.start_timer(2_000, 0);
        assert!(wait_for(&fired, 3, Duration::from_secs(5)), "timer stalled");
        ev.stop_timer();
        thread::sleep(Duration::from_millis(100));
        let after_stop = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), after_stop);

        ev.delete();
        event_loop.post_quit();
    });
}

#[test]
fn manual_activation_fires_once_per_post() {
    let event_loop = new_loop();
    let fired = Arc::new(AtomicU32::new(0));
    let ev = {
        let fired = Arc::clone(&fired);
        event_loop
            .user_event(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        for _ in 0..3 {
            ev.activate();
        }
        assert!(wait_for(&fired, 3, Duration::from_secs(5)), "lost activation");
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        ev.delete();
        event_loop.post_quit();
    });
}

#[test]
fn read_times_out_through_the_sweep() {
    let event_loop = new_loop();
    let (fd, _addr) = bound_udp();
    let server = event_loop.socket_io(fd).unwrap();
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        let buf = RawBuf::leaked(64);
        unsafe {
            server.read_msg(buf.slice(), Flags::NONE, 300_000, move |completion| {
                tx.send(completion.status).unwrap();
            });
        }
        let status = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timeout never delivered");
        assert_eq!(status, Status::Timeout);

        server.delete();
        event_loop.post_quit();
    });
}

#[test]
fn realtime_timeout_uses_a_precise_timer() {
    let event_loop = new_loop();
    let (fd, _addr) = bound_udp();
    let server = event_loop.socket_io(fd).unwrap();
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| event_loop.run());

        let started = Instant::now();
        let buf = RawBuf::leaked(64);
        unsafe {
            server.read_msg(buf.slice(), Flags::REALTIME, 100_000, move |completion| {
                tx.send(completion.status).unwrap();
            });
        }
        let status = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timeout never delivered");
        assert_eq!(status, Status::Timeout);
        // Precise timers do not wait for the coarse one-second sweep.
        assert!(started.elapsed() < Duration::from_millis(900));

        server.delete();
        event_loop.post_quit();
    });
}
