//! Runs an end-to-end echo against the poll(2) backend.
//!
//! The backend override is a process-wide environment variable, so this
//! lives in its own test binary where it cannot race the epoll tests.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use evio::{EventLoop, ServerOption, TcpServer};

mod util;

use util::{any_local_address, init};

#[test]
fn echo_over_the_poll_backend() {
    std::env::set_var("MUDUO_USE_POLL", "1");
    init();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &event_loop,
        any_local_address(),
        "poll-echo",
        ServerOption::default(),
    )
    .unwrap();
    server.set_thread_num(2);
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
        conn.shutdown();
    }));
    let downs = Arc::new(AtomicUsize::new(0));
    let down_count = downs.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.disconnected() {
            down_count.fetch_add(1, Ordering::AcqRel);
        }
    }));
    server.start();
    let addr = server.listen_addr().unwrap();

    let quit_loop = event_loop.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"over poll\n").unwrap();
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"over poll\n");

        drop(stream);
        let deadline = Instant::now() + Duration::from_secs(10);
        while downs.load(Ordering::Acquire) < 1 {
            assert!(Instant::now() < deadline, "teardown never happened");
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        quit_loop.quit();
    });

    event_loop.run();
    client.join().unwrap();
}
