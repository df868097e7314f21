use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use rand::RngCore;

use evio::{EventLoop, ServerOption, TcpServer};

mod util;

use util::{any_local_address, init};

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_then_server_half_close() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &event_loop,
        any_local_address(),
        "echo",
        ServerOption::default(),
    )
    .unwrap();
    server.set_thread_num(3);
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
        stream.write_all(b"hello\n").unwrap();

        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"hello\n");

        drop(stream);
        wait_for("connection teardown", || downs.load(Ordering::Acquire) == 1);
        thread::sleep(Duration::from_millis(50));
        quit_loop.quit();
    });

    event_loop.run();
    client.join().unwrap();
    assert_eq!(server.name(), "echo");
}

#[test]
fn streaming_echo_preserves_byte_order() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &event_loop,
        any_local_address(),
        "stream-echo",
        ServerOption::default(),
    )
    .unwrap();
    server.set_thread_num(2);
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        // Byte-exact echo; the payload is not UTF-8.
        let data = buf.peek().to_vec();
        buf.retrieve(data.len());
        conn.send(&data);
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

    let mut payload = vec![0u8; 1 << 20];
    rand::rng().fill_bytes(&mut payload);

    let quit_loop = event_loop.clone();
    let expected = payload.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut read_half = stream.try_clone().unwrap();

        // Read back exactly as much as will be sent, concurrently with the
        // writes, so neither window ever fills up for good.
        let total = expected.len();
        let reader = thread::spawn(move || {
            let mut echoed = vec![0u8; total];
            read_half.read_exact(&mut echoed).unwrap();
            echoed
        });

        for chunk in expected.chunks(8 * 1024) {
            stream.write_all(chunk).unwrap();
        }

        let echoed = reader.join().unwrap();
        assert_eq!(echoed, expected);

        stream.shutdown(Shutdown::Write).unwrap();
        drop(stream);
        wait_for("connection teardown", || downs.load(Ordering::Acquire) == 1);
        thread::sleep(Duration::from_millis(50));
        quit_loop.quit();
    });

    event_loop.run();
    client.join().unwrap();
}

#[test]
fn connection_lifecycle_stays_on_one_io_loop() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &event_loop,
        any_local_address(),
        "affinity",
        ServerOption::default(),
    )
    .unwrap();
    server.set_thread_num(2);

    // name -> thread ids observed at UP and DOWN.
    let sightings: Arc<Mutex<HashMap<String, Vec<ThreadId>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let record = sightings.clone();
    let downs = Arc::new(AtomicUsize::new(0));
    let down_count = downs.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        record
            .lock()
            .unwrap()
            .entry(conn.name().to_string())
            .or_default()
            .push(thread::current().id());
        if conn.disconnected() {
            down_count.fetch_add(1, Ordering::AcqRel);
        }
    }));
    server.start();
    let addr = server.listen_addr().unwrap();

    let quit_loop = event_loop.clone();
    let client = thread::spawn(move || {
        // Three sequential connections across two I/O loops: the third
        // wraps around to the first loop.
        for _ in 0..3 {
            let stream = TcpStream::connect(addr).unwrap();
            stream.shutdown(Shutdown::Both).unwrap();
            drop(stream);
        }
        wait_for("all teardowns", || downs.load(Ordering::Acquire) == 3);
        thread::sleep(Duration::from_millis(50));
        quit_loop.quit();
    });

    event_loop.run();
    client.join().unwrap();

    let sightings = sightings.lock().unwrap();
    assert_eq!(sightings.len(), 3);
    let main_tid = thread::current().id();
    for (name, tids) in sightings.iter() {
        assert_eq!(tids.len(), 2, "connection {} saw {:?}", name, tids);
        assert_eq!(tids[0], tids[1], "connection {} hopped threads", name);
        assert_ne!(tids[0], main_tid);
    }

    // Connection names carry the listen endpoint and a monotonic id.
    for seq in 1..=3 {
        let expected = format!("affinity-{}#{}", server.ip_port(), seq);
        assert!(
            sightings.contains_key(&expected),
            "missing connection {}; have {:?}",
            expected,
            sightings.keys().collect::<Vec<_>>()
        );
    }

    // Two loops, three connections: exactly two distinct I/O threads, and
    // the round-robin pairs the first and third connection.
    let tid_of = |seq: usize| sightings[&format!("affinity-{}#{}", server.ip_port(), seq)][0];
    assert_eq!(tid_of(1), tid_of(3));
    assert_ne!(tid_of(1), tid_of(2));
}

#[test]
fn start_is_idempotent() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &event_loop,
        any_local_address(),
        "restart",
        ServerOption::ReusePort,
    )
    .unwrap();
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
    server.start();
    server.start();
    let addr = server.listen_addr().unwrap();

    let quit_loop = event_loop.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"still here").unwrap();
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"still here");

        drop(stream);
        wait_for("connection teardown", || downs.load(Ordering::Acquire) == 1);
        thread::sleep(Duration::from_millis(50));
        quit_loop.quit();
    });

    event_loop.run();
    client.join().unwrap();
}

#[test]
fn write_complete_fires_after_echo() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &event_loop,
        any_local_address(),
        "write-complete",
        ServerOption::default(),
    )
    .unwrap();
    server.set_thread_num(1);
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));
    let completions = Arc::new(AtomicUsize::new(0));
    let completion_count = completions.clone();
    server.set_write_complete_callback(Arc::new(move |_conn| {
        completion_count.fetch_add(1, Ordering::AcqRel);
    }));
    server.start();
    let addr = server.listen_addr().unwrap();

    let quit_loop = event_loop.clone();
    let fired = completions.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");

        wait_for("write completion", || fired.load(Ordering::Acquire) >= 1);
        quit_loop.quit();
    });

    event_loop.run();
    client.join().unwrap();
}

#[test]
fn thread_init_callback_runs_per_io_loop() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(
        &event_loop,
        any_local_address(),
        "thread-init",
        ServerOption::default(),
    )
    .unwrap();
    server.set_thread_num(3);

    let inits = Arc::new(AtomicUsize::new(0));
    let init_count = inits.clone();
    server.set_thread_init_callback(Arc::new(move |event_loop| {
        assert!(event_loop.is_in_loop_thread());
        init_count.fetch_add(1, Ordering::AcqRel);
    }));
    server.start();

    assert_eq!(inits.load(Ordering::Acquire), 3);

    let quit_loop = event_loop.clone();
    thread::spawn(move || quit_loop.quit());
    event_loop.run();
}
