use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use evio::{Acceptor, EventLoop};

mod util;

use util::{any_local_address, init};

#[test]
fn accepted_connections_reach_the_callback() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let acceptor = Acceptor::new(&event_loop, any_local_address(), false).unwrap();
    assert!(!acceptor.listening());

    let peers = Arc::new(Mutex::new(Vec::new()));
    let record = peers.clone();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    acceptor.set_new_connection_callback(Box::new(move |socket, peer_addr| {
        record.lock().unwrap().push(peer_addr);
        count.fetch_add(1, Ordering::AcqRel);
        // Dropping the socket closes the fd; the client sees EOF.
        drop(socket);
    }));

    acceptor.listen();
    assert!(acceptor.listening());
    let addr = acceptor.local_addr().unwrap();
    assert_ne!(addr.port(), 0);

    let quit_loop = event_loop.clone();
    let client = thread::spawn(move || {
        let mut local_ports = Vec::new();
        for _ in 0..2 {
            let mut stream = TcpStream::connect(addr).unwrap();
            local_ports.push(stream.local_addr().unwrap().port());
            let mut rest = Vec::new();
            // The acceptor drops its end right away.
            stream.read_to_end(&mut rest).unwrap();
            assert!(rest.is_empty());
        }
        quit_loop.quit();
        local_ports
    });

    event_loop.run();
    let local_ports = client.join().unwrap();

    assert_eq!(accepted.load(Ordering::Acquire), 2);
    let peers = peers.lock().unwrap();
    let seen: Vec<u16> = peers.iter().map(|p| p.port()).collect();
    assert_eq!(seen, local_ports);
    for peer in peers.iter() {
        assert!(peer.ip().is_loopback());
    }
}

#[test]
fn unset_callback_closes_accepted_connections() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let acceptor = Acceptor::new(&event_loop, any_local_address(), false).unwrap();
    acceptor.listen();
    let addr = acceptor.local_addr().unwrap();

    let quit_loop = event_loop.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        quit_loop.quit();
    });

    event_loop.run();
    client.join().unwrap();
}
