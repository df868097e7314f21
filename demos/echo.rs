//! A small echo server: answers each message and half-closes.
//!
//! Run with `cargo run --example echo`, then connect with
//! `nc 127.0.0.1 8000`.

use std::io;
use std::sync::Arc;

use log::info;

use evio::{EventLoop, ServerOption, TcpServer};

fn main() -> io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let addr = "0.0.0.0:8000".parse().unwrap();
    let server = TcpServer::new(&event_loop, addr, "EchoServer-01", ServerOption::default())?;

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!("Connection UP : {}", conn.peer_address());
        } else {
            info!("Connection DOWN : {}", conn.peer_address());
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
        conn.shutdown();
    }));
    server.set_thread_num(3);

    server.start();
    event_loop.run();
    Ok(())
}
