//! A multi-reactor non-blocking TCP server library.
//!
//! `evio` runs one event loop per thread: a main loop owns the listening
//! socket and each of N I/O loops owns a disjoint set of connections, so
//! no lock is ever contended on the data path. Readiness comes from
//! level-triggered epoll (or poll(2), selected through the environment),
//! cross-thread wakeups from an eventfd, and all socket I/O is
//! non-blocking with per-connection input/output buffers.
//!
//! # Example
//!
//! An echo server on three I/O threads:
//!
//! ```no_run
//! use std::sync::Arc;
//! use evio::{EventLoop, ServerOption, TcpServer};
//!
//! # fn main() -> std::io::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let server = TcpServer::new(
//!     &event_loop,
//!     "0.0.0.0:8000".parse().unwrap(),
//!     "echo",
//!     ServerOption::default(),
//! )?;
//! server.set_thread_num(3);
//! server.set_message_callback(Arc::new(|conn, buf, _when| {
//!     let msg = buf.retrieve_all_as_string();
//!     conn.send(msg.as_bytes());
//! }));
//! server.start();
//! event_loop.run();
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod event_loop_thread;
pub mod net;
mod poller;
mod server;
mod thread_pool;
mod timestamp;
mod waker;

pub use crate::acceptor::{Acceptor, NewConnectionCallback};
pub use crate::buffer::Buffer;
pub use crate::channel::Channel;
pub use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use crate::event_loop::{EventLoop, Task};
pub use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use crate::server::{ServerOption, TcpServer};
pub use crate::thread_pool::EventLoopThreadPool;
pub use crate::timestamp::Timestamp;
