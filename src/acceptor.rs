use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::Socket;

/// Invoked on the acceptor's loop with each accepted connection.
pub type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send + Sync>;

/// Owns the listening socket and turns its readiness into accepted
/// connections delivered through a callback.
///
/// Lives on the server's main loop. One connection is accepted per
/// readiness report; with no callback installed the accepted socket is
/// dropped, closing the fd.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds a non-blocking listening socket to `listen_addr`.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking()?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;

        let channel = Channel::new(Arc::downgrade(event_loop), socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            socket,
            channel,
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    /// Installs the callback receiving accepted connections.
    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    /// Arms the socket and enables read interest. Must run on the owning
    /// loop's thread.
    pub fn listen(self: &Arc<Self>) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        self.listening.store(true, Ordering::Release);
        if let Err(err) = self.socket.listen() {
            error!("listen failed: {}", err);
            panic!("listen failed: {}", err);
        }
        self.channel.enable_reading();
    }

    /// Whether [`listen`](Acceptor::listen) has run.
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The bound address, which carries the real port after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn handle_read(&self) {
        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                let cb = self.new_connection_cb.lock().unwrap();
                if let Some(cb) = cb.as_ref() {
                    cb(socket, peer_addr);
                }
            }
            Err(err) => {
                error!("accept failed: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    error!("accept hit the process fd limit");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
