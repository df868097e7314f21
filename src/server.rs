use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info, warn};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::event_loop_thread::ThreadInitCallback;
use crate::net::Socket;
use crate::thread_pool::EventLoopThreadPool;

/// Listening-socket options for a new server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerOption {
    /// `SO_REUSEADDR` only.
    #[default]
    NoReusePort,
    /// Additionally set `SO_REUSEPORT`.
    ReusePort,
}

/// A multi-reactor TCP server.
///
/// The acceptor runs on the loop passed to [`new`](TcpServer::new) (the
/// main loop); accepted connections are handed to a pool of I/O loops in
/// round-robin order. Each connection lives on exactly one I/O loop; the
/// server's name→connection table is mutated only on the main loop.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    event_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    started: AtomicU32,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
}

impl TcpServer {
    /// Creates a server listening on `listen_addr` once started.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop, listen_addr, option == ServerOption::ReusePort)?;
        let inner = Arc::new(ServerInner {
            event_loop: event_loop.clone(),
            ip_port: listen_addr.to_string(),
            name: name.clone(),
            acceptor,
            pool: Mutex::new(EventLoopThreadPool::new(event_loop.clone(), name)),
            started: AtomicU32::new(0),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(socket, peer_addr);
                }
            }));
        Ok(TcpServer { inner })
    }

    /// The server's name, used as the connection-name prefix.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configured listen endpoint as text.
    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// The actually bound address; useful after binding port 0.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    /// Sets the number of I/O loop threads; call before
    /// [`start`](TcpServer::start). Zero keeps all I/O on the main loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    /// Callback for connections coming up and going down.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock().unwrap() = Some(cb);
    }

    /// Callback for bytes arriving on any connection.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock().unwrap() = Some(cb);
    }

    /// Callback for a connection's output buffer fully draining.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock().unwrap() = Some(cb);
    }

    /// Callback run on each I/O loop thread before it starts looping.
    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.inner.thread_init_cb.lock().unwrap() = Some(cb);
    }

    /// Spawns the pool and starts listening. Idempotent; only the first
    /// call has an effect, later calls are counted and logged.
    pub fn start(&self) {
        let starts = self.inner.started.fetch_add(1, Ordering::AcqRel);
        if starts > 0 {
            warn!("TcpServer::start [{}] called {} times", self.inner.name, starts + 1);
            return;
        }
        let init = self.inner.thread_init_cb.lock().unwrap().clone();
        self.inner.pool.lock().unwrap().start(init);

        let acceptor = self.inner.acceptor.clone();
        self.inner.event_loop.run_in_loop(move || acceptor.listen());
    }
}

impl ServerInner {
    // Runs on the main loop's thread, straight from the acceptor.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        let io_loop = self.pool.lock().unwrap().next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = socket.local_addr().unwrap_or_else(|err| {
            error!("getsockname for {} failed: {}", conn_name, err);
            SocketAddr::from(([0, 0, 0, 0], 0))
        });

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak: Weak<ServerInner> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection(conn);
            }
        }));

        let conn = conn.clone();
        io_loop.run_in_loop(move || conn.connect_established());
    }

    // Invoked from the connection's I/O loop; hops to the main loop where
    // the table lives.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let inner = self.clone();
        let conn = conn.clone();
        self.event_loop
            .run_in_loop(move || inner.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        self.connections.lock().unwrap().remove(conn.name());
        let conn = conn.clone();
        conn.owner_loop()
            .clone()
            .queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let connections: Vec<TcpConnectionPtr> = self
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let owner = conn.owner_loop().clone();
            owner.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
