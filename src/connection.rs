use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::{self, Socket};
use crate::timestamp::Timestamp;

/// Shared handle to a connection.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked when a connection is established and again when it goes down.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked with freshly received bytes.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
/// Invoked once the output buffer has fully drained into the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked when the output buffer crosses the high-water mark upward.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

/// One accepted TCP connection, owned by a single I/O loop.
///
/// All I/O and state transitions happen on the owning loop's thread;
/// [`send`](TcpConnection::send) and [`shutdown`](TcpConnection::shutdown)
/// may be called from anywhere and hop onto that thread when needed. The
/// server's table, the channel tie and in-flight posted work share the
/// value through `Arc`, and the connection is destroyed only after all of
/// them let go.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        if let Err(err) = socket.set_keep_alive(true) {
            warn!("SO_KEEPALIVE on {} failed: {}", name, err);
        }
        let channel = Channel::new(Arc::downgrade(&event_loop), socket.as_raw_fd());
        let conn = Arc::new(TcpConnection {
            event_loop,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        });
        debug!("TcpConnection::new [{}] fd={}", conn.name, conn.channel.fd());

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback({
            let weak = weak.clone();
            Box::new(move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            })
        });
        conn.channel.set_write_callback({
            let weak = weak.clone();
            Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            })
        });
        conn.channel.set_close_callback({
            let weak = weak.clone();
            Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            })
        });
        conn.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));
        conn
    }

    /// The server-assigned connection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Our end of the connection.
    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer's end of the connection.
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the connection is currently established.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Whether the connection has fully gone down.
    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// The loop this connection lives on.
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Installs the up/down callback.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the incoming-data callback.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the output-drained callback.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the back-pressure callback, fired at most once per upward
    /// crossing of `mark` bytes of unsent output.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_cb.lock().unwrap() = Some(cb);
        self.high_water_mark.store(mark, Ordering::Release);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// Toggles Nagle's algorithm on the underlying socket.
    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = self.socket.set_tcp_no_delay(on) {
            error!("TCP_NODELAY on {} failed: {}", self.name, err);
        }
    }

    /// Sends `data`, inline when called on the owning loop's thread and
    /// posted to it otherwise. No-op unless connected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Half-closes the write side once the output buffer has drained.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Re-enables read interest after [`stop_read`](TcpConnection::stop_read).
    pub fn start_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.event_loop.run_in_loop(move || {
            if !conn.reading.load(Ordering::Acquire) || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.store(true, Ordering::Release);
            }
        });
    }

    /// Stops reading from the socket; the peer will experience TCP
    /// back-pressure once its window fills.
    pub fn stop_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.event_loop.run_in_loop(move || {
            if conn.reading.load(Ordering::Acquire) || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.store(false, Ordering::Release);
            }
        });
    }

    /// Completes establishment on the owning loop: ties the channel, arms
    /// read interest and runs the user's connection callback.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        debug_assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        let owner: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(Arc::downgrade(&owner));
        self.channel.enable_reading();

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    /// Final teardown on the owning loop; runs after the server has
    /// dropped its table entry.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                if let Some(cb) = self.message_cb.lock().unwrap().clone() {
                    cb(self, &mut input, receive_time);
                }
            }
            Err(err) => {
                drop(input);
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            trace!("connection fd={} is down, no more writing", self.channel.fd());
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                        let conn = self.clone();
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) => {
                error!("TcpConnection::handle_write [{}]: {}", self.name, err);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        trace!("fd={} closing in state {:?}", self.channel.fd(), self.state());
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let conn = self.clone();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(&conn);
        }
        // Tells the server to drop its table entry and schedule the final
        // teardown on this loop.
        if let Some(cb) = self.close_cb.lock().unwrap().clone() {
            cb(&conn);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) | Err(err) => {
                error!("TcpConnection::handle_error [{}]: {}", self.name, err);
            }
            Ok(None) => {}
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if self.state() == State::Disconnected {
            warn!("[{}] disconnected, giving up writing", self.name);
            return;
        }

        let mut nwrote = 0;
        let mut remaining = data.len();
        let mut fault = false;

        // Try the socket directly only when nothing is queued ahead of
        // this payload, otherwise bytes would be reordered.
        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match net::write(self.channel.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                            let conn = self.clone();
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                        if matches!(err.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output_buffer.lock().unwrap();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if mark > 0 && old_len < mark && old_len + remaining >= mark {
                if let Some(cb) = self.high_water_mark_cb.lock().unwrap().clone() {
                    let conn = self.clone();
                    let queued = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        // Still writing means the output buffer has not drained yet;
        // handle_write will come back here once it has.
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("shutdown_write [{}]: {}", self.name, err);
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        info!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}
