use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

const HUP_EVENT: u32 = libc::EPOLLHUP as u32;
const ERROR_EVENT: u32 = libc::EPOLLERR as u32;
const IN_EVENT: u32 = libc::EPOLLIN as u32;

/// Registration state of a channel within its loop's demultiplexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Membership {
    /// Never registered.
    New,
    /// Present in the fd map and in the kernel interest set.
    Added,
    /// Present in the fd map but withdrawn from the kernel interest set.
    Deleted,
}

impl Membership {
    fn from_u8(v: u8) -> Membership {
        match v {
            0 => Membership::New,
            1 => Membership::Added,
            _ => Membership::Deleted,
        }
    }
}

pub(crate) type ReadCallback = Box<dyn Fn(Timestamp) + Send + Sync>;
pub(crate) type EventCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Binds one fd to its interest set and event handlers within one loop.
///
/// A channel never owns its fd; the acceptor, connection or loop that
/// created it does. Handlers run only on the owning loop's thread. The
/// optional `tie` holds a weak reference to the channel's higher-level
/// owner; each dispatch promotes it to a strong reference for the span of
/// the call, so handlers cannot run against an owner that has already been
/// destroyed on another thread.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    membership: AtomicU8,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    handlers: Mutex<Handlers>,
}

impl Channel {
    pub(crate) fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            event_loop,
            fd,
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            membership: AtomicU8::new(Membership::New as u8),
            tie: Mutex::new(None),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    /// The fd this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    pub(crate) fn membership(&self) -> Membership {
        Membership::from_u8(self.membership.load(Ordering::Acquire))
    }

    pub(crate) fn set_membership(&self, membership: Membership) {
        self.membership.store(membership as u8, Ordering::Release);
    }

    pub(crate) fn set_read_callback(&self, cb: ReadCallback) {
        self.handlers.lock().unwrap().read = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().write = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().close = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().error = Some(cb);
    }

    /// Ties this channel to its owner; dispatch is skipped once the owner
    /// is gone.
    pub(crate) fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(owner);
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    pub(crate) fn enable_reading(self: &Arc<Self>) {
        self.events.fetch_or(READ_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_reading(self: &Arc<Self>) {
        self.events.fetch_and(!READ_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn enable_writing(self: &Arc<Self>) {
        self.events.fetch_or(WRITE_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_writing(self: &Arc<Self>) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_all(self: &Arc<Self>) {
        self.events.store(NONE_EVENT, Ordering::Release);
        self.update();
    }

    /// Withdraws this channel from its loop's demultiplexer.
    pub(crate) fn remove(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Dispatches the last reported readiness to the handlers, holding the
    /// tied owner alive for the duration of the call.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.tie.lock().unwrap().clone();
        match tie {
            Some(owner) => {
                if let Some(_guard) = owner.upgrade() {
                    self.handle_event_guarded(receive_time);
                }
            }
            None => self.handle_event_guarded(receive_time),
        }
    }

    fn handle_event_guarded(&self, receive_time: Timestamp) {
        let revents = self.revents.load(Ordering::Acquire);
        trace!("channel fd={} dispatching revents {:#x}", self.fd, revents);

        let handlers = self.handlers.lock().unwrap();
        // Hangup with nothing left to read means the peer is gone.
        if revents & HUP_EVENT != 0 && revents & IN_EVENT == 0 {
            if let Some(cb) = &handlers.close {
                cb();
            }
        }
        if revents & ERROR_EVENT != 0 {
            if let Some(cb) = &handlers.error {
                cb();
            }
        }
        if revents & READ_EVENT != 0 {
            if let Some(cb) = &handlers.read {
                cb(receive_time);
            }
        }
        if revents & WRITE_EVENT != 0 {
            if let Some(cb) = &handlers.write {
                cb();
            }
        }
    }
}
