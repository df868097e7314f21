use std::cell::Cell;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use log::{debug, error, info};

use crate::channel::Channel;
use crate::poller::{self, ChannelList, Poller};
use crate::timestamp::Timestamp;
use crate::waker::Waker;

/// Work item posted to a loop from any thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// How long one demultiplexer wait may block.
const POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    // One loop per thread, enforced at construction.
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(ptr::null()) };
}

/// A single-threaded cooperative I/O driver.
///
/// Each loop is owned by the thread that created it and alternates between
/// waiting for fd readiness, dispatching ready channels and draining work
/// posted by other threads. Every mutation of the loop's demultiplexer
/// happens on the owning thread; other threads inject work through
/// [`run_in_loop`](EventLoop::run_in_loop) /
/// [`queue_in_loop`](EventLoop::queue_in_loop), which wake an in-progress
/// wait through an eventfd.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    poll_return_micros: AtomicI64,
    poller: Mutex<Box<dyn Poller>>,
    waker: Arc<Waker>,
    wakeup_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates the loop owned by the calling thread.
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        CURRENT_LOOP.with(|current| {
            if !current.get().is_null() {
                error!(
                    "another EventLoop already exists in thread {:?}",
                    thread::current().id()
                );
                panic!("another EventLoop exists in this thread");
            }
        });

        let poller = poller::new_default_poller()?;
        let waker = Arc::new(Waker::new()?);
        let wakeup_fd = waker.as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak| EventLoop {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            poll_return_micros: AtomicI64::new(0),
            poller: Mutex::new(poller),
            waker: waker.clone(),
            wakeup_channel: Channel::new(weak.clone(), wakeup_fd),
            pending: Mutex::new(Vec::new()),
        });
        CURRENT_LOOP.with(|current| current.set(Arc::as_ptr(&event_loop)));

        // The wakeup channel's only job is to consume the eventfd counter
        // so a level-triggered wait does not spin.
        event_loop
            .wakeup_channel
            .set_read_callback(Box::new(move |_| waker.drain()));
        event_loop.wakeup_channel.enable_reading();

        debug!(
            "EventLoop {:p} created in thread {:?}",
            Arc::as_ptr(&event_loop),
            thread::current().id()
        );
        Ok(event_loop)
    }

    /// Runs the loop until [`quit`](EventLoop::quit).
    ///
    /// Must be called on the owning thread.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop::run() called off the owning thread"
        );
        self.looping.store(true, Ordering::Release);
        info!("EventLoop {:p} start looping", self);

        let mut active: ChannelList = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let poll_return_time = self
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIMEOUT_MS, &mut active);
            self.poll_return_micros
                .store(poll_return_time.micros(), Ordering::Release);
            for channel in &active {
                channel.handle_event(poll_return_time);
            }
            self.do_pending_tasks();
        }

        info!("EventLoop {:p} stop looping", self);
        self.looping.store(false, Ordering::Release);
    }

    /// Makes the loop exit after the current poll-and-drain cycle. Safe to
    /// call from any thread; an off-thread call interrupts an in-progress
    /// wait.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.waker.wake();
        }
    }

    /// Runs `task` on the owning thread: synchronously when already there,
    /// otherwise queued.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the next pending drain.
    ///
    /// Wakes the loop when called off-thread, and also while the drain
    /// itself is running: a pending task may post new work, which must be
    /// picked up right after the current drain rather than after the next
    /// readiness event.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.waker.wake();
        }
    }

    /// Wall clock at which the last demultiplexer wait returned.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.poll_return_micros.load(Ordering::Acquire))
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.lock().unwrap().remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.poller.lock().unwrap().has_channel(channel)
    }

    // Swap the queue out under the lock so re-entrant queue_in_loop calls
    // accumulate for the next drain instead of deadlocking or re-entering
    // this one.
    fn do_pending_tasks(&self) {
        let mut tasks = Vec::new();
        self.calling_pending.store(true, Ordering::Release);
        {
            let mut pending = self.pending.lock().unwrap();
            mem::swap(&mut tasks, &mut *pending);
        }
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("EventLoop {:p} destroyed", self as *const EventLoop);
        CURRENT_LOOP.with(|current| {
            if ptr::eq(current.get(), self) {
                current.set(ptr::null());
            }
        });
    }
}
